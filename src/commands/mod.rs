//! CLI command handlers.

mod dedup;
mod log;
mod rollback;
mod sync;
mod verify;

use std::process::ExitCode;

use anyhow::Result;
use serde::Serialize;
use tripsync_core::{Store, SyncConfig};

pub use dedup::run_dedup_command;
pub use log::run_log_command;
pub use rollback::{run_rollback_list_command, run_rollback_restore_command};
pub use sync::run_sync_command;
pub use verify::run_verify_command;

/// State shared by every command.
pub struct Context {
    pub config: SyncConfig,
    pub store: Store,
    pub json: bool,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
