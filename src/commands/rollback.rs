//! Rollback command handlers: list archived copies and restore one.

use std::process::ExitCode;

use anyhow::Result;
use tripsync_core::{RollbackArchiver, RunLock};

use super::{Context, print_json};

fn archiver(ctx: &Context) -> RollbackArchiver {
    let paths = ctx.config.paths();
    RollbackArchiver::new(ctx.store.clone(), paths.rollback_dir, paths.download_dir)
}

pub async fn run_rollback_list_command(ctx: &Context, limit: u32) -> Result<ExitCode> {
    let records = archiver(ctx).list_recent(limit).await?;

    if ctx.json {
        print_json(&records)?;
    } else if records.is_empty() {
        println!("No archived copies.");
    } else {
        for record in &records {
            println!(
                "{}  {}  {}  {}",
                record.rollback_id,
                record.replaced_time.format("%Y-%m-%d %H:%M:%S"),
                record.reason,
                record.backup_path.display()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_rollback_restore_command(ctx: &Context, rollback_id: &str) -> Result<ExitCode> {
    // Restores must not race a sync or dedup
    let _lock = RunLock::try_acquire(&ctx.config.paths().lock_file)?;
    let outcome = archiver(ctx).restore(rollback_id).await?;

    if ctx.json {
        print_json(&outcome)?;
    } else {
        println!(
            "Restored {} from {} ({}).",
            outcome.live_path.display(),
            outcome.record.backup_path.display(),
            outcome.restored_fingerprint
        );
    }
    Ok(ExitCode::SUCCESS)
}
