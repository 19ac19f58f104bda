//! CLI entry point for tripsync.

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, info};
use tripsync_core::{Database, Store, SyncConfig};

mod cli;
mod commands;

use cli::{Args, Command, RollbackCommand};
use commands::Context;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr so --json output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = SyncConfig::load(args.config.as_deref())?;
    let paths = config.paths();
    info!(
        bucket = %config.bucket,
        data_dir = %config.data_dir.display(),
        "tripsync starting"
    );

    for dir in [&paths.download_dir, &paths.extract_dir, &paths.rollback_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    for file in [&paths.log_db, &paths.warehouse_db] {
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let db = Database::with_options(&paths.log_db, config.database_options())
        .await
        .with_context(|| format!("opening log database {}", paths.log_db.display()))?;
    let ctx = Context {
        config,
        store: Store::new(db.clone()),
        json: args.json,
    };

    let result = match &args.command {
        Command::Sync(sync) => commands::run_sync_command(&ctx, sync).await,
        Command::Dedup(dedup) => commands::run_dedup_command(&ctx, dedup).await,
        Command::Rollback { action } => match action {
            RollbackCommand::List { limit } => {
                commands::run_rollback_list_command(&ctx, *limit).await
            }
            RollbackCommand::Restore { rollback_id } => {
                commands::run_rollback_restore_command(&ctx, rollback_id).await
            }
        },
        Command::Verify => commands::run_verify_command(&ctx).await,
        Command::Log(log) => commands::run_log_command(&ctx, log).await,
    };

    drop(ctx);
    db.close().await;
    result
}
