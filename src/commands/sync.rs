//! Sync command handler: one incremental run.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context as _, Result};
use tracing::{info, warn};
use tripsync_core::{Database, HttpClient, RunOptions, SqliteTableLoader, SyncEngine, SyncReport};

use super::{Context, exit_code, print_json};
use crate::cli::SyncArgs;

pub async fn run_sync_command(ctx: &Context, args: &SyncArgs) -> Result<ExitCode> {
    let mut config = ctx.config.clone();
    if let Some(concurrency) = args.concurrency {
        config.concurrency = usize::from(concurrency);
    }
    let paths = config.paths();

    let client = HttpClient::with_timeouts(config.connect_timeout_secs, config.read_timeout_secs)?;
    let warehouse = Database::open_unmigrated(&paths.warehouse_db, config.database_options())
        .await
        .with_context(|| format!("opening warehouse {}", paths.warehouse_db.display()))?;
    let loader = Arc::new(SqliteTableLoader::new(warehouse.clone()));

    let engine = SyncEngine::from_config(&config, ctx.store.clone(), Arc::new(client), loader);

    // First Ctrl-C stops new items; in-flight items finish
    let interrupt = engine.interrupt_flag();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight items");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let options = RunOptions {
        force_download: args.force_download,
        force_ingest: args.force_ingest,
        dry_run: args.dry_run,
        limit: args.limit,
        most_recent_first: args.most_recent_first,
        strict: args.strict || config.strict_ingest,
    };
    let result = engine.run(&options).await;
    signal_task.abort();
    warehouse.close().await;
    let report = result?;

    if ctx.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    info!(issues = report.issues.len(), "sync finished");

    Ok(exit_code(
        report.failed == 0 && report.ingest_failed == 0 && !report.interrupted,
    ))
}

fn print_report(report: &SyncReport) {
    if report.dry_run {
        println!(
            "Dry run: {} of {} listed object(s) would be processed.",
            report.planned, report.listed
        );
        for name in &report.planned_items {
            println!("- {name}");
        }
        return;
    }

    println!(
        "Listed {}, planned {}: {} downloaded, {} unchanged, {} failed, {} suspicious.",
        report.listed,
        report.planned,
        report.downloaded,
        report.skipped,
        report.failed,
        report.suspicious
    );
    println!(
        "Loaded {} file(s), {} load failure(s), {} retried fetch(es).",
        report.ingested, report.ingest_failed, report.retried
    );
    if report.interrupted {
        println!("Interrupted before every item started; rerun to continue.");
    }
    for issue in &report.issues {
        println!("! {}: {}", issue.file_name, issue.message);
    }
}
