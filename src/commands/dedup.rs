//! Dedup command handler.

use std::process::ExitCode;

use anyhow::Result;
use serde_json::json;
use tripsync_core::Deduplicator;

use super::{Context, exit_code, print_json};
use crate::cli::DedupArgs;

pub async fn run_dedup_command(ctx: &Context, args: &DedupArgs) -> Result<ExitCode> {
    let retention = args.retention.unwrap_or(ctx.config.retention);
    let paths = ctx.config.paths();
    let report = Deduplicator::new(ctx.store.clone(), paths.download_dir, paths.lock_file)
        .reconcile(retention)
        .await?;

    let failures: Vec<String> = report.failures.iter().map(ToString::to_string).collect();
    if ctx.json {
        print_json(&json!({
            "retention": retention.as_str(),
            "records": report.records,
            "skipped_removals": report.skipped_removals,
            "failures": failures,
        }))?;
    } else if report.records.is_empty() && failures.is_empty() {
        println!("No duplicates found.");
    } else {
        for record in &report.records {
            println!("retired {} (kept {})", record.removed_file, record.retained_file);
        }
        for name in &report.skipped_removals {
            println!("note: {name} was already absent locally");
        }
        for failure in &failures {
            println!("! {failure}");
        }
    }

    Ok(exit_code(failures.is_empty()))
}
