//! Log command handler: recent audit log rows.

use std::process::ExitCode;

use anyhow::Result;

use super::{Context, print_json};
use crate::cli::{LogArgs, LogKind};

pub async fn run_log_command(ctx: &Context, args: &LogArgs) -> Result<ExitCode> {
    match args.kind {
        LogKind::Downloads => {
            let mut events = match &args.file {
                Some(name) => ctx.store.download_events_for(name).await?,
                None => ctx.store.recent_download_events(args.limit).await?,
            };
            events.truncate(usize::try_from(args.limit).unwrap_or(usize::MAX));
            if ctx.json {
                return print_json(&events).map(|()| ExitCode::SUCCESS);
            }
            for event in &events {
                println!(
                    "{}  {:<10}  {}  {}",
                    event.fetch_time.format("%Y-%m-%d %H:%M:%S"),
                    event.status.as_str(),
                    event.file_name,
                    event.content_fingerprint.as_deref().unwrap_or("-")
                );
            }
            if events.is_empty() {
                println!("No download history.");
            }
        }
        LogKind::Ingestion => {
            let entries = ctx.store.recent_ingestion_entries(args.limit).await?;
            if ctx.json {
                return print_json(&entries).map(|()| ExitCode::SUCCESS);
            }
            for entry in &entries {
                println!(
                    "{}  {:<8}  {}  rows={} rejects={}  {}",
                    entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.status.as_str(),
                    entry.file_name,
                    entry.inserted_rows,
                    entry.reject_count,
                    entry.message.as_deref().unwrap_or("")
                );
            }
            if entries.is_empty() {
                println!("No ingestion history.");
            }
        }
        LogKind::Duplicates => {
            let mut records = ctx.store.list_duplicate_records().await?;
            records.truncate(usize::try_from(args.limit).unwrap_or(usize::MAX));
            if ctx.json {
                return print_json(&records).map(|()| ExitCode::SUCCESS);
            }
            for record in &records {
                println!(
                    "{}  {} -> kept {}  ({})",
                    record.removal_time.format("%Y-%m-%d %H:%M:%S"),
                    record.removed_file,
                    record.retained_file,
                    record.reason
                );
            }
            if records.is_empty() {
                println!("No duplicates retired.");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
