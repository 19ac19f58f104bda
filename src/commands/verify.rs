//! Verify command handler.

use std::process::ExitCode;

use anyhow::Result;
use tripsync_core::Verifier;

use super::{Context, exit_code, print_json};

pub async fn run_verify_command(ctx: &Context) -> Result<ExitCode> {
    let report = Verifier::new(ctx.store.clone(), ctx.config.paths().download_dir)
        .verify()
        .await?;

    if ctx.json {
        print_json(&report)?;
    } else {
        println!(
            "{} verified, {} missing, {} mismatched.",
            report.verified.len(),
            report.missing.len(),
            report.mismatched.len()
        );
        for name in &report.missing {
            println!("missing: {name}");
        }
        for mismatch in &report.mismatched {
            println!(
                "mismatch: {} expected {} found {}",
                mismatch.file_name, mismatch.expected, mismatch.actual
            );
        }
    }
    Ok(exit_code(report.is_clean()))
}
