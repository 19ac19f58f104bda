//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use tripsync_core::RetentionPolicy;

/// Incremental, integrity-verified sync of published trip data archives.
///
/// Mirrors a bucket of archives locally, archives suspicious replacements
/// before overwriting them, and loads the delimited files they contain into
/// a local warehouse.
#[derive(Parser, Debug)]
#[command(name = "tripsync")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// TOML configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the bucket, fetch new or changed archives and load them
    Sync(SyncArgs),
    /// Retire local files whose content duplicates another file
    Dedup(DedupArgs),
    /// Inspect or restore archived copies
    Rollback {
        #[command(subcommand)]
        action: RollbackCommand,
    },
    /// Re-hash local files against recorded fingerprints
    Verify,
    /// Show recent audit log entries
    Log(LogArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Refetch every object even when the local copy matches
    #[arg(long)]
    pub force_download: bool,

    /// Reload every object, bypassing the change check
    #[arg(long)]
    pub force_ingest: bool,

    /// Print the work set without changing anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Only consider the first N listed objects
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Process objects newest first by the date in their name
    #[arg(long)]
    pub most_recent_first: bool,

    /// Reject files with malformed rows instead of skipping the rows
    #[arg(long)]
    pub strict: bool,

    /// Objects fetched in parallel (1-32); overrides the config file
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DedupArgs {
    /// Which copy survives: oldest or newest first-seen
    #[arg(long, value_name = "POLICY")]
    pub retention: Option<RetentionPolicy>,
}

#[derive(Subcommand, Debug)]
pub enum RollbackCommand {
    /// List recent archived copies
    List {
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Copy an archived file back over its live path
    Restore {
        /// Identifier from `rollback list`
        rollback_id: String,
    },
}

/// Audit log to show.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Fetch attempts
    Downloads,
    /// Warehouse loads
    Ingestion,
    /// Retired duplicates
    Duplicates,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LogArgs {
    /// Which log
    #[arg(value_enum, default_value_t = LogKind::Downloads)]
    pub kind: LogKind,

    /// Maximum rows
    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    /// Only fetch attempts for this file (downloads log)
    #[arg(long, value_name = "NAME")]
    pub file: Option<String>,
}
