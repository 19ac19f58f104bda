//! Per-run sync pipeline on a bounded worker pool.
//!
//! # Concurrency Model
//!
//! - The run lock excludes concurrent runs and deduplication
//! - Each work item runs in its own Tokio task behind a semaphore permit
//! - Items are independent; one item's failure never stops another
//! - Store writes serialize on the store's write lock, warehouse loads on
//!   the loader's lock
//! - Setting the interrupt flag stops new items from starting; items already
//!   in flight finish
//!
//! # Per-item order
//!
//! fetch (with retries) → classify/archive → commit → download event →
//! extract → load each delimited file → ingestion log → metadata upsert

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::fetcher::{FetchFailure, Fetcher, Staged};
use super::integrity::IntegrityGuard;
use super::rollback::RollbackArchiver;
use super::{SyncError, SyncIssue, WorkSetPolicy};
use crate::config::{SyncConfig, SyncPaths};
use crate::download::{DownloadError, RetryDecision, RetryPolicy, Transfer, classify_error};
use crate::hasher::FileDigest;
use crate::ingest::{ArchiveExtractor, IngestError, TableLoader, ZipExtractor};
use crate::lock::RunLock;
use crate::remote::{RemoteListing, RemoteObjectRecord, S3Listing, is_safe_object_name};
use crate::store::{
    DownloadEvent, FileMetadataRecord, IngestionLogEntry, IngestionStatus, Store,
};

/// Operational controls for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Refetch every item even when the local copy matches.
    pub force_download: bool,
    /// Bypass the diff and reload every item.
    pub force_ingest: bool,
    /// Plan only; no download, archive, extraction, load or store write.
    pub dry_run: bool,
    /// Only consider the first N listed objects (after ordering).
    pub limit: Option<usize>,
    /// Order by embedded date token, newest first.
    pub most_recent_first: bool,
    /// Reject files with malformed rows.
    pub strict: bool,
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Objects listed remotely (after the suffix filter).
    pub listed: usize,
    /// Items in the work set.
    pub planned: usize,
    /// Items whose fresh bytes were committed.
    pub downloaded: usize,
    /// Items whose local copy was trusted.
    pub skipped: usize,
    /// Items that could not be fetched or committed.
    pub failed: usize,
    /// Replacements flagged as suspicious.
    pub suspicious: usize,
    /// Delimited files loaded.
    pub ingested: usize,
    /// Extractions or loads that failed or were rejected.
    pub ingest_failed: usize,
    /// Fetch retries made.
    pub retried: usize,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Whether the interrupt flag stopped the run early.
    pub interrupted: bool,
    /// Work set names, in processing order.
    pub planned_items: Vec<String>,
    /// Per-item problems.
    pub issues: Vec<SyncIssue>,
}

#[derive(Debug, Default)]
struct RunStats {
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    suspicious: AtomicUsize,
    ingested: AtomicUsize,
    ingest_failed: AtomicUsize,
    retried: AtomicUsize,
    issues: Mutex<Vec<SyncIssue>>,
}

impl RunStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    async fn issue(&self, file_name: &str, error: &SyncError) {
        self.issues
            .lock()
            .await
            .push(SyncIssue::from_error(file_name, error));
    }

    async fn fill(&self, report: &mut SyncReport) {
        report.downloaded = self.downloaded.load(Ordering::SeqCst);
        report.skipped = self.skipped.load(Ordering::SeqCst);
        report.failed = self.failed.load(Ordering::SeqCst);
        report.suspicious = self.suspicious.load(Ordering::SeqCst);
        report.ingested = self.ingested.load(Ordering::SeqCst);
        report.ingest_failed = self.ingest_failed.load(Ordering::SeqCst);
        report.retried = self.retried.load(Ordering::SeqCst);
        report.issues.extend(self.issues.lock().await.drain(..));
    }
}

/// Everything one item needs, shared across worker tasks.
struct Pipeline {
    store: Store,
    fetcher: Fetcher,
    guard: IntegrityGuard,
    extractor: Arc<dyn ArchiveExtractor>,
    loader: Arc<dyn TableLoader>,
    paths: SyncPaths,
    retry_policy: RetryPolicy,
}

/// Incremental sync of a remote bucket into the local archive and warehouse.
pub struct SyncEngine {
    listing: Arc<dyn RemoteListing>,
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("paths", &self.pipeline.paths)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Builds an engine listing the configured bucket through `transfer`,
    /// extracting with [`ZipExtractor`] and loading through `loader`.
    #[must_use]
    pub fn from_config(
        config: &SyncConfig,
        store: Store,
        transfer: Arc<dyn Transfer>,
        loader: Arc<dyn TableLoader>,
    ) -> Self {
        let listing: Arc<dyn RemoteListing> = Arc::new(S3Listing::new(
            Arc::clone(&transfer),
            &config.endpoint_url(),
            &config.object_suffix,
        ));
        Self::new(
            config,
            store,
            transfer,
            listing,
            Arc::new(ZipExtractor),
            loader,
        )
    }

    /// Builds an engine from explicit collaborators.
    #[must_use]
    pub fn new(
        config: &SyncConfig,
        store: Store,
        transfer: Arc<dyn Transfer>,
        listing: Arc<dyn RemoteListing>,
        extractor: Arc<dyn ArchiveExtractor>,
        loader: Arc<dyn TableLoader>,
    ) -> Self {
        let paths = config.paths();
        let archiver = RollbackArchiver::new(
            store.clone(),
            paths.rollback_dir.clone(),
            paths.download_dir.clone(),
        );
        let fetcher = Fetcher::new(
            transfer,
            Arc::clone(&listing),
            paths.download_dir.clone(),
            config.fetch_timeout(),
        );

        debug!(
            concurrency = config.concurrency,
            max_retries = config.max_retries,
            download_dir = %paths.download_dir.display(),
            "creating sync engine"
        );

        Self {
            listing,
            pipeline: Arc::new(Pipeline {
                store,
                fetcher,
                guard: IntegrityGuard::new(config.integrity.clone(), Arc::new(archiver)),
                extractor,
                loader,
                paths,
                retry_policy: config.retry_policy(),
            }),
            concurrency: config.concurrency.max(1),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the fetch retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        if let Some(pipeline) = Arc::get_mut(&mut self.pipeline) {
            pipeline.retry_policy = retry_policy;
        }
        self
    }

    /// Shares an externally controlled interrupt flag (e.g. set on Ctrl-C).
    #[must_use]
    pub fn with_interrupt_flag(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Flag that stops new items from starting when set.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Runs one sync.
    ///
    /// Per-item failures never fail the run; they are counted and listed
    /// in [`SyncReport::issues`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockHeld`] if another run or deduplication
    /// holds the lock, [`SyncError::Listing`] if the bucket cannot be
    /// listed, or [`SyncError::Store`] if metadata cannot be loaded.
    #[instrument(skip(self, options), fields(dry_run = options.dry_run, strict = options.strict))]
    pub async fn run(&self, options: &RunOptions) -> Result<SyncReport, SyncError> {
        let _lock = RunLock::try_acquire(&self.pipeline.paths.lock_file)?;
        let store = &self.pipeline.store;

        let listed = self.listing.list().await?;
        let mut report = SyncReport {
            listed: listed.len(),
            dry_run: options.dry_run,
            ..SyncReport::default()
        };

        let (safe, unsafe_names): (Vec<_>, Vec<_>) =
            listed.into_iter().partition(|o| is_safe_object_name(&o.name));
        for object in unsafe_names {
            let name = object.name;
            let error = SyncError::UnsafeName { name: name.clone() };
            warn!(%error, "skipping listed object");
            report.issues.push(SyncIssue::from_error(&name, &error));
        }

        let known = store.load_all_metadata().await?;
        let policy = WorkSetPolicy {
            force: options.force_download || options.force_ingest,
            most_recent_first: options.most_recent_first,
            limit: options.limit,
            retired: store.retired_files().await?,
        };
        let work_set = policy.select(&safe, &known);
        report.planned = work_set.len();
        report.planned_items = work_set.iter().map(|o| o.name.clone()).collect();

        info!(
            listed = report.listed,
            planned = report.planned,
            "work set computed"
        );

        if options.dry_run {
            for object in &work_set {
                info!(file = %object.name, size = object.size, "[dry run] would fetch");
            }
            return Ok(report);
        }
        if work_set.is_empty() {
            info!("no new or updated files");
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let stats = Arc::new(RunStats::default());
        let mut handles = Vec::with_capacity(work_set.len());

        for object in work_set {
            if self.interrupt.load(Ordering::SeqCst) {
                report.interrupted = true;
                warn!("interrupted, not starting remaining items");
                break;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            // Flag may have been set while waiting for a slot
            if self.interrupt.load(Ordering::SeqCst) {
                report.interrupted = true;
                warn!("interrupted, not starting remaining items");
                break;
            }

            let pipeline = Arc::clone(&self.pipeline);
            let stats = Arc::clone(&stats);
            let options = options.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                pipeline.process(&object, &options, &stats).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "sync task panicked");
            }
        }

        stats.fill(&mut report).await;
        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            suspicious = report.suspicious,
            ingested = report.ingested,
            ingest_failed = report.ingest_failed,
            "sync complete"
        );
        Ok(report)
    }
}

/// Name the ingestion log records when no delimited file was reached.
fn delimited_label(archive_name: &str) -> String {
    let stem = Path::new(archive_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(archive_name);
    format!("{stem}.csv")
}

impl Pipeline {
    #[instrument(skip(self, object, options, stats), fields(file = %object.name))]
    async fn process(&self, object: &RemoteObjectRecord, options: &RunOptions, stats: &RunStats) {
        if let Err(error) = self.process_inner(object, options, stats).await {
            warn!(%error, "item failed");
            stats.issue(&object.name, &error).await;
        }
    }

    async fn process_inner(
        &self,
        object: &RemoteObjectRecord,
        options: &RunOptions,
        stats: &RunStats,
    ) -> Result<(), SyncError> {
        let name = object.name.as_str();
        let previous = self.store.get_metadata(name).await?;

        let staged = match self.stage_with_retry(object, options.force_download, stats).await {
            Ok(staged) => staged,
            Err(failure) => {
                RunStats::bump(&stats.failed);
                return Err(SyncError::NetworkFailure {
                    file_name: name.to_string(),
                    source: failure.error,
                });
            }
        };

        let (event, digest, must_ingest) = match staged {
            Staged::Trusted(trusted) => {
                self.store.append_download_event(&trusted.event).await?;
                RunStats::bump(&stats.skipped);
                let stored = previous.as_ref().and_then(|p| p.content_fingerprint.as_deref());
                let must_ingest =
                    options.force_ingest || stored != Some(trusted.digest.sha256.as_str());
                (trusted.event, trusted.digest, must_ingest)
            }
            Staged::Fresh(staged) => {
                let inspection = match self.guard.inspect(previous.as_ref(), &staged).await {
                    Ok(inspection) => inspection,
                    Err(error) => {
                        let event = self.fetcher.discard(&staged).await;
                        self.store.append_download_event(&event).await?;
                        RunStats::bump(&stats.failed);
                        return Err(error);
                    }
                };
                if let Some(reason) = inspection.verdict.reason {
                    RunStats::bump(&stats.suspicious);
                    stats
                        .issue(
                            name,
                            &SyncError::SuspiciousReplacement {
                                file_name: name.to_string(),
                                reason: reason.to_string(),
                            },
                        )
                        .await;
                }

                let digest = staged.digest.clone();
                let event = match self.fetcher.commit(staged).await {
                    Ok(event) => event,
                    Err(failure) => {
                        self.store.append_download_event(&failure.event).await?;
                        RunStats::bump(&stats.failed);
                        return Err(match failure.error {
                            DownloadError::Io { path, source } => SyncError::Io { path, source },
                            source => SyncError::NetworkFailure {
                                file_name: name.to_string(),
                                source,
                            },
                        });
                    }
                };
                self.store.append_download_event(&event).await?;
                RunStats::bump(&stats.downloaded);
                (event, digest, true)
            }
        };

        if must_ingest {
            self.ingest(name, &event, options.strict, stats).await?;
        } else {
            debug!("content unchanged, load skipped");
        }

        self.store
            .upsert_metadata(&metadata_for(object, &event, &digest))
            .await?;
        Ok(())
    }

    async fn stage_with_retry(
        &self,
        object: &RemoteObjectRecord,
        force: bool,
        stats: &RunStats,
    ) -> Result<Staged, FetchFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .fetcher
                .stage(&object.name, &object.remote_fingerprint, force)
                .await
            {
                Ok(staged) => return Ok(staged),
                Err(failure) => {
                    // Each attempt leaves its own trail
                    if let Err(error) = self.store.append_download_event(&failure.event).await {
                        warn!(%error, "failed to record failed attempt");
                    }
                    match self
                        .retry_policy
                        .should_retry(classify_error(&failure.error), attempt)
                    {
                        RetryDecision::Retry {
                            delay,
                            attempt: next_attempt,
                        } => {
                            info!(
                                attempt = next_attempt,
                                max_attempts = self.retry_policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                error = %failure.error,
                                "retrying fetch"
                            );
                            RunStats::bump(&stats.retried);
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%reason, "not retrying fetch");
                            return Err(failure);
                        }
                    }
                }
            }
        }
    }

    /// Extracts the archive and loads every delimited file in it, logging
    /// one ingestion entry per attempt. Load failures are recorded, not
    /// returned; only store failures propagate.
    async fn ingest(
        &self,
        name: &str,
        event: &DownloadEvent,
        strict: bool,
        stats: &RunStats,
    ) -> Result<(), SyncError> {
        let archive = self.fetcher.live_path(name);
        let dest = self.paths.extract_dir_for(name);

        let started = Utc::now();
        let clock = Instant::now();
        let files = match self.extractor.extract(&archive, &dest).await {
            Ok(files) if files.is_empty() => {
                let error = SyncError::from_ingest(
                    name,
                    IngestError::corrupt_archive(&archive, "archive holds no delimited files"),
                );
                self.record_failed_load(&delimited_label(name), event, strict, started, clock, &error)
                    .await?;
                RunStats::bump(&stats.ingest_failed);
                stats.issue(name, &error).await;
                return Ok(());
            }
            Ok(files) => files,
            Err(error) => {
                let error = SyncError::from_ingest(name, error);
                self.record_failed_load(&delimited_label(name), event, strict, started, clock, &error)
                    .await?;
                RunStats::bump(&stats.ingest_failed);
                stats.issue(name, &error).await;
                return Ok(());
            }
        };

        for file in files {
            self.load_one(&file, event, strict, stats).await?;
        }
        Ok(())
    }

    async fn load_one(
        &self,
        file: &Path,
        event: &DownloadEvent,
        strict: bool,
        stats: &RunStats,
    ) -> Result<(), SyncError> {
        let label = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let started = Utc::now();
        let clock = Instant::now();

        match self.loader.load(file, strict).await {
            Ok(outcome) => {
                self.store
                    .append_ingestion_entry(&IngestionLogEntry {
                        id: 0,
                        file_name: label,
                        fetch_id: Some(event.fetch_id.clone()),
                        table_name: Some(outcome.table_name),
                        strict,
                        started_at: started,
                        finished_at: Utc::now(),
                        duration_ms: elapsed_ms(clock),
                        status: IngestionStatus::Success,
                        inserted_rows: outcome.inserted_rows,
                        reject_count: outcome.reject_count,
                        message: None,
                    })
                    .await?;
                RunStats::bump(&stats.ingested);
            }
            Err(error) => {
                let (table_name, reject_count) = match &error {
                    IngestError::MalformedRows {
                        table_name,
                        reject_count,
                        ..
                    } => (Some(table_name.clone()), *reject_count),
                    _ => (None, 0),
                };
                let status = if reject_count > 0 {
                    IngestionStatus::Rejected
                } else {
                    IngestionStatus::Failed
                };
                let message = error.to_string();
                let error = SyncError::from_ingest(&label, error);
                warn!(file = %label, %error, "load failed");

                self.store
                    .append_ingestion_entry(&IngestionLogEntry {
                        id: 0,
                        file_name: label.clone(),
                        fetch_id: Some(event.fetch_id.clone()),
                        table_name,
                        strict,
                        started_at: started,
                        finished_at: Utc::now(),
                        duration_ms: elapsed_ms(clock),
                        status,
                        inserted_rows: 0,
                        reject_count,
                        message: Some(message),
                    })
                    .await?;
                RunStats::bump(&stats.ingest_failed);
                stats.issue(&label, &error).await;
            }
        }
        Ok(())
    }

    async fn record_failed_load(
        &self,
        label: &str,
        event: &DownloadEvent,
        strict: bool,
        started: chrono::DateTime<Utc>,
        clock: Instant,
        error: &SyncError,
    ) -> Result<(), SyncError> {
        warn!(file = %label, %error, "extraction failed");
        self.store
            .append_ingestion_entry(&IngestionLogEntry {
                id: 0,
                file_name: label.to_string(),
                fetch_id: Some(event.fetch_id.clone()),
                table_name: None,
                strict,
                started_at: started,
                finished_at: Utc::now(),
                duration_ms: elapsed_ms(clock),
                status: IngestionStatus::Failed,
                inserted_rows: 0,
                reject_count: 0,
                message: Some(error.to_string()),
            })
            .await?;
        Ok(())
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn metadata_for(
    object: &RemoteObjectRecord,
    event: &DownloadEvent,
    digest: &FileDigest,
) -> FileMetadataRecord {
    FileMetadataRecord {
        file_name: object.name.clone(),
        size: object.size,
        last_modified: object.last_modified,
        remote_fingerprint: object.remote_fingerprint.clone(),
        content_fingerprint: Some(digest.sha256.clone()),
        fetch_time: event.fetch_time,
        fetch_id: Some(event.fetch_id.clone()),
    }
}
