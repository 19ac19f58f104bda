//! Retirement of files that duplicate another file's content.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::SyncError;
use crate::lock::RunLock;
use crate::store::{DuplicateRecord, Store};

/// Which member of a duplicate group survives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// The name fetched first.
    #[default]
    Oldest,
    /// The name fetched last.
    Newest,
}

impl RetentionPolicy {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oldest => "oldest",
            Self::Newest => "newest",
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(Self::Oldest),
            "newest" => Ok(Self::Newest),
            _ => Err(format!("invalid retention policy: {s}")),
        }
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// One record per retired file.
    pub records: Vec<DuplicateRecord>,
    /// Files that could not be retired; each is a [`SyncError::RemovalFailure`].
    pub failures: Vec<SyncError>,
    /// Retired files whose local copy was already gone.
    pub skipped_removals: Vec<String>,
}

#[derive(Debug)]
struct Candidate {
    file_name: String,
    first_seen: DateTime<Utc>,
}

/// Finds names sharing a content fingerprint and retires all but one.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    store: Store,
    download_dir: PathBuf,
    lock_path: PathBuf,
}

impl Deduplicator {
    /// Creates a deduplicator over `download_dir`, serialized with sync runs
    /// through the lock at `lock_path`.
    #[must_use]
    pub fn new(store: Store, download_dir: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            store,
            download_dir,
            lock_path,
        }
    }

    /// Retires duplicates under `retention`.
    ///
    /// Per-file failures are collected in the report and do not stop the
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockHeld`] if a sync is running, or
    /// [`SyncError::Store`] if the download log cannot be read.
    #[instrument(skip(self), fields(retention = %retention))]
    pub async fn reconcile(&self, retention: RetentionPolicy) -> Result<ReconcileReport, SyncError> {
        let _lock = RunLock::try_acquire(&self.lock_path)?;
        let mut report = ReconcileReport::default();
        let reason = format!("duplicate ({retention})");

        for (fingerprint, mut members) in self.duplicate_groups().await? {
            members.sort_by(|a, b| {
                a.first_seen
                    .cmp(&b.first_seen)
                    .then_with(|| a.file_name.cmp(&b.file_name))
            });
            if retention == RetentionPolicy::Newest {
                members.reverse();
            }

            let mut survivor = None;
            for member in &members {
                if tokio::fs::try_exists(self.download_dir.join(&member.file_name))
                    .await
                    .unwrap_or(false)
                {
                    survivor = Some(member.file_name.clone());
                    break;
                }
            }
            let Some(retained) = survivor else {
                warn!(%fingerprint, members = members.len(), "no local copy in duplicate group, left untouched");
                continue;
            };

            for member in members.iter().filter(|m| m.file_name != retained) {
                self.retire(&retained, &member.file_name, &reason, &mut report)
                    .await;
            }
        }

        info!(
            retired = report.records.len(),
            failures = report.failures.len(),
            already_absent = report.skipped_removals.len(),
            "deduplication complete"
        );
        Ok(report)
    }

    /// Groups of ≥2 names whose current content fingerprint is shared.
    async fn duplicate_groups(&self) -> Result<BTreeMap<String, Vec<Candidate>>, SyncError> {
        let current: HashMap<String, Option<String>> = self
            .store
            .load_all_metadata()
            .await?
            .into_iter()
            .map(|m| (m.file_name, m.content_fingerprint))
            .collect();

        let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for event in self.store.fingerprinted_download_events().await? {
            let Some(fingerprint) = event.content_fingerprint else {
                continue;
            };
            let is_current = current
                .get(&event.file_name)
                .is_some_and(|c| c.as_deref() == Some(fingerprint.as_str()));
            if !is_current {
                continue;
            }
            let members = groups.entry(fingerprint).or_default();
            // Events arrive oldest first, so the first sighting is the earliest
            if !members.iter().any(|m| m.file_name == event.file_name) {
                members.push(Candidate {
                    file_name: event.file_name,
                    first_seen: event.fetch_time,
                });
            }
        }

        groups.retain(|_, members| members.len() >= 2);
        Ok(groups)
    }

    async fn retire(
        &self,
        retained: &str,
        removed: &str,
        reason: &str,
        report: &mut ReconcileReport,
    ) {
        let path = self.download_dir.join(removed);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {
                info!(file = %removed, "duplicate already absent on disk");
                report.skipped_removals.push(removed.to_string());
            }
            Err(error) => {
                warn!(file = %removed, %error, "failed to remove duplicate");
                report.failures.push(SyncError::RemovalFailure {
                    file_name: removed.to_string(),
                    message: format!("{}: {error}", path.display()),
                });
                return;
            }
        }

        match self
            .store
            .retire_duplicate(retained, removed, reason, Utc::now())
            .await
        {
            Ok(record) => {
                info!(%retained, %removed, "duplicate retired");
                report.records.push(record);
            }
            Err(error) => {
                warn!(file = %removed, %error, "failed to record retired duplicate");
                report.failures.push(SyncError::RemovalFailure {
                    file_name: removed.to_string(),
                    message: error.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::{DownloadEvent, DownloadStatus, FileMetadataRecord};
    use chrono::TimeZone;
    use std::path::Path;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        zip_dir: PathBuf,
        dedup: Deduplicator,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Database::new_in_memory().await.unwrap());
        let zip_dir = dir.path().join("zip");
        std::fs::create_dir_all(&zip_dir).unwrap();
        let dedup = Deduplicator::new(
            store.clone(),
            zip_dir.clone(),
            dir.path().join(".tripsync.lock"),
        );
        Fixture {
            _dir: dir,
            store,
            zip_dir,
            dedup,
        }
    }

    async fn fetched(store: &Store, zip_dir: &Path, name: &str, content: &str, day: u32, on_disk: bool) {
        store
            .append_download_event(&DownloadEvent {
                fetch_id: DownloadEvent::new_fetch_id(),
                file_name: name.to_string(),
                remote_fingerprint: Some(format!("etag-{name}")),
                content_fingerprint: Some(content.to_string()),
                fetch_time: at(day),
                status: DownloadStatus::Downloaded,
                fingerprint_match: None,
                local_path: None,
            })
            .await
            .unwrap();
        store
            .upsert_metadata(&FileMetadataRecord {
                file_name: name.to_string(),
                size: 4,
                last_modified: at(day),
                remote_fingerprint: format!("etag-{name}"),
                content_fingerprint: Some(content.to_string()),
                fetch_time: at(day),
                fetch_id: None,
            })
            .await
            .unwrap();
        if on_disk {
            std::fs::write(zip_dir.join(name), content).unwrap();
        }
    }

    #[tokio::test]
    async fn test_oldest_survives() {
        let f = fixture().await;
        fetched(&f.store, &f.zip_dir, "b.zip", "same", 2, true).await;
        fetched(&f.store, &f.zip_dir, "a.zip", "same", 1, true).await;
        fetched(&f.store, &f.zip_dir, "c.zip", "same", 3, true).await;
        fetched(&f.store, &f.zip_dir, "d.zip", "other", 1, true).await;

        let report = f.dedup.reconcile(RetentionPolicy::Oldest).await.unwrap();

        assert_eq!(report.records.len(), 2);
        assert!(report.records.iter().all(|r| r.retained_file == "a.zip"));
        assert!(report.records.iter().all(|r| r.reason == "duplicate (oldest)"));
        assert!(f.zip_dir.join("a.zip").exists());
        assert!(!f.zip_dir.join("b.zip").exists());
        assert!(!f.zip_dir.join("c.zip").exists());
        assert!(f.zip_dir.join("d.zip").exists());
        assert!(f.store.get_metadata("b.zip").await.unwrap().is_none());
        assert!(f.store.get_metadata("a.zip").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_newest_survives() {
        let f = fixture().await;
        fetched(&f.store, &f.zip_dir, "a.zip", "same", 1, true).await;
        fetched(&f.store, &f.zip_dir, "b.zip", "same", 2, true).await;

        let report = f.dedup.reconcile(RetentionPolicy::Newest).await.unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].retained_file, "b.zip");
        assert_eq!(report.records[0].removed_file, "a.zip");
    }

    #[tokio::test]
    async fn test_absent_preferred_survivor_falls_back() {
        let f = fixture().await;
        fetched(&f.store, &f.zip_dir, "a.zip", "same", 1, false).await;
        fetched(&f.store, &f.zip_dir, "b.zip", "same", 2, true).await;

        let report = f.dedup.reconcile(RetentionPolicy::Oldest).await.unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].retained_file, "b.zip");
        assert_eq!(report.skipped_removals, vec!["a.zip".to_string()]);
        assert!(f.zip_dir.join("b.zip").exists());
    }

    #[tokio::test]
    async fn test_group_without_local_copies_is_untouched() {
        let f = fixture().await;
        fetched(&f.store, &f.zip_dir, "a.zip", "same", 1, false).await;
        fetched(&f.store, &f.zip_dir, "b.zip", "same", 2, false).await;

        let report = f.dedup.reconcile(RetentionPolicy::Oldest).await.unwrap();
        assert!(report.records.is_empty());
        assert_eq!(f.store.load_all_metadata().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_fingerprint_is_not_a_member() {
        let f = fixture().await;
        fetched(&f.store, &f.zip_dir, "a.zip", "same", 1, true).await;
        fetched(&f.store, &f.zip_dir, "b.zip", "same", 2, true).await;
        // b.zip has since changed content
        fetched(&f.store, &f.zip_dir, "b.zip", "changed", 3, true).await;

        let report = f.dedup.reconcile(RetentionPolicy::Oldest).await.unwrap();
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_second_reconcile_is_noop() {
        let f = fixture().await;
        fetched(&f.store, &f.zip_dir, "a.zip", "same", 1, true).await;
        fetched(&f.store, &f.zip_dir, "b.zip", "same", 2, true).await;

        f.dedup.reconcile(RetentionPolicy::Oldest).await.unwrap();
        let again = f.dedup.reconcile(RetentionPolicy::Oldest).await.unwrap();
        assert!(again.records.is_empty());
        assert_eq!(f.store.list_duplicate_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_refuses_while_lock_held() {
        let f = fixture().await;
        let _held = RunLock::try_acquire(&f.dedup.lock_path).unwrap();
        let result = f.dedup.reconcile(RetentionPolicy::Oldest).await;
        assert!(matches!(result, Err(SyncError::LockHeld { .. })));
    }

    #[test]
    fn test_retention_policy_parse_and_display() {
        assert_eq!("newest".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Newest);
        assert!("latest".parse::<RetentionPolicy>().is_err());
        assert_eq!(RetentionPolicy::Oldest.to_string(), "oldest");
    }
}
