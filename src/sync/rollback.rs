//! Reversible overwrites: snapshot before replace, restore on request.
//!
//! Backups live at `<rollback_dir>/<file_name>/<UTC timestamp>[-seq].bak`
//! and are never removed by the sync pipeline.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use super::SyncError;
use crate::hasher::content_fingerprint;
use crate::store::{RollbackRecord, Store};

const BACKUP_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";

/// Same-instant archives of one file before giving up.
const MAX_BACKUP_SEQUENCE: u32 = 1_000;

/// Result of a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    /// Record the bytes came from.
    pub record: RollbackRecord,
    /// Live path that was overwritten.
    pub live_path: PathBuf,
    /// Content fingerprint now recorded in metadata.
    pub restored_fingerprint: String,
}

/// Copies live files aside before they are replaced.
#[derive(Debug, Clone)]
pub struct RollbackArchiver {
    store: Store,
    rollback_dir: PathBuf,
    download_dir: PathBuf,
}

impl RollbackArchiver {
    /// Creates an archiver writing under `rollback_dir` and restoring into `download_dir`.
    #[must_use]
    pub fn new(store: Store, rollback_dir: PathBuf, download_dir: PathBuf) -> Self {
        Self {
            store,
            rollback_dir,
            download_dir,
        }
    }

    /// Copies the current bytes of `file_path` aside and records the copy.
    ///
    /// The record is written only after the copy is flushed to disk. If the
    /// record cannot be written the backup is removed again.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Archive`] if the copy fails, or
    /// [`SyncError::Store`] if the record insert fails.
    #[instrument(skip(self), fields(path = %file_path.display()))]
    pub async fn archive(
        &self,
        file_path: &Path,
        previous_fingerprint: Option<&str>,
        new_fingerprint: Option<&str>,
        reason: &str,
    ) -> Result<RollbackRecord, SyncError> {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::Archive {
                file_name: file_path.display().to_string(),
                message: "path has no file name".to_string(),
            })?;
        let archive_error = |message: String| SyncError::Archive {
            file_name: file_name.clone(),
            message,
        };

        let archived_at = Utc::now();
        let dir = self.rollback_dir.join(&file_name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| archive_error(format!("{}: {e}", dir.display())))?;

        let (mut backup, backup_path, stamp) = create_backup_file(&dir, archived_at)
            .await
            .map_err(|e| archive_error(format!("{}: {e}", dir.display())))?;

        if let Err(error) = copy_into(file_path, &mut backup).await {
            drop(backup);
            let _ = fs::remove_file(&backup_path).await;
            return Err(archive_error(format!(
                "copy to {} failed: {error}",
                backup_path.display()
            )));
        }
        drop(backup);

        let record = RollbackRecord {
            rollback_id: format!("{file_name}-{stamp}"),
            file_name: file_name.clone(),
            replaced_content_fingerprint: previous_fingerprint.map(str::to_string),
            replaced_time: archived_at,
            new_content_fingerprint: new_fingerprint.map(str::to_string),
            new_time: archived_at,
            reason: reason.to_string(),
            backup_path: backup_path.clone(),
        };

        if let Err(error) = self.store.insert_rollback_record(&record).await {
            // No record may point at a backup, and no backup may lack a record
            if let Err(remove_error) = fs::remove_file(&backup_path).await {
                warn!(path = %backup_path.display(), error = %remove_error, "failed to remove orphan backup");
            }
            return Err(error.into());
        }

        info!(
            rollback_id = %record.rollback_id,
            backup = %backup_path.display(),
            %reason,
            "archived file before overwrite"
        );
        Ok(record)
    }

    /// Restores the bytes of a rollback record over the live file.
    ///
    /// The metadata content fingerprint is set to the backup's fingerprint,
    /// `fetch_time` to now, and `fetch_id` cleared.
    ///
    /// # Errors
    ///
    /// [`SyncError::RollbackNotFound`], [`SyncError::BackupMissing`] and
    /// [`SyncError::MetadataMissing`] are returned before anything is
    /// copied. IO and store failures propagate.
    #[instrument(skip(self))]
    pub async fn restore(&self, rollback_id: &str) -> Result<RestoreOutcome, SyncError> {
        let record = self
            .store
            .get_rollback_record(rollback_id)
            .await?
            .ok_or_else(|| SyncError::RollbackNotFound {
                rollback_id: rollback_id.to_string(),
            })?;

        if !fs::try_exists(&record.backup_path).await.unwrap_or(false) {
            return Err(SyncError::BackupMissing {
                rollback_id: record.rollback_id,
                path: record.backup_path,
            });
        }
        if self.store.get_metadata(&record.file_name).await?.is_none() {
            return Err(SyncError::MetadataMissing {
                file_name: record.file_name,
            });
        }

        fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| SyncError::io(&self.download_dir, e))?;
        let live_path = self.download_dir.join(&record.file_name);
        let staging_path = self.download_dir.join(format!(".{}.restore", record.file_name));

        let mut staging = File::create(&staging_path)
            .await
            .map_err(|e| SyncError::io(&staging_path, e))?;
        if let Err(error) = copy_into(&record.backup_path, &mut staging).await {
            drop(staging);
            let _ = fs::remove_file(&staging_path).await;
            return Err(SyncError::io(&record.backup_path, error));
        }
        drop(staging);
        if let Err(error) = fs::rename(&staging_path, &live_path).await {
            let _ = fs::remove_file(&staging_path).await;
            return Err(SyncError::io(&live_path, error));
        }

        let restored_fingerprint = content_fingerprint(&live_path)
            .await
            .map_err(|e| SyncError::io(&live_path, e))?;
        let updated = self
            .store
            .restore_content_fingerprint(&record.file_name, &restored_fingerprint, Utc::now())
            .await?;
        if !updated {
            return Err(SyncError::MetadataMissing {
                file_name: record.file_name,
            });
        }

        info!(
            rollback_id = %record.rollback_id,
            path = %live_path.display(),
            fingerprint = %restored_fingerprint,
            "file restored from backup"
        );
        Ok(RestoreOutcome {
            record,
            live_path,
            restored_fingerprint,
        })
    }

    /// Most recent rollback candidates, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if the query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<RollbackRecord>, SyncError> {
        Ok(self.store.recent_rollback_records(limit).await?)
    }
}

/// Creates the next free backup file for `archived_at` with create-new semantics.
async fn create_backup_file(
    dir: &Path,
    archived_at: DateTime<Utc>,
) -> std::io::Result<(File, PathBuf, String)> {
    let base = archived_at.format(BACKUP_STAMP_FORMAT).to_string();
    for sequence in 0..MAX_BACKUP_SEQUENCE {
        let stamp = if sequence == 0 {
            base.clone()
        } else {
            format!("{base}-{sequence}")
        };
        let path = dir.join(format!("{stamp}.bak"));
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path, stamp)),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("more than {MAX_BACKUP_SEQUENCE} backups at {base}"),
    ))
}

/// Copies `source` into `dest` and flushes it to disk.
async fn copy_into(source: &Path, dest: &mut File) -> std::io::Result<u64> {
    let mut reader = File::open(source).await?;
    let copied = tokio::io::copy(&mut reader, dest).await?;
    dest.flush().await?;
    dest.sync_all().await?;
    Ok(copied)
}
