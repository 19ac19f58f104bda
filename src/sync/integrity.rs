//! Suspicious-replacement detection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use super::fetcher::StagedFile;
use super::rollback::RollbackArchiver;
use super::SyncError;
use crate::store::{FileMetadataRecord, RollbackRecord};

/// Reason recorded when a file shrinks beyond tolerance.
pub const REASON_SMALLER: &str = "Smaller file detected";
/// Reason recorded when bytes change under an unchanged remote fingerprint.
pub const REASON_SILENT_CHANGE: &str = "Content fingerprint changed without remote change";
/// Reason recorded under [`ContentChangePolicy::Any`].
pub const REASON_CONTENT_MISMATCH: &str = "Content fingerprint mismatch";

/// When a content change counts as suspicious.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentChangePolicy {
    /// Only when the remote fingerprint did not change.
    #[default]
    Unexpected,
    /// Any change of content.
    Any,
    /// Never.
    Ignore,
}

/// Thresholds for [`IntegrityGuard::classify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegrityPolicy {
    /// Bytes a file may shrink by before it is suspicious.
    pub shrink_tolerance_bytes: u64,
    /// Content-change rule.
    pub content_change: ContentChangePolicy,
}

/// Classification of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Whether the replacement looks wrong.
    pub suspicious: bool,
    /// Why, when suspicious.
    pub reason: Option<&'static str>,
}

impl Verdict {
    const BENIGN: Self = Self {
        suspicious: false,
        reason: None,
    };

    fn suspicious(reason: &'static str) -> Self {
        Self {
            suspicious: true,
            reason: Some(reason),
        }
    }
}

/// Outcome of [`IntegrityGuard::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    /// Classification.
    pub verdict: Verdict,
    /// Archive of the live file, when one was taken.
    pub rollback: Option<RollbackRecord>,
}

/// Classifies staged files against their previous state and archives the
/// live file before a suspicious overwrite.
#[derive(Debug, Clone)]
pub struct IntegrityGuard {
    policy: IntegrityPolicy,
    archiver: Arc<RollbackArchiver>,
}

impl IntegrityGuard {
    /// Creates a guard.
    #[must_use]
    pub fn new(policy: IntegrityPolicy, archiver: Arc<RollbackArchiver>) -> Self {
        Self { policy, archiver }
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> &IntegrityPolicy {
        &self.policy
    }

    /// Classifies new bytes against the previous record. Pure.
    #[must_use]
    pub fn classify(
        &self,
        previous: Option<&FileMetadataRecord>,
        new_size: u64,
        new_content_fingerprint: &str,
        remote_fingerprint: &str,
    ) -> Verdict {
        let Some(previous) = previous else {
            return Verdict::BENIGN;
        };

        if new_size.saturating_add(self.policy.shrink_tolerance_bytes) < previous.size {
            return Verdict::suspicious(REASON_SMALLER);
        }

        let Some(previous_content) = previous.content_fingerprint.as_deref() else {
            return Verdict::BENIGN;
        };
        if previous_content == new_content_fingerprint {
            return Verdict::BENIGN;
        }

        match self.policy.content_change {
            ContentChangePolicy::Unexpected if remote_fingerprint == previous.remote_fingerprint => {
                Verdict::suspicious(REASON_SILENT_CHANGE)
            }
            ContentChangePolicy::Any => Verdict::suspicious(REASON_CONTENT_MISMATCH),
            _ => Verdict::BENIGN,
        }
    }

    /// Classifies a staged file and, when suspicious and the live file
    /// exists, archives the live file. Must run before the staged file is
    /// committed.
    ///
    /// # Errors
    ///
    /// Propagates archival failures; the caller must then discard the
    /// staged file.
    #[instrument(skip(self, previous, staged), fields(file = %staged.file_name))]
    pub async fn inspect(
        &self,
        previous: Option<&FileMetadataRecord>,
        staged: &StagedFile,
    ) -> Result<Inspection, SyncError> {
        let verdict = self.classify(
            previous,
            staged.digest.size,
            &staged.digest.sha256,
            &staged.remote_fingerprint,
        );
        let Some(reason) = verdict.reason else {
            return Ok(Inspection {
                verdict,
                rollback: None,
            });
        };

        warn!(
            previous_size = previous.map(|p| p.size),
            new_size = staged.digest.size,
            %reason,
            "suspicious replacement"
        );

        let live_exists = tokio::fs::try_exists(&staged.live_path).await.unwrap_or(false);
        let rollback = if live_exists {
            let record = self
                .archiver
                .archive(
                    &staged.live_path,
                    previous.and_then(|p| p.content_fingerprint.as_deref()),
                    Some(&staged.digest.sha256),
                    reason,
                )
                .await?;
            Some(record)
        } else {
            None
        };

        Ok(Inspection { verdict, rollback })
    }
}
