//! Remote inventory diff and work-set selection.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::remote::RemoteObjectRecord;
use crate::store::{FileMetadataRecord, RetiredFile};

#[allow(clippy::expect_used)]
static DATE_TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{6,8}").expect("date token regex is valid")); // Static pattern, safe to panic

/// Returns the listed objects that are new or changed relative to `known`.
///
/// An object is changed when its remote fingerprint or size differs, or its
/// last-modified time is strictly newer than the recorded one. Output keeps
/// listing order.
#[must_use]
pub fn diff(
    remote: &[RemoteObjectRecord],
    known: &[FileMetadataRecord],
) -> Vec<RemoteObjectRecord> {
    let known: HashMap<&str, &FileMetadataRecord> =
        known.iter().map(|k| (k.file_name.as_str(), k)).collect();

    remote
        .iter()
        .filter(|object| match known.get(object.name.as_str()) {
            None => true,
            Some(previous) => is_changed(object, previous),
        })
        .cloned()
        .collect()
}

fn is_changed(object: &RemoteObjectRecord, previous: &FileMetadataRecord) -> bool {
    object.remote_fingerprint != previous.remote_fingerprint
        || object.size != previous.size
        || object.last_modified > previous.last_modified
}

/// First run of 6 to 8 digits in a name, or `""` when there is none.
#[must_use]
pub fn date_token(name: &str) -> &str {
    DATE_TOKEN_PATTERN.find(name).map_or("", |m| m.as_str())
}

/// Caller filters applied around [`diff`].
#[derive(Debug, Clone, Default)]
pub struct WorkSetPolicy {
    /// Skip the comparison; every (limited) listed object is work.
    pub force: bool,
    /// Order by embedded date token, then name, both descending.
    pub most_recent_first: bool,
    /// Keep only the first N objects of the ordered inventory.
    pub limit: Option<usize>,
    /// Files retired as duplicates. Suppressed while their remote
    /// fingerprint is unchanged; `force` does not lift this.
    pub retired: Vec<RetiredFile>,
}

impl WorkSetPolicy {
    /// Orders, limits and diffs `remote` against `known`.
    #[must_use]
    pub fn select(
        &self,
        remote: &[RemoteObjectRecord],
        known: &[FileMetadataRecord],
    ) -> Vec<RemoteObjectRecord> {
        let mut inventory = remote.to_vec();
        if self.most_recent_first {
            inventory.sort_by(|a, b| {
                date_token(&b.name)
                    .cmp(date_token(&a.name))
                    .then_with(|| b.name.cmp(&a.name))
            });
        }
        if let Some(limit) = self.limit {
            inventory.truncate(limit);
        }

        let candidates = if self.force {
            inventory
        } else {
            diff(&inventory, known)
        };

        let suppressed: HashSet<(&str, Option<&str>)> = self
            .retired
            .iter()
            .map(|r| (r.file_name.as_str(), r.remote_fingerprint.as_deref()))
            .collect();

        let before = candidates.len();
        let selected: Vec<RemoteObjectRecord> = candidates
            .into_iter()
            .filter(|object| {
                !suppressed.contains(&(object.name.as_str(), Some(object.remote_fingerprint.as_str())))
            })
            .collect();
        if selected.len() < before {
            debug!(suppressed = before - selected.len(), "retired duplicates left out of work set");
        }
        selected
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn remote(name: &str, size: u64, fp: &str, day: u32) -> RemoteObjectRecord {
        RemoteObjectRecord {
            name: name.to_string(),
            size,
            remote_fingerprint: fp.to_string(),
            last_modified: at(day),
        }
    }

    fn known(name: &str, size: u64, fp: &str, day: u32) -> FileMetadataRecord {
        FileMetadataRecord {
            file_name: name.to_string(),
            size,
            last_modified: at(day),
            remote_fingerprint: fp.to_string(),
            content_fingerprint: Some("c".repeat(64)),
            fetch_time: at(day),
            fetch_id: None,
        }
    }

    fn names(records: &[RemoteObjectRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_diff_new_and_changed_in_listing_order() {
        let listing = vec![
            remote("c.zip", 10, "e1", 1),
            remote("a.zip", 20, "e2", 1),
            remote("b.zip", 30, "e3", 5),
            remote("d.zip", 40, "e4", 1),
        ];
        let state = vec![
            known("a.zip", 21, "e2", 1),
            known("b.zip", 30, "e3", 2),
            known("d.zip", 40, "e4", 1),
        ];
        assert_eq!(names(&diff(&listing, &state)), vec!["c.zip", "a.zip", "b.zip"]);
    }

    #[test]
    fn test_diff_unchanged_listing_is_empty() {
        let listing = vec![remote("a.zip", 20, "e2", 3)];
        let state = vec![known("a.zip", 20, "e2", 3)];
        assert!(diff(&listing, &state).is_empty());
    }

    #[test]
    fn test_diff_older_last_modified_is_not_a_change() {
        let listing = vec![remote("a.zip", 20, "e2", 1)];
        let state = vec![known("a.zip", 20, "e2", 3)];
        assert!(diff(&listing, &state).is_empty());
    }

    #[test]
    fn test_diff_fingerprint_change_only() {
        let listing = vec![remote("a.zip", 20, "new", 3)];
        let state = vec![known("a.zip", 20, "old", 3)];
        assert_eq!(diff(&listing, &state).len(), 1);
    }

    #[test]
    fn test_date_token() {
        assert_eq!(date_token("202401-divvy-tripdata.zip"), "202401");
        assert_eq!(date_token("Divvy_Trips_2013.zip"), "");
        assert_eq!(date_token("trips_20240115.zip"), "20240115");
    }

    #[test]
    fn test_policy_most_recent_first_with_limit() {
        let listing = vec![
            remote("202311-trips.zip", 1, "a", 1),
            remote("Divvy_Trips_2013.zip", 1, "b", 1),
            remote("202401-trips.zip", 1, "c", 1),
            remote("202312-trips.zip", 1, "d", 1),
        ];
        let policy = WorkSetPolicy {
            most_recent_first: true,
            limit: Some(2),
            ..WorkSetPolicy::default()
        };
        assert_eq!(
            names(&policy.select(&listing, &[])),
            vec!["202401-trips.zip", "202312-trips.zip"]
        );
    }

    #[test]
    fn test_policy_limit_applies_before_diff() {
        let listing = vec![
            remote("202402-trips.zip", 1, "a", 1),
            remote("202401-trips.zip", 1, "b", 1),
        ];
        let state = vec![known("202402-trips.zip", 1, "a", 1)];
        let policy = WorkSetPolicy {
            most_recent_first: true,
            limit: Some(1),
            ..WorkSetPolicy::default()
        };
        assert!(policy.select(&listing, &state).is_empty());
    }

    #[test]
    fn test_policy_force_bypasses_diff() {
        let listing = vec![remote("a.zip", 20, "e2", 3)];
        let state = vec![known("a.zip", 20, "e2", 3)];
        let policy = WorkSetPolicy {
            force: true,
            ..WorkSetPolicy::default()
        };
        assert_eq!(policy.select(&listing, &state).len(), 1);
    }

    #[test]
    fn test_policy_suppresses_unchanged_retired_even_with_force() {
        let listing = vec![remote("copy.zip", 5, "same", 1), remote("moved.zip", 5, "new", 1)];
        let policy = WorkSetPolicy {
            force: true,
            retired: vec![
                RetiredFile {
                    file_name: "copy.zip".to_string(),
                    remote_fingerprint: Some("same".to_string()),
                },
                RetiredFile {
                    file_name: "moved.zip".to_string(),
                    remote_fingerprint: Some("old".to_string()),
                },
            ],
            ..WorkSetPolicy::default()
        };
        assert_eq!(names(&policy.select(&listing, &[])), vec!["moved.zip"]);
    }
}
