//! Delimited-file loader into a SQLite warehouse.
//!
//! Each file gets its own table named from the file name. All columns are
//! TEXT; typing is left to downstream consumers. Identifiers are derived by
//! allow-list sanitizing and every value is a bound parameter.
//!
//! Parsing runs on the blocking pool and streams batches over a bounded
//! channel to the async inserter, which writes inside one transaction: the
//! previous table is dropped and recreated, so a load either fully replaces
//! the file's rows or leaves the old ones in place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

use super::{IngestError, LoadOutcome, TableLoader};
use crate::db::Database;
use crate::hasher::hex_encode;

const BATCH_ROWS: usize = 1_000;
const CHANNEL_BATCHES: usize = 4;

/// Loads delimited files into per-file warehouse tables.
#[derive(Debug)]
pub struct SqliteTableLoader {
    db: Database,
    write_lock: Mutex<()>,
}

impl SqliteTableLoader {
    /// Creates a loader over an opened warehouse database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the warehouse database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }
}

/// Maps arbitrary text to `[a-z0-9_]`, lowercased.
#[must_use]
pub fn sanitize_identifier(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Table name for a delimited file: `t_<sanitized stem>_<8 hex of SHA-256(file name)>`.
///
/// The hash suffix keeps names that sanitize identically apart.
#[must_use]
pub fn table_name_for(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let digest = hex_encode(&Sha256::digest(file_name.as_bytes()));
    format!("t_{}_{}", sanitize_identifier(stem), &digest[..8])
}

fn column_names(headers: &csv::StringRecord) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(headers.len());
    for (index, header) in headers.iter().enumerate() {
        let mut base = sanitize_identifier(header.trim_start_matches('\u{feff}'));
        if base.trim_matches('_').is_empty() {
            base = format!("col_{}", index + 1);
        } else if base.starts_with(|c: char| c.is_ascii_digit()) {
            base = format!("c_{base}");
        }
        let mut candidate = base.clone();
        let mut suffix = 2;
        while names.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        names.push(candidate);
    }
    names
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// What the parser saw, returned when the producer finishes.
#[derive(Debug, Default)]
struct ParseSummary {
    rejected: u64,
    first_error: Option<String>,
}

fn parse_rows(
    path: &Path,
    width: usize,
    sender: &mpsc::Sender<Vec<Vec<String>>>,
) -> Result<ParseSummary, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| unreadable(path, &e))?;
    let mut summary = ParseSummary::default();
    let mut batch = Vec::with_capacity(BATCH_ROWS);
    let mut record = csv::StringRecord::new();

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) if record.len() == width => {
                batch.push(record.iter().map(str::to_string).collect());
                if batch.len() == BATCH_ROWS {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_ROWS));
                    if sender.blocking_send(full).is_err() {
                        // Inserter stopped; its error is reported instead
                        return Ok(summary);
                    }
                }
            }
            Ok(true) => {
                let line = record.position().map_or(0, csv::Position::line);
                reject(
                    &mut summary,
                    format!("line {line}: expected {width} fields, found {}", record.len()),
                );
            }
            Err(error) => {
                reject(&mut summary, error.to_string());
                // A non-recoverable error repeats forever; stop reading
                if !matches!(error.kind(), csv::ErrorKind::Utf8 { .. } | csv::ErrorKind::UnequalLengths { .. }) {
                    break;
                }
            }
        }
    }

    if !batch.is_empty() {
        let _ = sender.blocking_send(batch);
    }
    Ok(summary)
}

fn reject(summary: &mut ParseSummary, message: String) {
    summary.rejected += 1;
    if summary.first_error.is_none() {
        summary.first_error = Some(message);
    }
}

fn unreadable(path: &Path, error: &csv::Error) -> IngestError {
    match error.kind() {
        csv::ErrorKind::Io(io) => IngestError::io(path, std::io::Error::new(io.kind(), io.to_string())),
        _ => IngestError::Unreadable {
            path: path.to_path_buf(),
            message: error.to_string(),
        },
    }
}

fn read_headers(path: &Path) -> Result<csv::StringRecord, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| unreadable(path, &e))?;
    let headers = reader.headers().map_err(|e| unreadable(path, &e))?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestError::Unreadable {
            path: path.to_path_buf(),
            message: "missing header row".to_string(),
        });
    }
    Ok(headers)
}

#[async_trait]
impl TableLoader for SqliteTableLoader {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn load(&self, path: &Path, strict: bool) -> Result<LoadOutcome, IngestError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let table_name = table_name_for(&file_name);

        let header_path = path.to_path_buf();
        let headers = tokio::task::spawn_blocking(move || read_headers(&header_path)).await??;
        let columns = column_names(&headers);
        let width = columns.len();

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.pool().begin().await?;

        let column_defs: Vec<String> = columns.iter().map(|c| format!("{} TEXT", quote(c))).collect();
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&table_name)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {} ({})",
            quote(&table_name),
            column_defs.join(", ")
        ))
        .execute(&mut *tx)
        .await?;

        let placeholders = vec!["?"; width].join(", ");
        let quoted_columns: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(&table_name),
            quoted_columns.join(", ")
        );

        let (sender, mut receiver) = mpsc::channel::<Vec<Vec<String>>>(CHANNEL_BATCHES);
        let parse_path: PathBuf = path.to_path_buf();
        let producer = tokio::task::spawn_blocking(move || parse_rows(&parse_path, width, &sender));

        let mut inserted_rows: u64 = 0;
        let mut insert_error: Option<sqlx::Error> = None;
        while let Some(batch) = receiver.recv().await {
            for row in batch {
                let mut query = sqlx::query(&insert_sql);
                for value in row {
                    query = query.bind(value);
                }
                if let Err(error) = query.execute(&mut *tx).await {
                    insert_error = Some(error);
                    break;
                }
                inserted_rows += 1;
            }
            if insert_error.is_some() {
                break;
            }
        }
        // Unblocks the producer if the inserter stopped early
        drop(receiver);
        let summary = producer.await??;

        if let Some(error) = insert_error {
            tx.rollback().await?;
            return Err(error.into());
        }

        if strict && summary.rejected > 0 {
            tx.rollback().await?;
            warn!(
                table = %table_name,
                rejected = summary.rejected,
                "strict load rejected, warehouse unchanged"
            );
            return Err(IngestError::MalformedRows {
                path: path.to_path_buf(),
                table_name,
                reject_count: summary.rejected,
                first_error: summary.first_error.unwrap_or_default(),
            });
        }

        tx.commit().await?;

        if summary.rejected > 0 {
            debug!(rejected = summary.rejected, first = ?summary.first_error, "malformed rows skipped");
        }
        info!(table = %table_name, rows = inserted_rows, rejected = summary.rejected, "file loaded");

        Ok(LoadOutcome {
            table_name,
            inserted_rows,
            reject_count: summary.rejected,
        })
    }
}
