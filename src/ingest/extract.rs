//! Zip extraction on the blocking pool.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};
use zip::ZipArchive;

use super::{ArchiveExtractor, IngestError};

/// Extracts `.zip` archives with the `zip` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

#[async_trait]
impl ArchiveExtractor for ZipExtractor {
    #[instrument(skip(self), fields(archive = %archive.display(), dest = %dest_dir.display()))]
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
        let archive = archive.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest_dir)).await??;
        debug!(csv_files = files.len(), "archive extracted");
        Ok(files)
    }
}

fn extract_blocking(archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let file = File::open(archive).map_err(|e| IngestError::io(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| IngestError::corrupt_archive(archive, e))?;

    // Stale files from a previous version of the archive must not be re-ingested
    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir).map_err(|e| IngestError::io(dest_dir, e))?;
    }
    fs::create_dir_all(dest_dir).map_err(|e| IngestError::io(dest_dir, e))?;

    // Entry names escaping dest_dir are rejected by the zip crate
    zip.extract(dest_dir)
        .map_err(|e| IngestError::corrupt_archive(archive, e))?;

    top_level_csv_files(dest_dir)
}

fn top_level_csv_files(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))? {
        let entry = entry.map_err(|e| IngestError::io(dir, e))?;
        let path = entry.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if is_csv && !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extract_returns_sorted_top_level_csvs() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("202401-trips.zip");
        write_zip(
            &archive,
            &[
                ("b.csv", b"x\n1\n"),
                ("a.CSV", b"x\n2\n"),
                ("__MACOSX/._a.csv", b"junk"),
                ("readme.txt", b"hello"),
            ],
        );

        let dest = dir.path().join("csv").join("202401-trips");
        let files = ZipExtractor.extract(&archive, &dest).await.unwrap();

        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.CSV", "b.csv"]);
        assert!(dest.join("readme.txt").exists());
    }

    #[tokio::test]
    async fn test_extract_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.csv"), "old").unwrap();

        let archive = dir.path().join("a.zip");
        write_zip(&archive, &[("fresh.csv", b"x\n1\n")]);

        let files = ZipExtractor.extract(&archive, &dest).await.unwrap();
        assert_eq!(files, vec![dest.join("fresh.csv")]);
        assert!(!dest.join("stale.csv").exists());
    }

    #[tokio::test]
    async fn test_extract_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"this is not a zip archive").unwrap();

        let result = ZipExtractor.extract(&archive, &dir.path().join("out")).await;
        assert!(matches!(result, Err(IngestError::CorruptArchive { .. })));
    }
}
