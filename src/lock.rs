//! Advisory run lock shared by sync runs and deduplication.
//!
//! The lock is an exclusive `flock`-style lock on a file under the data
//! directory. It is released when the [`RunLock`] is dropped or the process
//! exits.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process or task holds the lock.
    #[error("run lock {path} is held by another sync or dedup run")]
    Held {
        /// Lock file path.
        path: PathBuf,
    },

    /// The lock file could not be created or locked.
    #[error("failed to open run lock {path}: {source}")]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Held advisory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Tries to take the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] if the lock is taken, or [`LockError::Io`]
    /// if the lock file cannot be opened.
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "run lock acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::Held {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "run lock released");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tripsync.lock");

        let first = RunLock::try_acquire(&path).unwrap();
        let second = RunLock::try_acquire(&path);
        assert!(matches!(second, Err(LockError::Held { .. })));

        drop(first);
        assert!(RunLock::try_acquire(&path).is_ok());
    }

    #[test]
    fn test_acquire_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".tripsync.lock");
        let lock = RunLock::try_acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert!(path.exists());
    }
}
