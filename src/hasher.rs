//! Content fingerprints for local files.
//!
//! The content fingerprint of a file is its SHA-256 digest in lowercase hex.
//! An MD5 digest is computed in the same pass so a local copy can be compared
//! against S3-style ETags, which are the MD5 of the object for single-part
//! uploads and an opaque token otherwise.

use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::instrument;

/// Read buffer size for streaming digests.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Digests of one file observed at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// SHA-256, lowercase hex. This is the content fingerprint.
    pub sha256: String,
    /// MD5, lowercase hex. Only used for ETag comparison.
    pub md5: String,
    /// Size in bytes.
    pub size: u64,
}

/// Outcome of comparing a local digest with a remote fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintMatch {
    /// Remote fingerprint is a digest of the same bytes.
    Match,
    /// Remote fingerprint is a comparable digest of different bytes.
    Mismatch,
    /// Remote fingerprint uses a scheme that cannot be compared (multipart ETag, etc).
    Unknown,
}

impl FingerprintMatch {
    /// Storage form: `Some(true)`, `Some(false)` or `None` for unknown.
    #[must_use]
    pub fn as_option(self) -> Option<bool> {
        match self {
            Self::Match => Some(true),
            Self::Mismatch => Some(false),
            Self::Unknown => None,
        }
    }
}

impl FileDigest {
    /// Digests an in-memory buffer.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            sha256: hex_encode(&Sha256::digest(bytes)),
            md5: hex_encode(&Md5::digest(bytes)),
            size: bytes.len() as u64,
        }
    }

    /// Compares this digest with a remote fingerprint.
    ///
    /// A 32-hex-digit fingerprint is treated as an MD5 ETag, a 64-hex-digit
    /// fingerprint as a SHA-256; anything else is not comparable.
    #[must_use]
    pub fn compare_remote(&self, remote_fingerprint: &str) -> FingerprintMatch {
        let remote = normalize_remote_fingerprint(remote_fingerprint).to_ascii_lowercase();
        if !remote.bytes().all(|b| b.is_ascii_hexdigit()) {
            return FingerprintMatch::Unknown;
        }
        let local = match remote.len() {
            32 => &self.md5,
            64 => &self.sha256,
            _ => return FingerprintMatch::Unknown,
        };
        if *local == remote {
            FingerprintMatch::Match
        } else {
            FingerprintMatch::Mismatch
        }
    }
}

/// Strips surrounding whitespace and double quotes from an ETag-style token.
#[must_use]
pub fn normalize_remote_fingerprint(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

/// Computes the digests of the file at `path` in a single streaming pass.
///
/// # Errors
///
/// Returns the underlying IO error if the file cannot be opened or read.
#[instrument(level = "debug", fields(path = %path.display()))]
pub async fn digest_file(path: &Path) -> std::io::Result<FileDigest> {
    let mut file = File::open(path).await?;
    let mut sha = Sha256::new();
    let mut md5 = Md5::new();
    let mut size: u64 = 0;
    let mut buffer = vec![0_u8; READ_CHUNK_BYTES];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        sha.update(&buffer[..read]);
        md5.update(&buffer[..read]);
        size += read as u64;
    }

    Ok(FileDigest {
        sha256: hex_encode(&sha.finalize()),
        md5: hex_encode(&md5.finalize()),
        size,
    })
}

/// Computes only the content fingerprint (SHA-256 hex) of a file.
///
/// # Errors
///
/// Returns the underlying IO error if the file cannot be read.
pub async fn content_fingerprint(path: &Path) -> std::io::Result<String> {
    Ok(digest_file(path).await?.sha256)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}
