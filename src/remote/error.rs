//! Error types for remote listing.

use thiserror::Error;

use crate::download::DownloadError;

/// Errors produced while listing the remote bucket.
#[derive(Debug, Error)]
pub enum ListingError {
    /// A listing page could not be fetched.
    #[error("failed to fetch listing page: {0}")]
    Transfer(#[from] DownloadError),

    /// A listing page could not be understood.
    #[error("malformed listing response: {message}")]
    Malformed {
        /// What was wrong.
        message: String,
    },

    /// The listing did not terminate.
    #[error("listing exceeded {pages} pages without completing")]
    TooManyPages {
        /// Pages fetched before giving up.
        pages: usize,
    },
}

impl ListingError {
    /// Creates a `Malformed` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}
