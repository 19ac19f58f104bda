//! Error types for store operations.

use std::fmt;

use thiserror::Error;

/// Structured classification for log/metadata database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (primary key, check, not-null, append-only trigger).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl StoreDbErrorKind {
    /// Classifies a driver error.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> StoreDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return StoreDbErrorKind::BusyOrLocked;
    }

    let message = database_error.message().to_ascii_lowercase();
    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT") || value == "19")
        || message.contains("append-only")
    {
        return StoreDbErrorKind::ConstraintViolation;
    }

    if message.contains("database is locked") || message.contains("database is busy") {
        return StoreDbErrorKind::BusyOrLocked;
    }

    StoreDbErrorKind::Other
}

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification.
        kind: StoreDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// A persisted value could not be decoded.
    #[error("corrupt value in column '{column}': '{value}'")]
    Corrupt {
        /// Column name.
        column: &'static str,
        /// Raw stored value.
        value: String,
    },

    /// A value does not fit the storage representation.
    #[error("value out of range for column '{column}': {value}")]
    OutOfRange {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: u64,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Creates a `Corrupt` error for a stored value that failed to decode.
    #[must_use]
    pub fn corrupt(column: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            column,
            value: value.into(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Corrupt { .. } | Self::OutOfRange { .. } => None,
        }
    }
}
