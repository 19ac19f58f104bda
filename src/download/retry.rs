//! Caller-level retry with exponential backoff for transient transfer failures.
//!
//! The transfer layer never retries on its own. The sync engine classifies a
//! failed attempt with [`classify_error`], asks [`RetryPolicy::should_retry`]
//! and, when told to, sleeps and starts a fresh attempt (which records its
//! own download event).
//!
//! ```
//! use tripsync_core::download::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://bucket.example/202401-trips.zip", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;

/// Default maximum attempts, including the first.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Upper bound on random jitter added to each delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry: timeouts, connection resets, 5xx.
    Transient,
    /// Will not succeed on retry: 4xx, local IO, bad URL.
    Permanent,
    /// HTTP 429 or S3 `SlowDown`; retried with backoff.
    RateLimited,
}

/// Whether to start another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait first.
        delay: Duration,
        /// Number of the next attempt (1-indexed, so the first retry is 2).
        attempt: u32,
    },

    /// Stop.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Retry configuration.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
///
/// Jitter is uniform in `0..=min(500ms, base_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit settings. `max_attempts` is at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Default delays with a custom attempt limit.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Maximum attempts including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after attempt number `attempt` (1-indexed) failed.
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let bound = MAX_JITTER.min(self.base_delay).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Classifies a transfer error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | timeout | Transient |
/// | network (non-TLS) | Transient |
/// | network (TLS/certificate) | Permanent |
/// | HTTP 408, 5xx | Transient |
/// | HTTP 429, 503 `SlowDown` | RateLimited / Transient |
/// | other HTTP 4xx | Permanent |
/// | IO, invalid URL, client build | Permanent |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } => FailureType::Transient,
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::ClientBuild { .. } => FailureType::Permanent,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        400..=499 => FailureType::Permanent,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("certificate") || text.contains("tls") || text.contains("handshake")
}
