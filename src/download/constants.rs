//! Transfer-layer constants (timeouts, user agent).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout between body chunks (5 minutes for large archives).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// User-Agent sent with every request.
pub(crate) fn user_agent() -> String {
    format!("tripsync/{}", env!("CARGO_PKG_VERSION"))
}
