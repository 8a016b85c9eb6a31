//! Domain constants
//!
//! Defaults shared by configuration, the operation state machine and the
//! export queue.

/// Poll delays (seconds) applied while the registry is still working on a
/// request. Running past the last entry is fatal.
pub const BACKOFF_SCHEDULE_SECS: [u64; 9] = [5, 10, 30, 60, 120, 300, 900, 1800, 3600];

/// A wip transport id older than this is considered abandoned.
/// Longer than the sum of [`BACKOFF_SCHEDULE_SECS`].
pub const DEFAULT_LIVE_TRANSPORT_WINDOW_SECS: u64 = 7200;

// Export queue
pub const DEFAULT_QUEUE_DELAY_SECS: u64 = 60;
pub const DEFAULT_DISTRIBUTE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_PURGE_CRON: &str = "0 0 3 * * *";

// Operation runtime
pub const DEFAULT_PENDING_DELAY_SECS: u64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
pub const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 60;

/// Error and warning texts stored on records are cut to this many chars.
pub const MAX_REASON_LENGTH: usize = 256;

/// Registry codes downgraded from item errors to warnings.
pub const DEFAULT_WARNING_CODES: &[&str] = &["INT002000", "INT002003", "SRV008002"];

/// Registry codes meaning "object unknown to the registry".
pub const DEFAULT_MISSING_CODES: &[&str] = &["INT002012", "SRV006000"];

/// Registry codes asking the client to rebuild and resend the request.
pub const DEFAULT_RESTART_CODES: &[&str] = &["EXP001000"];
