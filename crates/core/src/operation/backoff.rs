//! Poll and retry delays.

use std::time::Duration;

use regsync_domain::constants::BACKOFF_SCHEDULE_SECS;

/// Delay before poll number `index + 1`, `None` once the schedule is spent.
pub fn poll_delay(index: u32) -> Option<Duration> {
    usize::try_from(index)
        .ok()
        .and_then(|i| BACKOFF_SCHEDULE_SECS.get(i))
        .map(|secs| Duration::from_secs(*secs))
}

/// Delay before retry `attempt`; saturates at the last step.
pub fn retry_delay(attempt: u32) -> Duration {
    let last = BACKOFF_SCHEDULE_SECS.len() - 1;
    let index = usize::try_from(attempt).map_or(last, |a| a.min(last));
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
}

/// Longest time a request can stay unresolved before polling gives up.
pub fn total_poll_window() -> Duration {
    Duration::from_secs(BACKOFF_SCHEDULE_SECS.iter().sum())
}
