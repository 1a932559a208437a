//! Process-wide monotonic clock, in whole seconds.
//!
//! Receiver ages, the acceptance rate limiter, and `last_msg_t` all compare
//! seconds from this clock; wall-clock time is only used for display.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the first call in this process.
pub fn monotonic_secs() -> i64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    i64::try_from(origin.elapsed().as_secs()).unwrap_or(i64::MAX)
}
