//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for reconnecting to the inbound event bus.
///
/// - Min delay: 100ms
/// - Max delay: 10s
/// - Max attempts: 30
/// - Jitter enabled
///
/// Callers restart the schedule after the last attempt, so the subscriber
/// never gives up.
pub fn bus_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(30)
        .with_jitter()
}
