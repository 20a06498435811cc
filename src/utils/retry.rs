//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between consumer reconnect attempts.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
///
/// Callers fall back to the max delay once the builder runs out of attempts.
pub fn consumer_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
}
