//! Backoff policies for broker connections.
//!
//! Uses `backon`. Initial connects back off exponentially per host; reconnects
//! after an established connection drops are spaced evenly.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

/// Backoff for the initial connect to one host.
///
/// - Min delay: 100ms
/// - Max delay: 3s
/// - Max retries: `retries`
/// - Jitter enabled
pub fn connect_backoff(retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(3))
        .with_max_times(retries)
        .with_jitter()
}

/// Backoff for reconnecting after an established connection dropped.
pub fn reconnect_backoff(retries: usize, interval: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(interval)
        .with_max_times(retries)
}
