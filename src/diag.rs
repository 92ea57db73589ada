//! Diagnostic helpers: rate-limited logging and snapshot serialization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter gate for rate-limited logging on hot paths.
///
/// Fires on the first event and then once every `every` events, so a
/// steady fault stream produces a trickle of log lines instead of a flood.
#[derive(Debug)]
pub struct RateLimited {
    counter: AtomicU64,
    every: u64,
}

impl RateLimited {
    /// Gate that fires roughly once per `every` events. Prime intervals
    /// avoid beating against periodic workloads.
    #[must_use]
    pub const fn new(every: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            every,
        }
    }

    /// Count one event; returns `Some(total)` when this one should be logged.
    pub fn check(&self) -> Option<u64> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (n % self.every == 0).then_some(n + 1)
    }

    /// Total events counted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Serialize a `Duration` as whole microseconds for diagnostic snapshots.
pub mod serde_duration_usec {
    use serde::Serializer;
    use std::time::Duration;

    /// Serialize as `u128` microseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
    }
}
