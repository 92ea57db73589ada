//! Tick-rate measurement.

use std::time::Instant;

use super::drift::SYNC_ADJ_QUICK;

/// Signed microsecond difference `a - b` between two instants.
#[must_use]
pub fn usec_diff(a: Instant, b: Instant) -> i64 {
    if a >= b {
        i64::try_from(a.duration_since(b).as_micros()).unwrap_or(i64::MAX)
    } else {
        -i64::try_from(b.duration_since(a).as_micros()).unwrap_or(i64::MAX)
    }
}

/// Converts a stream of "tick arrived" timestamps into a smoothed tick
/// period.
///
/// Every bus embeds one ticker; a further host-side ticker stands in for
/// an external timing reference. A ticker has no failure mode: every tick
/// is accepted.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    count: u64,
    cycle: u32,
    first_sample: Instant,
    last_sample: Instant,
    tick_period_usec: i64,
}

/// Copyable view of a ticker, taken while holding its bus lock, so drift
/// math never needs two locks at once.
#[derive(Debug, Clone, Copy)]
pub struct TickerSnapshot {
    /// Rolling tick count
    pub count: u64,
    /// Timestamp of the most recent tick
    pub last_sample: Instant,
}

impl Ticker {
    /// Create a ticker anchored at `now`, starting in quick mode.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            cycle: SYNC_ADJ_QUICK,
            first_sample: now,
            last_sample: now,
            tick_period_usec: 0,
        }
    }

    /// Record a tick. Returns `true` when this tick completed a measurement
    /// window, i.e. the tick period was just recalculated.
    pub fn step(&mut self, now: Instant) -> bool {
        self.last_sample = now;
        let cycled = self.count % u64::from(self.cycle) == u64::from(self.cycle) - 1;
        if cycled {
            let usec = usec_diff(self.last_sample, self.first_sample);
            self.first_sample = self.last_sample;
            self.tick_period_usec = usec / i64::from(self.cycle);
        }
        self.count += 1;
        cycled
    }

    /// Ticks observed so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Force the tick count (reference resynchronization after heavy loss).
    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    /// Current measurement window length, in ticks.
    #[must_use]
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Change the measurement window length.
    pub fn set_cycle(&mut self, cycle: u32) {
        self.cycle = cycle.max(1);
    }

    /// Most recent tick timestamp.
    #[must_use]
    pub fn last_sample(&self) -> Instant {
        self.last_sample
    }

    /// Smoothed microseconds per tick (0 until the first window completes).
    #[must_use]
    pub fn tick_period_usec(&self) -> i64 {
        self.tick_period_usec
    }

    /// Snapshot for cross-ticker comparison.
    #[must_use]
    pub fn snapshot(&self) -> TickerSnapshot {
        TickerSnapshot {
            count: self.count,
            last_sample: self.last_sample,
        }
    }
}
