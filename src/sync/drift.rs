//! Clock drift measurement and correction.
//!
//! A software PLL: each bus's tick stream is compared against the elected
//! reference and nudged by small hardware adjustment units. Large offsets
//! are corrected immediately to avoid audible clock slips; small offsets
//! are corrected gradually so transport jitter does not cause oscillation.

use std::time::Instant;

use super::ticker::{usec_diff, Ticker, TickerSnapshot};

/// Maximal hardware drift adjustment unit.
pub const SYNC_ADJ_MAX: i32 = 63;

/// Measurement window length while reacting quickly, in ticks.
///
/// The transport delivers frames with large jitter because we cannot
/// predict in which 125µs USB micro-frame our data passes.
pub const SYNC_ADJ_QUICK: u32 = 1000;

/// Measurement window ceiling once the offset has settled, in ticks.
pub const SYNC_ADJ_SLOW: u32 = 10_000;

/// One USB micro-frame, the transport's adjustment quantum, in microseconds.
pub const USB_MICROFRAME_USEC: i64 = 125;

/// Offset beyond which an immediate maximal correction is issued.
pub const FAR_EXCURSION_USEC: i64 = 300;

/// Median offset from which incremental corrections start.
pub const MEDIAN_CORRECTION_USEC: i64 = 150;

/// Tick-count divergence that forces a resync of the local counter.
const LOST_TICK_RESYNC: i64 = 100;

/// Window widening step when the offset is small, in ticks.
const CYCLE_WIDEN_STEP: u32 = 500;

/// Result of one drift step.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftOutcome {
    /// The bus ticker completed a measurement window on this tick
    pub window_completed: bool,
    /// Ticks lost (or gained, negative) relative to the reference
    pub lost_ticks: i64,
    /// Correction to transmit to the hardware, already clamped
    pub correction: Option<i32>,
}

/// Drift statistics snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DriftStats {
    /// Microsecond offset window minimum
    pub delta_min: i64,
    /// Microsecond offset window maximum
    pub delta_max: i64,
    /// `(delta_max + delta_min) / 2` at the last window completion
    pub median: i64,
    /// `delta_max - delta_min` at the last window completion
    pub jitter: i64,
    /// Last computed (unclamped) correction
    pub calc_drift: i32,
    /// Number of lost-tick events
    pub lost_tick_events: u64,
    /// Total ticks lost across all events
    pub lost_ticks_total: u64,
}

/// Per-bus drift corrector.
///
/// Mutated only from the tick path, under the owning bus's sync lock.
#[derive(Debug)]
pub struct DriftCorrector {
    wanted_offset_usec: i64,
    delta_tick: i64,
    lost_tick_events: u64,
    lost_ticks_total: u64,
    delta_min: i64,
    delta_max: i64,
    median: i64,
    jitter: i64,
    calc_drift: i32,
}

impl DriftCorrector {
    /// Create a corrector with the given wanted offset from the reference.
    #[must_use]
    pub fn new(wanted_offset_usec: i64) -> Self {
        let mut corrector = Self {
            wanted_offset_usec,
            delta_tick: 0,
            lost_tick_events: 0,
            lost_ticks_total: 0,
            delta_min: i64::MAX,
            delta_max: i64::MIN,
            median: 0,
            jitter: 0,
            calc_drift: 0,
        };
        corrector.recalc_window();
        corrector
    }

    fn recalc_window(&mut self) {
        self.delta_min = i64::MAX;
        self.delta_max = i64::MIN;
    }

    /// Clear all drift state and put the ticker back into quick mode.
    ///
    /// Called whenever the reference changes.
    pub fn clear(&mut self, ticker: &mut Ticker) {
        self.recalc_window();
        self.calc_drift = 0;
        ticker.set_cycle(SYNC_ADJ_QUICK);
    }

    /// Process one synchronization tick.
    ///
    /// Advances `ticker`. When a reference is configured and this bus is
    /// phase-locked to it rather than being the reference itself, it also
    /// measures the offset and decides on a correction. `last_acked` is the
    /// correction value the hardware last acknowledged; a new correction is
    /// only emitted when it differs.
    pub fn step(
        &mut self,
        ticker: &mut Ticker,
        now: Instant,
        reference: Option<TickerSnapshot>,
        is_reference: bool,
        last_acked: i32,
    ) -> DriftOutcome {
        let cycled = ticker.step(now);
        let mut outcome = DriftOutcome {
            window_completed: cycled,
            ..DriftOutcome::default()
        };
        let Some(reference) = reference else {
            return outcome;
        };
        if is_reference {
            return outcome;
        }

        #[allow(clippy::cast_possible_wrap)]
        let new_delta_tick = ticker.count() as i64 - reference.count as i64;
        let lost_ticks = new_delta_tick - self.delta_tick;
        self.delta_tick = new_delta_tick;
        if lost_ticks != 0 {
            self.lost_tick_events += 1;
            self.lost_ticks_total += lost_ticks.unsigned_abs();
            outcome.lost_ticks = lost_ticks;
            tracing::debug!(lost_ticks, "lost tick(s) against reference");
            ticker.set_cycle(SYNC_ADJ_QUICK);
            if lost_ticks.abs() > LOST_TICK_RESYNC {
                ticker.set_count(reference.count);
            }
            return outcome;
        }

        let usec_delta = usec_diff(ticker.last_sample(), reference.last_sample)
            - self.wanted_offset_usec;
        let mut nofix = false;
        if usec_delta.abs() > FAR_EXCURSION_USEC {
            // Close to the edge: send a brutal fix and skip the windowed
            // statistics until next time.
            if usec_delta > 0 && last_acked > -SYNC_ADJ_MAX {
                tracing::debug!(usec_delta, "pullback");
                outcome.correction = Some(-SYNC_ADJ_MAX);
            }
            if usec_delta < 0 && last_acked < SYNC_ADJ_MAX {
                tracing::debug!(usec_delta, "pushback");
                outcome.correction = Some(SYNC_ADJ_MAX);
            }
            ticker.set_cycle(SYNC_ADJ_QUICK);
            nofix = true;
        } else {
            if usec_delta > self.delta_max {
                self.delta_max = usec_delta;
            }
            if usec_delta < self.delta_min {
                self.delta_min = usec_delta;
            }
        }

        if !nofix && cycled {
            let mut offset = 0i32;
            self.median = (self.delta_max + self.delta_min) / 2;
            self.jitter = self.delta_max - self.delta_min;
            if self.median.abs() >= MEDIAN_CORRECTION_USEC {
                // More than one USB micro-frame off: nudge toward zero,
                // scaled by how much of the window one second covers.
                #[allow(clippy::cast_possible_truncation)]
                let mut factor = (self.median.abs() / USB_MICROFRAME_USEC) as i32;
                factor = 1 + (factor * 8000) / i32::try_from(ticker.cycle()).unwrap_or(i32::MAX);
                offset = if self.median > 0 {
                    self.calc_drift - factor
                } else {
                    self.calc_drift + factor
                };
                if self.median.abs() >= 2 * MEDIAN_CORRECTION_USEC {
                    ticker.set_cycle(SYNC_ADJ_QUICK);
                    tracing::debug!(median = self.median, "back to quick window");
                }
            } else {
                ticker.set_cycle((ticker.cycle() + CYCLE_WIDEN_STEP).min(SYNC_ADJ_SLOW));
            }
            self.calc_drift = offset;
            tracing::debug!(
                min = self.delta_min,
                max = self.delta_max,
                jitter = self.jitter,
                median = self.median,
                offset,
                "drift window"
            );
            let clamped = offset.clamp(-SYNC_ADJ_MAX, SYNC_ADJ_MAX);
            if clamped != last_acked {
                outcome.correction = Some(clamped);
            }
            self.recalc_window();
        }
        outcome
    }

    /// Wanted fixed offset from the reference, in microseconds.
    #[must_use]
    pub fn wanted_offset_usec(&self) -> i64 {
        self.wanted_offset_usec
    }

    /// Snapshot the drift statistics.
    #[must_use]
    pub fn stats(&self) -> DriftStats {
        DriftStats {
            delta_min: self.delta_min,
            delta_max: self.delta_max,
            median: self.median,
            jitter: self.jitter,
            calc_drift: self.calc_drift,
            lost_tick_events: self.lost_tick_events,
            lost_ticks_total: self.lost_ticks_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WANTED: i64 = 500;

    struct Harness {
        base: Instant,
        local: Ticker,
        reference: Ticker,
        corrector: DriftCorrector,
        last_acked: i32,
    }

    impl Harness {
        fn new(cycle: u32) -> Self {
            let base = Instant::now();
            let mut local = Ticker::new(base);
            local.set_cycle(cycle);
            let mut reference = Ticker::new(base);
            reference.set_cycle(cycle);
            Self {
                base,
                local,
                reference,
                corrector: DriftCorrector::new(WANTED),
                last_acked: 0,
            }
        }

        /// Run one tick with the local clock `offset_usec` after the
        /// reference (on top of the wanted offset).
        fn tick(&mut self, n: u64, offset_usec: i64) -> DriftOutcome {
            let ref_at = self.base + Duration::from_micros(1000 * (n + 1));
            self.reference.step(ref_at);
            let local_at = ref_at + Duration::from_micros(u64::try_from(WANTED + offset_usec).unwrap());
            let outcome = self.corrector.step(
                &mut self.local,
                local_at,
                Some(self.reference.snapshot()),
                false,
                self.last_acked,
            );
            if let Some(c) = outcome.correction {
                self.last_acked = c; // model an immediate hardware ack
            }
            outcome
        }
    }

    #[test]
    fn test_no_reference_is_noop() {
        let base = Instant::now();
        let mut ticker = Ticker::new(base);
        let mut corrector = DriftCorrector::new(WANTED);
        let outcome = corrector.step(&mut ticker, base + Duration::from_millis(1), None, false, 0);
        assert!(outcome.correction.is_none());
        assert_eq!(ticker.count(), 1);
    }

    #[test]
    fn test_reference_bus_never_corrected() {
        let base = Instant::now();
        let mut ticker = Ticker::new(base);
        let reference = Ticker::new(base).snapshot();
        let mut corrector = DriftCorrector::new(WANTED);
        let outcome = corrector.step(
            &mut ticker,
            base + Duration::from_micros(5000),
            Some(reference),
            true,
            0,
        );
        assert!(outcome.correction.is_none());
    }

    #[test]
    fn test_far_excursion_immediate_maximal_correction() {
        let mut h = Harness::new(10);
        let outcome = h.tick(0, 400);
        assert_eq!(outcome.correction, Some(-SYNC_ADJ_MAX));
        // Quick mode forced.
        assert_eq!(h.local.cycle(), SYNC_ADJ_QUICK);

        let mut h = Harness::new(10);
        let outcome = h.tick(0, -400);
        assert_eq!(outcome.correction, Some(SYNC_ADJ_MAX));
    }

    #[test]
    fn test_far_excursion_not_resent_after_ack() {
        let mut h = Harness::new(10);
        assert!(h.tick(0, 400).correction.is_some());
        // Already at the maximal correction: no duplicate send.
        assert!(h.tick(1, 400).correction.is_none());
    }

    #[test]
    fn test_small_offset_widens_window() {
        let mut h = Harness::new(4);
        h.local.set_cycle(4);
        for n in 0..4 {
            h.tick(n, 20);
        }
        // Median below threshold: window widened by one step.
        assert_eq!(h.local.cycle(), 4 + 500);
        assert_eq!(h.last_acked, 0);
    }

    #[test]
    fn test_medium_offset_incremental_correction() {
        let mut h = Harness::new(4);
        h.local.set_cycle(4);
        let mut corrections = Vec::new();
        for n in 0..4 {
            if let Some(c) = h.tick(n, 200).correction {
                corrections.push(c);
            }
        }
        // A 200us median is one micro-frame over: drift pushed down.
        assert_eq!(corrections.len(), 1);
        assert!(corrections[0] < 0);
        assert!(corrections[0] >= -SYNC_ADJ_MAX);
    }

    #[test]
    fn test_lost_ticks_reset_to_quick() {
        let mut h = Harness::new(1000);
        h.tick(0, 0);
        // Reference jumps ahead without a local tick.
        let ref_at = h.base + Duration::from_micros(5000);
        h.reference.step(ref_at);
        let outcome = h.tick(1, 0);
        assert_eq!(outcome.lost_ticks, -1);
        assert_eq!(h.local.cycle(), SYNC_ADJ_QUICK);
        assert_eq!(h.corrector.stats().lost_tick_events, 1);
    }

    #[test]
    fn test_heavy_loss_resyncs_counter() {
        let mut h = Harness::new(10_000);
        h.tick(0, 0);
        for _ in 0..200 {
            h.reference
                .step(h.base + Duration::from_micros(1_000_000));
        }
        h.tick(1, 0);
        assert_eq!(h.local.count(), h.reference.count());
    }

    #[test]
    fn test_convergence_from_constant_offset() {
        // Constant 400us offset: first tick sends the maximal pullback.
        // After it is acked, model the hardware actually slewing: each
        // acked unit removes one micro-frame of offset per window.
        let mut h = Harness::new(8);
        h.local.set_cycle(8);
        let mut offset: i64 = 400;
        let mut far_corrected = false;
        for n in 0..64u64 {
            let outcome = h.tick(n, offset);
            if outcome.correction == Some(-SYNC_ADJ_MAX) {
                far_corrected = true;
                // Hardware reacts: the offset collapses below the edge.
                offset = 140;
            }
        }
        assert!(far_corrected);
        // All subsequent samples stayed under the far-excursion edge and
        // the windowed median settled below the correction threshold.
        let stats = h.corrector.stats();
        assert!(stats.median.abs() < FAR_EXCURSION_USEC);
        assert!(stats.median.abs() < MEDIAN_CORRECTION_USEC);
    }
}
