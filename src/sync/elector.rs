//! Reference election across attached buses.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::bus::{Bus, BusRegistry};
use crate::types::BusId;

use super::{SyncMode, Ticker, TickerSnapshot};

/// Where the engine's timing reference comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ReferenceSource {
    /// No reference: nothing to phase-lock against
    None,
    /// An attached bus's hardware clock
    Bus(BusId),
    /// A host-side tick stream fed via `external_tick`
    External,
}

#[derive(Debug)]
struct ElectorState {
    source: ReferenceSource,
    external_forced: bool,
    external: Ticker,
    /// Bus whose ticks drive the global counter
    global_driver: Option<BusId>,
}

/// Elects the timing reference and keeps the other buses phase-locked
/// to it.
#[derive(Debug)]
pub struct SyncElector {
    registry: Arc<BusRegistry>,
    state: Mutex<ElectorState>,
}

impl SyncElector {
    /// Create an elector over `registry`.
    #[must_use]
    pub fn new(registry: Arc<BusRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(ElectorState {
                source: ReferenceSource::None,
                external_forced: false,
                external: Ticker::new(Instant::now()),
                global_driver: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ElectorState> {
        self.state.lock().expect("elector state poisoned")
    }

    /// Current reference source.
    #[must_use]
    pub fn source(&self) -> ReferenceSource {
        self.state().source
    }

    /// Pick the best reference and switch to it if it changed.
    ///
    /// The bus with the highest non-zero device timing priority wins;
    /// with no prioritized device present, the first transport-present
    /// bus does.
    pub fn elect(&self, reason: &str) {
        let mut best_priority = 0u32;
        let mut best: Option<Arc<Bus>> = None;
        let mut first: Option<Arc<Bus>> = None;
        for bus in self.registry.snapshot() {
            if !bus.is_transport_running() {
                continue;
            }
            if first.is_none() {
                first = Some(Arc::clone(&bus));
            }
            for device in bus.devices() {
                if device.is_present() && device.timing_priority() > best_priority {
                    best_priority = device.timing_priority();
                    best = Some(Arc::clone(&bus));
                }
            }
        }
        let winner = best.or(first);
        match &winner {
            Some(bus) => {
                tracing::debug!(reason, winner = %bus.name(), priority = best_priority, "election")
            }
            None => tracing::debug!(reason, "election: no candidates"),
        }
        let current = self.state().source;
        let winner_id = winner.as_ref().map(|b| b.id());
        let unchanged = match (current, winner_id) {
            (ReferenceSource::Bus(a), Some(b)) => a == b,
            (ReferenceSource::None | ReferenceSource::External, None) => true,
            _ => false,
        };
        if !unchanged {
            self.update_reference(winner);
        }
    }

    /// Switch the reference to `new` (or to the external/none fallback),
    /// clearing drift state and re-requesting modes on every running bus.
    pub fn update_reference(&self, new: Option<Arc<Bus>>) {
        let old = {
            let mut state = self.state();
            let old = state.source;
            state.source = match &new {
                Some(bus) => {
                    state.external_forced = false;
                    ReferenceSource::Bus(bus.id())
                }
                None if state.external_forced => ReferenceSource::External,
                None => ReferenceSource::None,
            };
            old
        };
        tracing::info!(?old, new = ?self.source(), "reference change");
        if let ReferenceSource::Bus(old_id) = old {
            if let Some(old_bus) = self.registry.get(old_id) {
                old_bus.drift_clear();
            }
        }
        if let Some(bus) = &new {
            bus.drift_clear();
            if let Err(e) = bus.request_sync(SyncMode::Reference) {
                tracing::warn!(bus = %bus.name(), error = %e, "reference request failed");
            }
        }
        // Shut all down except the wanted reference.
        let new_id = new.map(|b| b.id());
        for bus in self.registry.snapshot() {
            if Some(bus.id()) == new_id || !bus.is_transport_running() {
                continue;
            }
            if bus.self_ticking() {
                if let Err(e) = bus.request_sync(SyncMode::PhaseLocked) {
                    tracing::warn!(bus = %bus.name(), error = %e, "phase-lock request failed");
                }
            }
        }
    }

    /// Record a mode transition acked by a bus's hardware.
    pub fn confirm_ack(&self, bus: &Bus, entered: SyncMode) {
        let mut state = self.state();
        match entered {
            SyncMode::Reference => {
                state.source = ReferenceSource::Bus(bus.id());
                state.global_driver = Some(bus.id());
            }
            SyncMode::PhaseLocked => {
                state.global_driver = Some(bus.id());
                if state.source == ReferenceSource::Bus(bus.id()) {
                    state.source = if state.external_forced {
                        ReferenceSource::External
                    } else {
                        ReferenceSource::None
                    };
                }
            }
            SyncMode::None => {
                if state.source == ReferenceSource::Bus(bus.id()) {
                    state.source = if state.external_forced {
                        ReferenceSource::External
                    } else {
                        ReferenceSource::None
                    };
                }
            }
            SyncMode::Query => {}
        }
    }

    /// Whether `bus` currently drives the global tick counter.
    #[must_use]
    pub fn is_global_driver(&self, bus: BusId) -> bool {
        self.state().global_driver == Some(bus)
    }

    /// Reference snapshot for a drift step on `bus`, and whether that bus
    /// is itself the reference.
    #[must_use]
    pub fn reference_for(&self, bus: BusId) -> (Option<TickerSnapshot>, bool) {
        let source = {
            let state = self.state();
            match state.source {
                ReferenceSource::External => return (Some(state.external.snapshot()), false),
                other => other,
            }
        };
        match source {
            ReferenceSource::Bus(id) => {
                let snapshot = self.registry.get(id).map(|b| b.ticker_snapshot());
                (snapshot, id == bus)
            }
            _ => (None, false),
        }
    }

    /// Force (or stop forcing) the external host tick stream as reference.
    pub fn force_external(&self, on: bool) {
        self.state().external_forced = on;
        if on {
            self.update_reference(None);
        } else {
            self.elect("external released");
        }
    }

    /// Feed one external reference tick.
    ///
    /// Ignored while a bus reference is elected.
    pub fn external_tick(&self, now: Instant) {
        let mut state = self.state();
        if matches!(state.source, ReferenceSource::Bus(_)) {
            return;
        }
        let _ = state.external.step(now);
    }
}
