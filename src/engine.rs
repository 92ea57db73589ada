//! The engine: bus lifecycle, global tick bookkeeping and background
//! tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{Bus, BusHandle, BusRegistry, BusSummary, Device, RxDisposition, BIG_TICK_INTERVAL};
use crate::error::{BusError, Result};
use crate::family::CardFamily;
use crate::frame::{OpCode, Packet};
use crate::sync::{ReferenceSource, SyncElector, SyncMode, Ticker};
use crate::transport::Transport;
use crate::types::{BusEngineConfig, BusId, DeviceAddr};

/// Engine-wide diagnostic snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineSummary {
    /// Global tick counter
    pub tick_count: u64,
    /// Smoothed global tick period in microseconds
    pub tick_period_usec: i64,
    /// Current timing reference
    pub reference: ReferenceSource,
    /// Per-bus snapshots
    pub buses: Vec<BusSummary>,
}

/// Owns the attached buses and drives synchronization across them.
///
/// Construction and bus attachment must happen inside a tokio runtime;
/// the engine spawns its housekeeping tasks there. The tick path itself
/// is synchronous and runs inline in transport completion context.
pub struct BusEngine {
    config: Arc<BusEngineConfig>,
    registry: Arc<BusRegistry>,
    elector: SyncElector,
    global_ticker: Mutex<Ticker>,
    global_counter: AtomicU64,
    reaper_tx: Mutex<Option<mpsc::UnboundedSender<Arc<Bus>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusEngine")
            .field("buses", &self.registry.len())
            .field("tick_count", &self.global_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BusEngine {
    /// Create an engine and start its reaper task.
    #[must_use]
    pub fn new(config: BusEngineConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(BusRegistry::new());
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            elector: SyncElector::new(Arc::clone(&registry)),
            registry,
            global_ticker: Mutex::new(Ticker::new(Instant::now())),
            global_counter: AtomicU64::new(0),
            reaper_tx: Mutex::new(Some(reaper_tx)),
            tasks: Mutex::new(Vec::new()),
            config: Arc::clone(&config),
        });
        let reaper = tokio::spawn(reap_detached(reaper_rx, config));
        engine.tasks.lock().expect("task list poisoned").push(reaper);
        engine
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &BusEngineConfig {
        &self.config
    }

    /// Number of attached buses.
    #[must_use]
    pub fn bus_count(&self) -> usize {
        self.registry.len()
    }

    /// Resolve a bus id.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] for detached or stale ids.
    pub fn bus(&self, id: BusId) -> Result<BusHandle> {
        self.bus_arc(id).map(BusHandle::new)
    }

    fn bus_arc(&self, id: BusId) -> Result<Arc<Bus>> {
        self.registry.get(id).ok_or(BusError::NoSuchBus {
            index: id.index(),
            generation: id.generation(),
        })
    }

    // ----- lifecycle -----

    /// Attach a new bus over `transport` and start its host heartbeat.
    pub fn attach_bus(self: &Arc<Self>, transport: Arc<dyn Transport>) -> BusHandle {
        let config = Arc::clone(&self.config);
        let bus = self
            .registry
            .insert_with(move |id| Bus::new(id, config));
        bus.connect_transport(transport);
        // New hardware starts phase-locked until an election promotes it.
        if let Err(e) = bus.request_sync(SyncMode::PhaseLocked) {
            tracing::warn!(bus = %bus.name(), error = %e, "initial sync request failed");
        }
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(tokio::spawn(heartbeat(
            Arc::downgrade(&bus),
            self.config.heartbeat_interval,
        )));
        if self.config.deferred_rx {
            tasks.push(tokio::spawn(receive_worker(
                Arc::downgrade(self),
                Arc::downgrade(&bus),
            )));
        }
        BusHandle::new(bus)
    }

    /// Detach a bus: stop its ticks, flush pending commands, free every
    /// frame buffer and hand the final reference to the reaper.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] for unknown ids; the command-drain
    /// wait is bounded by the configured detach timeout.
    pub async fn detach_bus(&self, id: BusId) -> Result<()> {
        let bus = self.bus_arc(id)?;
        let _ = bus.request_sync(SyncMode::None);
        // Flush queued commands before tearing the queues down.
        while !bus.command_queue.is_empty() {
            bus.command_queue_tick();
        }
        bus.wait_command_drained(self.config.detach_timeout).await?;
        bus.disconnect();
        let _ = self.registry.remove(id);
        self.elector.elect("disconnect");
        if let Some(tx) = &*self.reaper_tx.lock().expect("reaper channel poisoned") {
            let _ = tx.send(bus);
        }
        Ok(())
    }

    /// Detach every bus and stop the background tasks.
    pub async fn shutdown(&self) {
        let ids: Vec<BusId> = self.registry.snapshot().iter().map(|b| b.id()).collect();
        for id in ids {
            if let Err(e) = self.detach_bus(id).await {
                tracing::warn!(bus = %id, error = %e, "detach during shutdown failed");
            }
        }
        let _ = self.reaper_tx.lock().expect("reaper channel poisoned").take();
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }

    // ----- devices -----

    /// Register a device behind a bus and re-run the reference election.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] or the bus's registration error.
    pub fn register_device(
        &self,
        bus_id: BusId,
        addr: DeviceAddr,
        channels: usize,
        timing_priority: u32,
        family: Arc<dyn CardFamily>,
    ) -> Result<Arc<Device>> {
        let bus = self.bus_arc(bus_id)?;
        let device = Arc::new(Device::new(addr, bus_id, channels, timing_priority, family));
        bus.register_device(Arc::clone(&device))?;
        self.elector.elect("device registered");
        Ok(device)
    }

    /// Remove a device and re-run the reference election.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] or [`BusError::NoSuchDevice`].
    pub fn unregister_device(&self, bus_id: BusId, addr: DeviceAddr) -> Result<()> {
        let bus = self.bus_arc(bus_id)?;
        bus.remove_device(addr)
            .ok_or(BusError::NoSuchDevice { addr })?;
        self.elector.elect("device removed");
        Ok(())
    }

    // ----- receive path -----

    /// Deliver a raw inbound transfer from a transport.
    ///
    /// Sync-flagged PCM frames run the full tick sequence inline before
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] or a buffer-allocation failure.
    pub fn frame_received(&self, id: BusId, data: &[u8]) -> Result<()> {
        let bus = self.bus_arc(id)?;
        let mut frame = bus.alloc_recv_frame()?;
        frame.fill_from(data);
        match bus.frame_received(frame) {
            RxDisposition::TickNow => self.do_tick(&bus, Instant::now()),
            RxDisposition::Queued => {
                if !self.config.deferred_rx {
                    self.process_receive(&bus);
                }
            }
            RxDisposition::Handled => {}
        }
        Ok(())
    }

    fn process_receive(&self, bus: &Bus) {
        for entered in bus.receive_tick() {
            self.elector.confirm_ack(bus, entered);
        }
    }

    // ----- tick path -----

    /// Run the tick sequence for `bus`: command slot, global bookkeeping,
    /// drift step and (for self-ticking buses) the PCM cycle.
    pub fn do_tick(&self, bus: &Bus, now: Instant) {
        bus.command_queue_tick();
        if self.elector.is_global_driver(bus.id()) {
            self.global_tick(now);
        }
        let (reference, is_reference) = self.elector.reference_for(bus.id());
        let outcome = bus.drift_step(now, reference, is_reference);
        if let Some(correction) = outcome.correction {
            if let Err(e) = bus.send_drift(correction) {
                tracing::warn!(bus = %bus.name(), error = %e, "drift send failed");
            }
        }
        if bus.self_ticking() {
            bus.bus_tick(now);
        }
        bus.set_global_counter(self.global_counter.load(Ordering::Relaxed));
    }

    fn global_tick(&self, now: Instant) {
        let counter = self.global_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if counter % BIG_TICK_INTERVAL == 0 {
            self.reset_sync_counters();
        }
        let _ = self
            .global_ticker
            .lock()
            .expect("global ticker poisoned")
            .step(now);
    }

    /// Periodic housekeeping: ask every self-ticking bus to reset its
    /// hardware sync counters.
    fn reset_sync_counters(&self) {
        for bus in self.registry.snapshot() {
            if !bus.is_transport_running() || !bus.self_ticking() {
                continue;
            }
            let packet = Packet::control(
                DeviceAddr::new(0, 0).unwrap_or_else(|| unreachable!("address 00 is always valid")),
                OpCode::ResetSyncCounters,
                Vec::new(),
            );
            let result = bus.alloc_send_frame().and_then(|mut frame| {
                frame.push_packet(&packet)?;
                bus.send_command(frame)
            });
            if let Err(e) = result {
                tracing::debug!(bus = %bus.name(), error = %e, "sync counter reset dropped");
            }
        }
    }

    /// Global tick counter.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.global_counter.load(Ordering::Relaxed)
    }

    // ----- reference control -----

    /// Current timing reference.
    #[must_use]
    pub fn reference(&self) -> ReferenceSource {
        self.elector.source()
    }

    /// Feed one tick from an external host-side timing source.
    pub fn external_tick(&self, now: Instant) {
        self.elector.external_tick(now);
    }

    /// Force the external tick stream as the reference (or release it and
    /// re-run the automatic election).
    pub fn force_external_reference(&self, on: bool) {
        self.elector.force_external(on);
    }

    /// Manually select a bus as the timing reference.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] for unknown ids.
    pub fn set_reference(&self, id: BusId) -> Result<()> {
        let bus = self.bus_arc(id)?;
        self.elector.update_reference(Some(bus));
        Ok(())
    }

    /// Ask a bus to report its sync mode without changing it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSuchBus`] or a command-path failure.
    pub fn query_sync(&self, id: BusId) -> Result<()> {
        self.bus_arc(id)?.request_sync(SyncMode::Query)
    }

    // ----- diagnostics -----

    /// Engine-wide diagnostic snapshot.
    #[must_use]
    pub fn summary(&self) -> EngineSummary {
        let tick_period_usec = self
            .global_ticker
            .lock()
            .expect("global ticker poisoned")
            .tick_period_usec();
        EngineSummary {
            tick_count: self.tick_count(),
            tick_period_usec,
            reference: self.elector.source(),
            buses: self.registry.snapshot().iter().map(|b| b.summary()).collect(),
        }
    }

    /// Snapshot as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Propagates serialization errors.
    pub fn summary_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.summary())
    }
}

/// Host heartbeat: drives a bus's command queue at the nominal tick rate
/// until hardware ticks take over. Exits when the bus is dropped.
async fn heartbeat(bus: Weak<Bus>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(bus) = bus.upgrade() else { break };
        if !bus.is_transport_running() {
            break;
        }
        if bus.heartbeat_enabled() {
            bus.command_queue_tick();
        }
    }
    tracing::debug!("heartbeat task stopped");
}

/// Deferred receive worker: dispatches queued command frames off the
/// transport completion path.
async fn receive_worker(engine: Weak<BusEngine>, bus: Weak<Bus>) {
    loop {
        let Some(bus) = bus.upgrade() else { break };
        if !bus.is_transport_running() {
            break;
        }
        if bus.receive_queue.is_empty() {
            // Bounded wait so the bus handle is released periodically.
            let notified = bus.rx_pending.notified();
            let _ = tokio::time::timeout(std::time::Duration::from_millis(50), notified).await;
            continue;
        }
        let Some(engine) = engine.upgrade() else { break };
        engine.process_receive(&bus);
    }
    tracing::debug!("receive worker stopped");
}

/// Waits for the last external handle to a detached bus to drop, so late
/// frame completions never touch freed state. Each [`BusHandle`] drop
/// fires the bus's release notification; the wait is bounded by the
/// configured detach timeout.
async fn reap_detached(
    mut rx: mpsc::UnboundedReceiver<Arc<Bus>>,
    config: Arc<BusEngineConfig>,
) {
    while let Some(bus) = rx.recv().await {
        let deadline = tokio::time::Instant::now() + config.detach_timeout;
        loop {
            // Register the waiter before re-checking the count, so a drop
            // between the check and the await is not missed.
            let released = bus.released.notified();
            if Arc::strong_count(&bus) <= 1 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                break;
            }
        }
        if Arc::strong_count(&bus) > 1 {
            tracing::warn!(bus = %bus.name(), "bus still referenced after detach timeout");
        } else {
            tracing::debug!(bus = %bus.name(), "bus released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::GenericFamily;
    use crate::testing::MockTransport;

    fn addr(unit: u8, subunit: u8) -> DeviceAddr {
        DeviceAddr::new(unit, subunit).unwrap()
    }

    #[tokio::test]
    async fn test_attach_register_elect() {
        let engine = BusEngine::new(BusEngineConfig::default());
        let transport = MockTransport::shared();
        let bus = engine.attach_bus(transport.clone());
        assert_eq!(engine.bus_count(), 1);

        let _ = engine
            .register_device(bus.id(), addr(0, 0), 8, 5, Arc::new(GenericFamily))
            .unwrap();
        assert_eq!(engine.reference(), ReferenceSource::Bus(bus.id()));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_slot_rejected() {
        let engine = BusEngine::new(BusEngineConfig::default());
        let bus = engine.attach_bus(MockTransport::shared());
        let _ = engine
            .register_device(bus.id(), addr(0, 0), 8, 0, Arc::new(GenericFamily))
            .unwrap();
        let err = engine
            .register_device(bus.id(), addr(0, 0), 8, 0, Arc::new(GenericFamily))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidState { .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_invalidates_id() {
        let engine = BusEngine::new(BusEngineConfig::default());
        let bus = engine.attach_bus(MockTransport::shared());
        let id = bus.id();
        drop(bus);
        engine.detach_bus(id).await.unwrap();
        assert!(matches!(engine.bus(id), Err(BusError::NoSuchBus { .. })));
        assert!(matches!(
            engine.frame_received(id, &[0, 0, 0, 0]),
            Err(BusError::NoSuchBus { .. })
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_ack_drives_global_counter() {
        let engine = BusEngine::new(BusEngineConfig::default());
        let transport = MockTransport::shared();
        let bus = engine.attach_bus(transport.clone());
        let _ = engine
            .register_device(bus.id(), addr(0, 0), 8, 5, Arc::new(GenericFamily))
            .unwrap();

        // Hardware acks the reference request.
        let ack = Packet::control(
            addr(0, 0),
            OpCode::SyncSource,
            vec![SyncMode::Reference.to_wire(), 0],
        );
        engine.frame_received(bus.id(), &ack.encode()).unwrap();
        assert!(bus.self_ticking());
        assert_eq!(bus.sync_mode(), SyncMode::Reference);

        // A sync-flagged PCM frame from the hardware now drives the tick.
        let mut pcm = Packet::pcm_write(addr(0, 0), crate::types::ChannelSet::single(0));
        pcm.header.opcode = OpCode::PcmRead;
        pcm.header.sync = true;
        engine.frame_received(bus.id(), &pcm.encode()).unwrap();
        assert_eq!(engine.tick_count(), 1);
        // The tick also produced an outbound PCM frame (unit-0 keepalive).
        assert!(transport
            .sent_frames()
            .iter()
            .flatten()
            .any(|p| p.header.opcode == OpCode::PcmWrite));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_drains_commands_before_self_ticking() {
        let engine = BusEngine::new(BusEngineConfig::default());
        let transport = MockTransport::shared();
        let bus = engine.attach_bus(transport.clone());
        bus.request_sync(SyncMode::Query).unwrap();
        assert_eq!(transport.sent_count(), 0);

        // The 1 kHz heartbeat picks up both the attach-time phase-lock
        // request and the query.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(transport.sent_count(), 2);
        engine.shutdown().await;
    }
}
