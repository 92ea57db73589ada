//! Bus state: queues, pools, devices and synchronization bookkeeping.

mod device;
mod orchestrator;
mod registry;

pub use device::{Chunk, Device, DeviceCounters, DeviceSummary};
pub use orchestrator::RxDisposition;
pub use registry::BusRegistry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::diag::RateLimited;
use crate::error::{BusError, Result};
use crate::frame::{Frame, FrameQueue, OpCode, Packet, QueueStats};
use crate::sync::{
    usec_diff, DriftCorrector, DriftOutcome, DriftStats, SyncMode, Ticker, TickerSnapshot,
    SYNC_ADJ_MAX,
};
use crate::transport::Transport;
use crate::types::{BusEngineConfig, BusId, DeviceAddr, MAX_DEVICES};

/// Global ticks between housekeeping rounds; also the number of startup
/// ticks excluded from timing statistics.
pub const BIG_TICK_INTERVAL: u64 = 1000;

/// Nominal tick period in microseconds.
pub const NOMINAL_TICK_USEC: i64 = 1000;

/// Min/max/outlier tracking for the spacing of sync-flagged PCM frames.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TickTiming {
    /// Shortest observed spacing, microseconds
    pub min_usec: i64,
    /// Longest observed spacing, microseconds
    pub max_usec: i64,
    /// Observations outside the configured tolerance
    pub outliers: u64,
}

impl Default for TickTiming {
    fn default() -> Self {
        Self {
            min_usec: i64::MAX,
            max_usec: i64::MIN,
            outliers: 0,
        }
    }
}

impl TickTiming {
    fn observe(&mut self, usec: i64, tolerance: i64) -> bool {
        if usec > self.max_usec {
            self.max_usec = usec;
        }
        if usec < self.min_usec {
            self.min_usec = usec;
        }
        (usec - NOMINAL_TICK_USEC).abs() > tolerance
    }
}

#[derive(Debug)]
struct BusState {
    transport: Option<Arc<dyn Transport>>,
    sync_mode: SyncMode,
    self_ticking: bool,
    /// Last correction value acknowledged by the hardware
    sync_adjustment: i32,
    /// Last correction value sent to the hardware
    sync_adjustment_offset: i32,
    last_tx_sync: Option<Instant>,
    last_rx_sync: Option<Instant>,
    tx_timing: TickTiming,
    rx_timing: TickTiming,
}

#[derive(Debug)]
struct SyncState {
    ticker: Ticker,
    drift: DriftCorrector,
}

/// Monotonic per-bus event counters.
#[derive(Debug, Default)]
pub struct BusCounters {
    /// Frames handed to the transport
    pub tx_frames: AtomicU64,
    /// Frames received from the transport
    pub rx_frames: AtomicU64,
    /// PCM frames sent
    pub tx_pcm_frames: AtomicU64,
    /// PCM frames received and demuxed
    pub rx_pcm_frames: AtomicU64,
    /// Sync-flagged PCM frames received (tick source)
    pub pcm_rx_ticks: AtomicU64,
    /// PCM frames received without the sync flag
    pub frag_frames: AtomicU64,
    /// Outbound ticks that needed more than one PCM frame
    pub tx_pcm_frag: AtomicU64,
    /// Frames dropped (queue overflow, shutdown, send failure)
    pub dropped_frames: AtomicU64,
    /// Inbound packets that failed validation
    pub recv_errors: AtomicU64,
}

pub(crate) struct RateGates {
    pub cmd_drop: RateLimited,
    pub pcm_drop: RateLimited,
    pub alloc_fail: RateLimited,
    pub bad_pcm: RateLimited,
    pub timing: RateLimited,
    pub unknown_device: RateLimited,
}

/// Diagnostic snapshot of one bus.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BusSummary {
    /// Display name ("XBUS-nn")
    pub name: String,
    /// Whether a transport is attached
    pub transport_running: bool,
    /// Current sync mode
    pub sync_mode: SyncMode,
    /// Whether hardware ticks drive this bus
    pub self_ticking: bool,
    /// Last acknowledged drift correction
    pub sync_adjustment: i32,
    /// Tick count of the bus ticker
    pub tick_count: u64,
    /// Smoothed tick period in microseconds
    pub tick_period_usec: i64,
    /// Drift statistics
    pub drift: DriftStats,
    /// TX sync-frame spacing statistics
    pub tx_timing: TickTiming,
    /// RX sync-frame spacing statistics
    pub rx_timing: TickTiming,
    /// Per-queue statistics, in fixed order
    pub queues: Vec<(&'static str, QueueStats)>,
    /// Sync-flagged PCM frames received
    pub pcm_rx_ticks: u64,
    /// PCM frames received without the sync flag
    pub frag_frames: u64,
    /// Frames dropped
    pub dropped_frames: u64,
    /// Inbound packets that failed validation
    pub recv_errors: u64,
    /// Registered devices
    pub devices: Vec<DeviceSummary>,
}

/// One attached hardware unit: its transport, frame queues, buffer pools,
/// registered devices and clock-sync state.
pub struct Bus {
    id: BusId,
    name: String,
    config: Arc<BusEngineConfig>,
    pub(crate) command_queue: FrameQueue,
    pub(crate) receive_queue: FrameQueue,
    pub(crate) send_pool: FrameQueue,
    pub(crate) receive_pool: FrameQueue,
    pub(crate) pcm_inbound: FrameQueue,
    devices: RwLock<Vec<Option<Arc<Device>>>>,
    state: Mutex<BusState>,
    sync: Mutex<SyncState>,
    heartbeat_on: AtomicBool,
    global_counter: AtomicU64,
    command_drained: Notify,
    pub(crate) rx_pending: Notify,
    pub(crate) released: Notify,
    pub(crate) counters: BusCounters,
    pub(crate) gates: RateGates,
}

/// Caller-facing handle to an attached bus.
///
/// Dereferences to [`Bus`]. Dropping a handle wakes the engine's reaper,
/// which frees a detached bus once the last handle is gone.
pub struct BusHandle {
    bus: Arc<Bus>,
}

impl BusHandle {
    pub(crate) fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }
}

impl Clone for BusHandle {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl std::ops::Deref for BusHandle {
    type Target = Bus;

    fn deref(&self) -> &Bus {
        &self.bus
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.bus.released.notify_waiters();
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.bus.fmt(f)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("transport_running", &self.is_transport_running())
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Create a detached bus. The engine connects a transport afterwards.
    #[must_use]
    pub fn new(id: BusId, config: Arc<BusEngineConfig>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            name: id.to_string(),
            command_queue: FrameQueue::new("command", config.command_queue_capacity),
            receive_queue: FrameQueue::new("receive", config.receive_queue_capacity),
            send_pool: FrameQueue::new("send_pool", config.send_pool_capacity),
            receive_pool: FrameQueue::new("receive_pool", config.receive_pool_capacity),
            pcm_inbound: FrameQueue::new("pcm_inbound", config.pcm_inbound_capacity),
            devices: RwLock::new((0..MAX_DEVICES).map(|_| None).collect()),
            state: Mutex::new(BusState {
                transport: None,
                sync_mode: SyncMode::None,
                self_ticking: false,
                sync_adjustment: 0,
                sync_adjustment_offset: 0,
                last_tx_sync: None,
                last_rx_sync: None,
                tx_timing: TickTiming::default(),
                rx_timing: TickTiming::default(),
            }),
            sync: Mutex::new(SyncState {
                ticker: Ticker::new(now),
                drift: DriftCorrector::new(config.wanted_offset_usec),
            }),
            heartbeat_on: AtomicBool::new(false),
            global_counter: AtomicU64::new(0),
            command_drained: Notify::new(),
            rx_pending: Notify::new(),
            released: Notify::new(),
            counters: BusCounters::default(),
            gates: RateGates {
                cmd_drop: RateLimited::new(1003),
                pcm_drop: RateLimited::new(1003),
                alloc_fail: RateLimited::new(3001),
                bad_pcm: RateLimited::new(1003),
                timing: RateLimited::new(5003),
                unknown_device: RateLimited::new(1003),
            },
            config,
        })
    }

    /// Registry id.
    #[must_use]
    pub fn id(&self) -> BusId {
        self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine configuration this bus was created with.
    #[must_use]
    pub fn config(&self) -> &BusEngineConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().expect("bus state poisoned")
    }

    fn sync_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.sync.lock().expect("bus sync state poisoned")
    }

    // ----- transport -----

    /// Attach a transport and enable the queues.
    pub fn connect_transport(&self, transport: Arc<dyn Transport>) {
        tracing::info!(bus = %self.name, transport = transport.name(), "transport connected");
        for q in [
            &self.command_queue,
            &self.receive_queue,
            &self.send_pool,
            &self.receive_pool,
            &self.pcm_inbound,
        ] {
            q.enable();
        }
        let mut state = self.state();
        state.transport = Some(transport);
        state.sync_mode = SyncMode::None;
        state.self_ticking = false;
        drop(state);
        self.heartbeat_on.store(true, Ordering::Release);
    }

    /// The attached transport, if any.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.state().transport.clone()
    }

    fn transport_or_err(&self) -> Result<Arc<dyn Transport>> {
        self.transport().ok_or_else(|| BusError::TransportMissing {
            bus_name: self.name.clone(),
        })
    }

    /// Whether a transport is attached and the bus can move frames.
    #[must_use]
    pub fn is_transport_running(&self) -> bool {
        self.state().transport.is_some()
    }

    // ----- frame buffers -----

    /// Get a send buffer: pool hit, or a fresh transport allocation.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TransportMissing`] when detached and
    /// [`BusError::FrameAlloc`] when the transport cannot allocate.
    pub fn alloc_send_frame(&self) -> Result<Frame> {
        if let Some(frame) = self.send_pool.dequeue() {
            return Ok(frame);
        }
        let transport = self.transport_or_err()?;
        transport
            .alloc_frame(self.id)
            .ok_or_else(|| BusError::FrameAlloc {
                bus_name: self.name.clone(),
            })
    }

    /// Return a send buffer to the pool (or the transport on overflow).
    pub fn free_send_frame(&self, mut frame: Frame) {
        frame.reset();
        if let Err(frame) = self.send_pool.enqueue(frame) {
            if let Some(transport) = self.transport() {
                transport.free_frame(frame);
            }
        }
    }

    /// Get a receive buffer for an inbound transfer.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Bus::alloc_send_frame`].
    pub fn alloc_recv_frame(&self) -> Result<Frame> {
        if let Some(frame) = self.receive_pool.dequeue() {
            return Ok(frame);
        }
        let transport = self.transport_or_err()?;
        transport
            .alloc_frame(self.id)
            .ok_or_else(|| BusError::FrameAlloc {
                bus_name: self.name.clone(),
            })
    }

    /// Return a receive buffer to the pool (or the transport on overflow).
    pub fn free_recv_frame(&self, mut frame: Frame) {
        frame.reset();
        if let Err(frame) = self.receive_pool.enqueue(frame) {
            if let Some(transport) = self.transport() {
                transport.free_frame(frame);
            }
        }
    }

    // ----- command path -----

    /// Queue a command frame for transmission on a subsequent tick.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TransportMissing`] when detached or
    /// [`BusError::QueueFull`] when the command queue rejects the frame.
    /// The frame is recycled in both cases.
    pub fn send_command(&self, frame: Frame) -> Result<()> {
        if !self.is_transport_running() {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            self.free_send_frame(frame);
            return Err(BusError::TransportMissing {
                bus_name: self.name.clone(),
            });
        }
        if let Err(frame) = self.command_queue.enqueue(frame) {
            if let Some(n) = self.gates.cmd_drop.check() {
                tracing::warn!(bus = %self.name, dropped = n, "command queue full, frame dropped");
            }
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            self.free_send_frame(frame);
            return Err(BusError::QueueFull { queue: "command" });
        }
        Ok(())
    }

    /// Send at most one queued command frame; wake drain-waiters when the
    /// queue has gone empty.
    pub fn command_queue_tick(&self) {
        let Some(frame) = self.command_queue.dequeue() else {
            self.command_drained.notify_waiters();
            return;
        };
        let Some(transport) = self.transport() else {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match transport.send_frame(frame) {
            Ok(()) => {
                self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(bus = %self.name, error = %e, "command send failed");
            }
        }
    }

    /// Wait until the command queue has fully drained.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Timeout`] when the queue does not drain within
    /// `timeout`.
    pub async fn wait_command_drained(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.command_queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BusError::Timeout { duration: timeout });
            }
            let _ = tokio::time::timeout(remaining, self.command_drained.notified()).await;
        }
        Ok(())
    }

    // ----- sync protocol -----

    fn broadcast_addr() -> DeviceAddr {
        DeviceAddr::new(0, 0).unwrap_or_else(|| unreachable!("address 00 is always valid"))
    }

    fn send_sync_source(&self, mode: SyncMode, drift: i32) -> Result<()> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let drift_byte = (drift as i8) as u8;
        let packet = Packet::control(
            Self::broadcast_addr(),
            OpCode::SyncSource,
            vec![mode.to_wire(), drift_byte],
        );
        let mut frame = self.alloc_send_frame()?;
        frame.push_packet(&packet)?;
        self.send_command(frame)
    }

    /// Ask the hardware to switch sync mode. The switch takes effect when
    /// the hardware acks via [`Bus::got_new_sync_ack`].
    ///
    /// # Errors
    ///
    /// Propagates command-path failures.
    pub fn request_sync(&self, mode: SyncMode) -> Result<()> {
        tracing::debug!(bus = %self.name, %mode, "sync mode requested");
        self.send_sync_source(mode, 0)
    }

    /// Send a drift correction to the hardware PLL.
    ///
    /// # Errors
    ///
    /// Propagates command-path failures.
    pub fn send_drift(&self, correction: i32) -> Result<()> {
        debug_assert!(correction.abs() <= SYNC_ADJ_MAX);
        let mut state = self.state();
        let direction = if correction > state.sync_adjustment_offset {
            "up"
        } else {
            "down"
        };
        state.sync_adjustment_offset = correction;
        drop(state);
        tracing::debug!(bus = %self.name, correction, direction, "drift adjust");
        self.send_sync_source(SyncMode::PhaseLocked, correction)
    }

    /// Process a sync-source acknowledgement from the hardware.
    ///
    /// Records the acked correction, and switches mode when the acked mode
    /// differs from the current one. Returns the newly entered mode, or
    /// `None` when nothing changed.
    pub fn got_new_sync_ack(&self, mode: SyncMode, drift: i32) -> Option<SyncMode> {
        let mut state = self.state();
        tracing::debug!(
            bus = %self.name, %mode, drift,
            pcm_rx_ticks = self.counters.pcm_rx_ticks.load(Ordering::Relaxed),
            "sync ack",
        );
        state.sync_adjustment = drift;
        if state.sync_mode == mode {
            return None;
        }
        match mode {
            SyncMode::Reference | SyncMode::PhaseLocked => {
                state.sync_mode = mode;
                state.self_ticking = true;
                drop(state);
                self.heartbeat_on.store(false, Ordering::Release);
                Some(mode)
            }
            SyncMode::None => {
                state.sync_mode = mode;
                state.self_ticking = false;
                drop(state);
                self.heartbeat_on.store(true, Ordering::Release);
                Some(mode)
            }
            SyncMode::Query => None,
        }
    }

    /// Current sync mode.
    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.state().sync_mode
    }

    /// Whether hardware ticks currently drive this bus.
    #[must_use]
    pub fn self_ticking(&self) -> bool {
        self.state().self_ticking
    }

    /// Last drift correction the hardware acknowledged.
    #[must_use]
    pub fn sync_adjustment(&self) -> i32 {
        self.state().sync_adjustment
    }

    /// Whether the host heartbeat should drive the command queue.
    #[must_use]
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_on.load(Ordering::Acquire)
    }

    /// Snapshot this bus's ticker for use as a drift reference.
    #[must_use]
    pub fn ticker_snapshot(&self) -> TickerSnapshot {
        self.sync_state().ticker.snapshot()
    }

    /// Reset drift statistics and measurement window (reference change).
    pub fn drift_clear(&self) {
        let mut sync = self.sync_state();
        let SyncState { ticker, drift } = &mut *sync;
        drift.clear(ticker);
    }

    /// Advance the ticker and run one drift step against `reference`.
    pub fn drift_step(
        &self,
        now: Instant,
        reference: Option<TickerSnapshot>,
        is_reference: bool,
    ) -> DriftOutcome {
        let (phase_locked, acked) = {
            let state = self.state();
            (
                state.sync_mode == SyncMode::PhaseLocked,
                state.sync_adjustment,
            )
        };
        let mut sync = self.sync_state();
        let SyncState { ticker, drift } = &mut *sync;
        let reference = if phase_locked { reference } else { None };
        drift.step(ticker, now, reference, is_reference, acked)
    }

    pub(crate) fn observe_tx_sync(&self, now: Instant) {
        let started = self.counters.pcm_rx_ticks.load(Ordering::Relaxed) > BIG_TICK_INTERVAL;
        let mut state = self.state();
        let last = state.last_tx_sync.replace(now);
        if let (Some(last), true) = (last, started) {
            let usec = usec_diff(now, last);
            if state.tx_timing.observe(usec, self.config.tick_tolerance_usec) {
                state.tx_timing.outliers += 1;
                drop(state);
                if let Some(n) = self.gates.timing.check() {
                    tracing::debug!(bus = %self.name, usec, outliers = n, "bad PCM TX timing");
                }
            }
        }
    }

    pub(crate) fn observe_rx_sync(&self, now: Instant) {
        let started = self.counters.pcm_rx_ticks.load(Ordering::Relaxed) > BIG_TICK_INTERVAL;
        let mut state = self.state();
        let last = state.last_rx_sync.replace(now);
        if let (Some(last), true) = (last, started) {
            let usec = usec_diff(now, last);
            if state.rx_timing.observe(usec, self.config.tick_tolerance_usec) {
                state.rx_timing.outliers += 1;
                drop(state);
                if let Some(n) = self.gates.timing.check() {
                    tracing::debug!(bus = %self.name, usec, outliers = n, "bad PCM RX timing");
                }
            }
        }
    }

    /// Record the global tick counter observed at this bus's last tick.
    pub(crate) fn set_global_counter(&self, counter: u64) {
        self.global_counter.store(counter, Ordering::Relaxed);
    }

    /// Global tick counter at this bus's last tick.
    #[must_use]
    pub fn global_counter(&self) -> u64 {
        self.global_counter.load(Ordering::Relaxed)
    }

    // ----- devices -----

    /// Register a device at its address slot.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidState`] when the slot is occupied.
    pub fn register_device(&self, device: Arc<Device>) -> Result<()> {
        let mut devices = self.devices.write().expect("device table poisoned");
        let slot = &mut devices[device.addr().slot()];
        if slot.is_some() {
            return Err(BusError::InvalidState {
                message: format!("device slot {} already occupied", device.addr()),
            });
        }
        tracing::info!(bus = %self.name, device = %device.addr(), family = device.family().name(), "device registered");
        *slot = Some(device);
        Ok(())
    }

    /// Remove the device at `addr`, if any.
    #[must_use]
    pub fn remove_device(&self, addr: DeviceAddr) -> Option<Arc<Device>> {
        let mut devices = self.devices.write().expect("device table poisoned");
        let device = devices[addr.slot()].take();
        if let Some(d) = &device {
            d.set_present(false);
        }
        device
    }

    /// Look up the device at `addr`.
    #[must_use]
    pub fn device(&self, addr: DeviceAddr) -> Option<Arc<Device>> {
        self.devices.read().expect("device table poisoned")[addr.slot()].clone()
    }

    /// All registered devices, in slot order.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .expect("device table poisoned")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    // ----- lifecycle -----

    /// Tear the bus down: mark devices gone, disable every queue and hand
    /// all pooled and queued frames back to the transport.
    pub fn disconnect(&self) {
        tracing::info!(bus = %self.name, "disconnecting");
        for device in self.devices() {
            device.set_present(false);
        }
        self.heartbeat_on.store(false, Ordering::Release);
        let transport = {
            let mut state = self.state();
            state.self_ticking = false;
            state.sync_mode = SyncMode::None;
            state.transport.take()
        };
        for q in [
            &self.receive_queue,
            &self.command_queue,
            &self.pcm_inbound,
            &self.send_pool,
            &self.receive_pool,
        ] {
            for frame in q.drain() {
                if let Some(t) = &transport {
                    t.free_frame(frame);
                }
            }
        }
        self.command_drained.notify_waiters();
        self.rx_pending.notify_waiters();
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn summary(&self) -> BusSummary {
        let (sync_mode, self_ticking, sync_adjustment, tx_timing, rx_timing, running) = {
            let state = self.state();
            (
                state.sync_mode,
                state.self_ticking,
                state.sync_adjustment,
                state.tx_timing,
                state.rx_timing,
                state.transport.is_some(),
            )
        };
        let (tick_count, tick_period_usec, drift) = {
            let sync = self.sync_state();
            (
                sync.ticker.count(),
                sync.ticker.tick_period_usec(),
                sync.drift.stats(),
            )
        };
        BusSummary {
            name: self.name.clone(),
            transport_running: running,
            sync_mode,
            self_ticking,
            sync_adjustment,
            tick_count,
            tick_period_usec,
            drift,
            tx_timing,
            rx_timing,
            queues: vec![
                ("command", self.command_queue.stats()),
                ("receive", self.receive_queue.stats()),
                ("send_pool", self.send_pool.stats()),
                ("receive_pool", self.receive_pool.stats()),
                ("pcm_inbound", self.pcm_inbound.stats()),
            ],
            pcm_rx_ticks: self.counters.pcm_rx_ticks.load(Ordering::Relaxed),
            frag_frames: self.counters.frag_frames.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
            devices: self.devices().iter().map(|d| d.summary()).collect(),
        }
    }
}
