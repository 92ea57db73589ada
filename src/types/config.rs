use std::time::Duration;

/// Configuration for [`crate::BusEngine`] behavior
#[derive(Debug, Clone)]
pub struct BusEngineConfig {
    /// Wanted fixed offset between a bus tick and the reference tick,
    /// in microseconds (default: 500)
    pub wanted_offset_usec: i64,

    /// Process inbound command frames on a deferred worker task instead of
    /// inline in the transport completion path (default: false)
    pub deferred_rx: bool,

    /// Host heartbeat interval used while a bus is not yet self-ticking
    /// (default: 1ms, the nominal tick period)
    pub heartbeat_interval: Duration,

    /// Capacity of the outbound command queue (default: 200)
    pub command_queue_capacity: usize,

    /// Capacity of the inbound raw-frame queue (default: 50)
    pub receive_queue_capacity: usize,

    /// Capacity of the reusable send-buffer pool (default: 200)
    pub send_pool_capacity: usize,

    /// Capacity of the reusable receive-buffer pool (default: 50)
    pub receive_pool_capacity: usize,

    /// Capacity of the inbound PCM frame queue drained at tick time
    /// (default: 10)
    pub pcm_inbound_capacity: usize,

    /// Bound on waiting for the last owner of a detached bus to drop
    /// (default: 10 seconds)
    pub detach_timeout: Duration,

    /// Deviation from the nominal 1000µs tick beyond which PCM TX/RX timing
    /// is flagged in diagnostics (default: 175µs)
    pub tick_tolerance_usec: i64,
}

impl Default for BusEngineConfig {
    fn default() -> Self {
        Self {
            wanted_offset_usec: 500,
            deferred_rx: false,
            heartbeat_interval: Duration::from_millis(1),
            command_queue_capacity: 200,
            receive_queue_capacity: 50,
            send_pool_capacity: 200,
            receive_pool_capacity: 50,
            pcm_inbound_capacity: 10,
            detach_timeout: Duration::from_secs(10),
            tick_tolerance_usec: 175,
        }
    }
}

impl BusEngineConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> BusEngineConfigBuilder {
        BusEngineConfigBuilder::default()
    }
}

/// Builder for `BusEngineConfig`
#[derive(Debug, Clone, Default)]
pub struct BusEngineConfigBuilder {
    config: BusEngineConfig,
}

impl BusEngineConfigBuilder {
    /// Set the wanted reference offset in microseconds
    #[must_use]
    pub fn wanted_offset_usec(mut self, usec: i64) -> Self {
        self.config.wanted_offset_usec = usec;
        self
    }

    /// Enable or disable deferred receive processing
    #[must_use]
    pub fn deferred_rx(mut self, enable: bool) -> Self {
        self.config.deferred_rx = enable;
        self
    }

    /// Set the host heartbeat interval
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the detach wait bound
    #[must_use]
    pub fn detach_timeout(mut self, timeout: Duration) -> Self {
        self.config.detach_timeout = timeout;
        self
    }

    /// Set the tick timing tolerance in microseconds
    #[must_use]
    pub fn tick_tolerance_usec(mut self, usec: i64) -> Self {
        self.config.tick_tolerance_usec = usec;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> BusEngineConfig {
        self.config
    }
}
