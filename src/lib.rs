//! # tdmbus
//!
//! A clock-synchronization and frame-transport engine for channel banks
//! that exchange TDM voice over packet transports (USB and similar).
//!
//! Each attached bus carries up to 32 devices (port groups). The hardware
//! on the far side has its own sample clock; the engine keeps all attached
//! clocks phase-locked to a single elected reference by measuring tick
//! arrival times and feeding small drift corrections back to each bus's
//! PLL. Every millisecond tick moves one command frame, a batch of
//! outbound PCM and the queued inbound PCM.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tdmbus::{BusEngine, BusEngineConfig, DeviceAddr, GenericFamily};
//! use tdmbus::testing::MockTransport;
//!
//! # async fn example() -> tdmbus::Result<()> {
//! let engine = BusEngine::new(BusEngineConfig::default());
//! let bus = engine.attach_bus(MockTransport::shared());
//! let addr = DeviceAddr::new(0, 0).unwrap();
//! let device = engine.register_device(bus.id(), addr, 8, 5, Arc::new(GenericFamily))?;
//! device.set_offhook(0, true);
//! // Feed transport completions into engine.frame_received(...)
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Engine**: [`BusEngine`] - lifecycle, election, the global tick
//! - **Per bus**: [`bus::Bus`] - queues, pools, devices, sync state
//! - **Low-level**: [`frame`] and [`sync`] - wire format and clock math

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
/// Error types
pub mod error;
/// Core types
pub mod types;

/// Testing utilities
pub mod testing;

pub mod bus;
mod diag;
mod engine;
pub mod family;
pub mod frame;
pub mod sync;
pub mod transport;

// Re-exports
pub use bus::{Bus, BusHandle, BusSummary, Device, DeviceSummary};
pub use engine::{BusEngine, EngineSummary};
pub use error::{BusError, Result};
pub use family::{CardFamily, GenericFamily};
pub use sync::{ReferenceSource, SyncMode};
pub use transport::Transport;
pub use types::{BusEngineConfig, BusId, ChannelSet, DeviceAddr};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
///
/// Convenient re-exports
pub mod prelude {
    pub use crate::{
        Bus, BusEngine, BusEngineConfig, BusError, BusHandle, BusId, CardFamily, ChannelSet,
        Device, DeviceAddr, GenericFamily, ReferenceSource, SyncMode, Transport,
    };
}
