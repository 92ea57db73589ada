//! Core types shared across the engine.

mod addr;
mod channel;
mod config;
mod id;

pub use addr::{DeviceAddr, MAX_DEVICES, MAX_SUBUNITS, MAX_UNITS};
pub use channel::{ChannelSet, MAX_CHANNELS};
pub use config::{BusEngineConfig, BusEngineConfigBuilder};
pub use id::BusId;
