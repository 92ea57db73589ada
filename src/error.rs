use std::time::Duration;
use thiserror::Error;

use crate::types::DeviceAddr;

/// Errors that can occur during bus operations
#[derive(Debug, Error)]
pub enum BusError {
    // ===== Transport Errors =====
    /// The bus has no transport attached (hardware is gone or not yet present)
    #[error("transport missing on {bus_name}")]
    TransportMissing {
        /// Display name of the bus
        bus_name: String,
    },

    /// The transport refused or failed to send a frame
    #[error("transport send failed on {bus_name}: {message}")]
    TransportSend {
        /// Display name of the bus
        bus_name: String,
        /// Description of the failure
        message: String,
    },

    /// The transport could not allocate a frame buffer
    #[error("frame allocation failed on {bus_name}")]
    FrameAlloc {
        /// Display name of the bus
        bus_name: String,
    },

    // ===== Queue Errors =====
    /// A frame queue rejected an enqueue (disabled or at capacity)
    #[error("queue '{queue}' full or disabled")]
    QueueFull {
        /// Name of the rejecting queue
        queue: &'static str,
    },

    // ===== Protocol Errors =====
    /// An inbound packet failed bounds, length or address validation
    #[error("malformed packet: {reason}")]
    MalformedPacket {
        /// Why validation failed
        reason: String,
    },

    /// A packet addressed a device that is not registered on the bus
    #[error("no device at address {addr}")]
    NoSuchDevice {
        /// The unresolvable address
        addr: DeviceAddr,
    },

    /// A bus id did not resolve (detached, or stale generation)
    #[error("no such bus (index {index}, generation {generation})")]
    NoSuchBus {
        /// Arena slot index
        index: usize,
        /// Generation the caller held
        generation: u64,
    },

    /// A packet did not fit in the frame being assembled
    #[error("frame full: need {needed} bytes, {available} available")]
    FrameFull {
        /// Bytes the packet requires
        needed: usize,
        /// Bytes left in the frame
        available: usize,
    },

    // ===== State Errors =====
    /// Operation not valid in the bus's current lifecycle state
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the state is invalid
        message: String,
    },

    /// A bounded wait expired
    #[error("timed out after {duration:?}")]
    Timeout {
        /// How long we waited
        duration: Duration,
    },

    /// Invalid parameter provided
    #[error("invalid parameter: {name} - {message}")]
    InvalidParameter {
        /// The name of the parameter
        name: &'static str,
        /// Description of the error
        message: String,
    },
}

impl BusError {
    /// Check whether this error is part of normal per-tick operation
    /// (dropped, counted, rate-limit logged) rather than a lifecycle fault.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportMissing { .. }
                | Self::QueueFull { .. }
                | Self::MalformedPacket { .. }
                | Self::NoSuchDevice { .. }
                | Self::FrameAlloc { .. }
        )
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::QueueFull { queue: "command" };
        assert_eq!(err.to_string(), "queue 'command' full or disabled");
    }

    #[test]
    fn test_error_is_transient() {
        assert!(BusError::TransportMissing {
            bus_name: "XBUS-00".into()
        }
        .is_transient());
        assert!(!BusError::Timeout {
            duration: Duration::from_secs(1)
        }
        .is_transient());
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BusError>();
    }
}
