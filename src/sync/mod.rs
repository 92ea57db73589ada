//! Clock synchronization: tick measurement, drift correction and
//! reference election.

mod drift;
mod elector;
mod ticker;

pub use drift::{
    DriftCorrector, DriftOutcome, DriftStats, FAR_EXCURSION_USEC, MEDIAN_CORRECTION_USEC,
    SYNC_ADJ_MAX, SYNC_ADJ_QUICK, SYNC_ADJ_SLOW, USB_MICROFRAME_USEC,
};
pub use elector::{ReferenceSource, SyncElector};
pub use ticker::{usec_diff, Ticker, TickerSnapshot};

use std::fmt;

/// Synchronization mode of a bus, as acknowledged by its hardware.
///
/// The mode changes only when the hardware acks a request; until then the
/// bus keeps running in its previous mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub enum SyncMode {
    /// No sync source: the host heartbeat drives the command queue
    #[default]
    None,
    /// This bus's hardware clock is the timing reference
    Reference,
    /// The hardware PLL follows host-issued drift corrections
    PhaseLocked,
    /// Request the current mode without changing it
    Query,
}

impl SyncMode {
    /// Encode for the sync-source packet payload.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Reference => 0x01,
            Self::PhaseLocked => 0x03,
            Self::Query => 0x80,
        }
    }

    /// Decode from a sync-source packet payload.
    #[must_use]
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Reference),
            0x03 => Some(Self::PhaseLocked),
            0x80 => Some(Self::Query),
            _ => None,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Reference => "REFERENCE",
            Self::PhaseLocked => "PLL",
            Self::Query => "QUERY",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_roundtrip() {
        for mode in [
            SyncMode::None,
            SyncMode::Reference,
            SyncMode::PhaseLocked,
            SyncMode::Query,
        ] {
            assert_eq!(SyncMode::from_wire(mode.to_wire()), Some(mode));
        }
        assert_eq!(SyncMode::from_wire(0x02), None);
    }
}
