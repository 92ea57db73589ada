//! Device addressing within a bus.

use std::fmt;

/// Maximum unit number per bus (2 address bits).
pub const MAX_UNITS: u8 = 4;

/// Maximum sub-unit number per unit (3 address bits).
pub const MAX_SUBUNITS: u8 = 8;

/// Maximum device slots per bus.
pub const MAX_DEVICES: usize = (MAX_UNITS as usize) * (MAX_SUBUNITS as usize);

/// Address of a device (port group) behind a bus.
///
/// Packed on the wire into a single byte together with the
/// synchronization flag; see [`crate::frame::PacketHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct DeviceAddr {
    unit: u8,
    subunit: u8,
}

impl DeviceAddr {
    /// Create a device address.
    ///
    /// Returns `None` when unit or subunit is out of the addressable range.
    #[must_use]
    pub fn new(unit: u8, subunit: u8) -> Option<Self> {
        if unit >= MAX_UNITS || subunit >= MAX_SUBUNITS {
            return None;
        }
        Some(Self { unit, subunit })
    }

    /// Unit number (0-based).
    #[must_use]
    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Sub-unit number within the unit (0-based).
    #[must_use]
    pub fn subunit(&self) -> u8 {
        self.subunit
    }

    /// Flat device-slot index within a bus.
    #[must_use]
    pub fn slot(&self) -> usize {
        usize::from(self.unit) * usize::from(MAX_SUBUNITS) + usize::from(self.subunit)
    }

    /// Encode unit/subunit into the low bits of the wire address byte.
    ///
    /// Bit 7 (the sync flag) and the remaining reserved bits are left clear.
    #[must_use]
    pub fn to_wire_bits(self) -> u8 {
        (self.unit << 3) | self.subunit
    }

    /// Decode a wire address byte (sync flag and reserved bits are ignored).
    #[must_use]
    pub fn from_wire_bits(b: u8) -> Option<Self> {
        Self::new((b >> 3) & 0x03, b & 0x07)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.unit, self.subunit)
    }
}
