//! Fixed-size channel bit-sets.
//!
//! Channel state (off-hook, muted, desired-PCM and friends) is kept as
//! 32-bit sets with per-channel accessors, so callers never shift raw bits.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

/// Maximum channels per device.
pub const MAX_CHANNELS: usize = 32;

/// A set of channel numbers in `0..MAX_CHANNELS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChannelSet(u32);

impl ChannelSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Construct from a raw wire mask.
    #[must_use]
    pub fn from_mask(mask: u32) -> Self {
        Self(mask)
    }

    /// Set containing a single channel.
    #[must_use]
    pub fn single(channel: usize) -> Self {
        debug_assert!(channel < MAX_CHANNELS);
        Self(1 << channel)
    }

    /// Set containing channels `0..count`.
    #[must_use]
    pub fn first_n(count: usize) -> Self {
        debug_assert!(count <= MAX_CHANNELS);
        if count >= MAX_CHANNELS {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    /// The raw wire mask.
    #[must_use]
    pub fn mask(&self) -> u32 {
        self.0
    }

    /// Is `channel` in the set?
    #[must_use]
    pub fn contains(&self, channel: usize) -> bool {
        channel < MAX_CHANNELS && self.0 & (1 << channel) != 0
    }

    /// Add a channel.
    pub fn insert(&mut self, channel: usize) {
        debug_assert!(channel < MAX_CHANNELS);
        self.0 |= 1 << channel;
    }

    /// Remove a channel.
    pub fn remove(&mut self, channel: usize) {
        debug_assert!(channel < MAX_CHANNELS);
        self.0 &= !(1 << channel);
    }

    /// Set or clear a channel.
    pub fn set(&mut self, channel: usize, on: bool) {
        if on {
            self.insert(channel);
        } else {
            self.remove(channel);
        }
    }

    /// Remove all channels.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Number of channels in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Is the set empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate set channels in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let bits = self.0;
        (0..MAX_CHANNELS).filter(move |ch| bits & (1 << ch) != 0)
    }
}

impl BitOr for ChannelSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChannelSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ChannelSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ChannelSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl Sub for ChannelSet {
    type Output = Self;
    /// Set difference: channels in `self` but not in `rhs`.
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut set = ChannelSet::EMPTY;
        assert!(set.is_empty());
        set.insert(3);
        set.insert(17);
        assert!(set.contains(3));
        assert!(set.contains(17));
        assert!(!set.contains(4));
        assert_eq!(set.len(), 2);
        set.remove(3);
        assert!(!set.contains(3));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_first_n() {
        assert_eq!(ChannelSet::first_n(0), ChannelSet::EMPTY);
        assert_eq!(ChannelSet::first_n(4).mask(), 0x0F);
        assert_eq!(ChannelSet::first_n(MAX_CHANNELS).mask(), u32::MAX);
    }

    #[test]
    fn test_set_ops() {
        let a = ChannelSet::from_mask(0b1100);
        let b = ChannelSet::from_mask(0b1010);
        assert_eq!((a | b).mask(), 0b1110);
        assert_eq!((a & b).mask(), 0b1000);
        assert_eq!((a - b).mask(), 0b0100);
    }

    #[test]
    fn test_iter_order() {
        let set = ChannelSet::from_mask(0b1000_0101);
        let channels: Vec<usize> = set.iter().collect();
        assert_eq!(channels, vec![0, 2, 7]);
    }

    #[test]
    fn test_out_of_range_contains() {
        let set = ChannelSet::from_mask(u32::MAX);
        assert!(!set.contains(MAX_CHANNELS));
    }
}
