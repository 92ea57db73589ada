use std::time::Instant;

use bytes::BytesMut;

use crate::error::BusError;
use crate::types::BusId;

use super::packet::{Packet, PacketError, PacketHeader};

/// One transport-level transfer unit containing packed packets.
///
/// A frame is owned by exactly one of: a buffer pool, a frame queue, or
/// the transport ("in flight"). Move semantics enforce this.
#[derive(Debug)]
pub struct Frame {
    buf: BytesMut,
    capacity: usize,
    bus: BusId,
    created_at: Instant,
}

impl Frame {
    /// Create an empty frame for `bus` with the transport's frame capacity.
    #[must_use]
    pub fn new(bus: BusId, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            bus,
            created_at: Instant::now(),
        }
    }

    /// Bus this frame belongs to.
    #[must_use]
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// When this frame buffer was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Occupied bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the frame holds no packets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still available for packets.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Whether a packet of `wire_len` bytes fits.
    #[must_use]
    pub fn has_room(&self, wire_len: usize) -> bool {
        wire_len <= self.remaining()
    }

    /// Append a packet to the frame.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::FrameFull`] when the packet does not fit; the
    /// frame is left unchanged.
    pub fn push_packet(&mut self, packet: &Packet) -> crate::error::Result<()> {
        let wire_len = packet.wire_len();
        if !self.has_room(wire_len) {
            return Err(BusError::FrameFull {
                needed: wire_len,
                available: self.remaining(),
            });
        }
        self.buf.extend_from_slice(&packet.encode());
        Ok(())
    }

    /// Raw frame contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Overwrite the frame contents with raw received bytes.
    ///
    /// Used by transports filling a pool frame with an inbound transfer.
    pub fn fill_from(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(&data[..data.len().min(self.capacity)]);
    }

    /// Whether the frame's first packet carries the synchronization flag.
    ///
    /// The flag is read from the first packet regardless of which device
    /// the sync-marked payload addresses.
    #[must_use]
    pub fn is_sync_tagged(&self) -> bool {
        PacketHeader::decode(&self.buf).is_ok_and(|(h, _)| h.sync)
    }

    /// Opcode of the first packet, if the frame starts with a valid header.
    #[must_use]
    pub fn first_opcode(&self) -> Option<super::packet::OpCode> {
        PacketHeader::decode(&self.buf).ok().map(|(h, _)| h.opcode)
    }

    /// Iterate packets packed back-to-back in this frame.
    ///
    /// Iteration stops at the first malformed packet, yielding its error.
    pub fn packets(&self) -> PacketIter<'_> {
        PacketIter {
            buf: &self.buf,
            pos: 0,
        }
    }

    /// Clear the frame for reuse from a pool.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.created_at = Instant::now();
    }
}

/// Iterator over the packets of a [`Frame`].
pub struct PacketIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Iterator for PacketIter<'_> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        match Packet::decode(&self.buf[self.pos..]) {
            Ok((packet, consumed)) => {
                self.pos += consumed;
                Some(Ok(packet))
            }
            Err(e) => {
                self.pos = self.buf.len(); // stop after an error
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::packet::OpCode;
    use crate::types::DeviceAddr;

    fn test_bus() -> BusId {
        BusId::new(0, 1)
    }

    fn addr(unit: u8, subunit: u8) -> DeviceAddr {
        DeviceAddr::new(unit, subunit).unwrap()
    }

    #[test]
    fn test_pack_parse_roundtrip() {
        let a = Packet::control(addr(0, 0), OpCode::RegisterRequest, vec![1, 2]);
        let b = Packet::control(addr(1, 3), OpCode::SyncSource, vec![3]);
        let c = Packet::control(addr(2, 7), OpCode::RegisterReply, vec![4, 5, 6]);

        let mut frame = Frame::new(test_bus(), 512);
        frame.push_packet(&a).unwrap();
        frame.push_packet(&b).unwrap();
        frame.push_packet(&c).unwrap();

        let parsed: Vec<Packet> = frame.packets().map(Result::unwrap).collect();
        assert_eq!(parsed, vec![a, b, c]);
    }

    #[test]
    fn test_push_rejects_when_full() {
        let mut frame = Frame::new(test_bus(), 16);
        let packet = Packet::control(addr(0, 0), OpCode::RegisterRequest, vec![0; 8]);
        frame.push_packet(&packet).unwrap();
        let before = frame.len();
        let err = frame.push_packet(&packet).unwrap_err();
        assert!(matches!(err, BusError::FrameFull { .. }));
        assert_eq!(frame.len(), before);
    }

    #[test]
    fn test_sync_tag_on_first_packet() {
        let mut frame = Frame::new(test_bus(), 128);
        let mut packet = Packet::control(addr(0, 0), OpCode::PcmWrite, vec![0, 0, 0, 0]);
        packet.header.sync = true;
        frame.push_packet(&packet).unwrap();
        assert!(frame.is_sync_tagged());

        let mut other = Frame::new(test_bus(), 128);
        other
            .push_packet(&Packet::control(addr(0, 0), OpCode::PcmWrite, vec![0; 4]))
            .unwrap();
        assert!(!other.is_sync_tagged());
    }

    #[test]
    fn test_packet_iter_stops_on_malformed() {
        let good = Packet::control(addr(0, 0), OpCode::RegisterReply, vec![9]);
        let mut frame = Frame::new(test_bus(), 128);
        frame.push_packet(&good).unwrap();
        // Append a header whose declared length overruns the frame.
        let bogus = PacketHeader {
            addr: addr(0, 1),
            sync: false,
            opcode: OpCode::PcmRead,
        }
        .encode(200);
        frame.buf.extend_from_slice(&bogus);

        let mut iter = frame.packets();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_reset_clears() {
        let mut frame = Frame::new(test_bus(), 64);
        frame
            .push_packet(&Packet::control(addr(0, 0), OpCode::RegisterRequest, vec![]))
            .unwrap();
        frame.reset();
        assert!(frame.is_empty());
        assert_eq!(frame.remaining(), 64);
    }
}
