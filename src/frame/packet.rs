use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::types::{ChannelSet, DeviceAddr};

/// One PCM sample slot: 8 samples at 8 kHz, one millisecond of voice.
pub const CHUNK_SIZE: usize = 8;

/// u-law silence, injected for muted or absent channels.
pub const SILENCE_BYTE: u8 = 0x7F;

/// Protocol operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Host-to-device PCM payload
    PcmWrite = 0x01,
    /// Device-to-host PCM payload
    PcmRead = 0x02,
    /// Sync mode request (host to device) or acknowledgement (device to host)
    SyncSource = 0x03,
    /// Hardware register write/read request
    RegisterRequest = 0x04,
    /// Asynchronous hardware register acknowledgement
    RegisterReply = 0x05,
    /// Periodic housekeeping: reset the device's sync counters
    ResetSyncCounters = 0x06,
}

impl OpCode {
    /// Parse from byte value
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::PcmWrite),
            0x02 => Some(Self::PcmRead),
            0x03 => Some(Self::SyncSource),
            0x04 => Some(Self::RegisterRequest),
            0x05 => Some(Self::RegisterReply),
            0x06 => Some(Self::ResetSyncCounters),
            _ => None,
        }
    }

    /// Whether this opcode carries a PCM payload
    #[must_use]
    pub fn is_pcm(&self) -> bool {
        matches!(self, Self::PcmWrite | Self::PcmRead)
    }
}

/// Packet header (4 bytes on the wire)
///
/// Layout: total length (u16 LE), address byte, opcode byte. The address
/// byte packs unit (bits 3-4), subunit (bits 0-2) and the "this packet
/// marks the synchronization instant" flag (bit 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Destination (or originating) device address
    pub addr: DeviceAddr,
    /// Synchronization-instant flag
    pub sync: bool,
    /// Operation code
    pub opcode: OpCode,
}

impl PacketHeader {
    /// Wire size of the header
    pub const SIZE: usize = 4;

    const SYNC_BIT: u8 = 0x80;

    /// Encode header to bytes, with `total_len` covering header + payload
    #[must_use]
    pub fn encode(&self, total_len: u16) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u16(&mut buf[0..2], total_len);
        buf[2] = self.addr.to_wire_bits() | if self.sync { Self::SYNC_BIT } else { 0 };
        buf[3] = self.opcode as u8;
        buf
    }

    /// Decode a header, returning it and the declared total length.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the buffer is too small, the declared length
    /// is shorter than a header, the address is out of range or the opcode
    /// is unknown.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), PacketError> {
        if buf.len() < Self::SIZE {
            return Err(PacketError::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }
        let total_len = usize::from(LittleEndian::read_u16(&buf[0..2]));
        if total_len < Self::SIZE {
            return Err(PacketError::BadLength { declared: total_len });
        }
        let addr_byte = buf[2];
        let addr = DeviceAddr::from_wire_bits(addr_byte)
            .ok_or(PacketError::BadAddress { byte: addr_byte })?;
        let opcode = OpCode::from_byte(buf[3]).ok_or(PacketError::UnknownOpcode(buf[3]))?;
        Ok((
            Self {
                addr,
                sync: addr_byte & Self::SYNC_BIT != 0,
                opcode,
            },
            total_len,
        ))
    }
}

/// Packet decode errors
#[derive(Debug, Error)]
pub enum PacketError {
    /// Not enough bytes for a header
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        have: usize,
    },

    /// The declared length is shorter than a header
    #[error("declared packet length {declared} is invalid")]
    BadLength {
        /// Length from the wire
        declared: usize,
    },

    /// The declared length exceeds the remaining frame bytes
    #[error("packet overruns frame: declared {declared}, {remaining} bytes remain")]
    Overrun {
        /// Length from the wire
        declared: usize,
        /// Bytes left in the frame
        remaining: usize,
    },

    /// The address byte does not decode to a valid device address
    #[error("bad address byte: 0x{byte:02x}")]
    BadAddress {
        /// The offending byte
        byte: u8,
    },

    /// Unrecognized opcode byte
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    /// PCM payload length disagrees with its channel mask
    #[error("PCM payload length {have} does not match channel mask (want {want})")]
    PcmLengthMismatch {
        /// Length the mask implies
        want: usize,
        /// Length received
        have: usize,
    },
}

/// Complete packet with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,
    /// Payload data (control message or PCM slots)
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a control packet
    #[must_use]
    pub fn control(addr: DeviceAddr, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                addr,
                sync: false,
                opcode,
            },
            payload,
        }
    }

    /// Create a host-to-device PCM packet with a silence-filled payload
    /// for the given channels; the card family overwrites the slots.
    #[must_use]
    pub fn pcm_write(addr: DeviceAddr, channels: ChannelSet) -> Self {
        let mut payload = vec![SILENCE_BYTE; pcm_payload_len(channels)];
        LittleEndian::write_u32(&mut payload[0..4], channels.mask());
        Self {
            header: PacketHeader {
                addr,
                sync: false,
                opcode: OpCode::PcmWrite,
            },
            payload,
        }
    }

    /// Total wire length of this packet
    #[must_use]
    pub fn wire_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Encode the whole packet
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&self.header.encode(self.wire_len() as u16));
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one packet from the front of `buf`, returning it and the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` on a bad header or when the declared length
    /// exceeds the remaining bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), PacketError> {
        let (header, total_len) = PacketHeader::decode(buf)?;
        if total_len > buf.len() {
            return Err(PacketError::Overrun {
                declared: total_len,
                remaining: buf.len(),
            });
        }
        Ok((
            Self {
                header,
                payload: buf[PacketHeader::SIZE..total_len].to_vec(),
            },
            total_len,
        ))
    }
}

/// Wire length of a PCM payload carrying one chunk per set channel.
#[must_use]
pub fn pcm_payload_len(channels: ChannelSet) -> usize {
    4 + CHUNK_SIZE * channels.len()
}

/// Parsed view of a PCM payload: channel mask plus packed sample chunks.
#[derive(Debug, Clone, Copy)]
pub struct PcmView<'a> {
    channels: ChannelSet,
    data: &'a [u8],
}

impl<'a> PcmView<'a> {
    /// Parse and length-validate a PCM payload.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::PcmLengthMismatch` when the payload length does
    /// not match the channel mask's population count.
    pub fn parse(payload: &'a [u8]) -> Result<Self, PacketError> {
        if payload.len() < 4 {
            return Err(PacketError::BufferTooSmall {
                needed: 4,
                have: payload.len(),
            });
        }
        let channels = ChannelSet::from_mask(LittleEndian::read_u32(&payload[0..4]));
        let want = pcm_payload_len(channels);
        if payload.len() != want {
            return Err(PacketError::PcmLengthMismatch {
                want,
                have: payload.len(),
            });
        }
        Ok(Self {
            channels,
            data: &payload[4..],
        })
    }

    /// Channels present in this payload
    #[must_use]
    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    /// Iterate `(channel, chunk)` pairs in channel order
    pub fn chunks(&self) -> impl Iterator<Item = (usize, &'a [u8])> + '_ {
        self.channels
            .iter()
            .enumerate()
            .map(move |(nth, ch)| (ch, &self.data[nth * CHUNK_SIZE..(nth + 1) * CHUNK_SIZE]))
    }

    /// Chunk carried for `channel`, or `None` if the channel is absent
    #[must_use]
    pub fn chunk(&self, channel: usize) -> Option<&'a [u8]> {
        let nth = self.channels.iter().position(|ch| ch == channel)?;
        Some(&self.data[nth * CHUNK_SIZE..(nth + 1) * CHUNK_SIZE])
    }
}

/// Mutable cursor over a PCM payload being filled by a card family.
pub struct PcmSlots<'a> {
    channels: ChannelSet,
    data: &'a mut [u8],
}

impl<'a> PcmSlots<'a> {
    /// View the slot area of a PCM-write packet built by [`Packet::pcm_write`].
    #[must_use]
    pub fn of(packet: &'a mut Packet) -> Self {
        debug_assert!(packet.header.opcode.is_pcm());
        let channels = ChannelSet::from_mask(LittleEndian::read_u32(&packet.payload[0..4]));
        Self {
            channels,
            data: &mut packet.payload[4..],
        }
    }

    /// Channels with a slot in this payload
    #[must_use]
    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    /// Mutable chunk for `channel`, or `None` if the channel has no slot
    #[must_use]
    pub fn chunk_mut(&mut self, channel: usize) -> Option<&mut [u8]> {
        if !self.channels.contains(channel) {
            return None;
        }
        let nth = self.channels.iter().position(|ch| ch == channel)?;
        Some(&mut self.data[nth * CHUNK_SIZE..(nth + 1) * CHUNK_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(unit: u8, subunit: u8) -> DeviceAddr {
        DeviceAddr::new(unit, subunit).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            addr: addr(2, 3),
            sync: true,
            opcode: OpCode::PcmRead,
        };
        let encoded = header.encode(20);
        let (decoded, len) = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(len, 20);
    }

    #[test]
    fn test_header_rejects_short_buffer() {
        assert!(matches!(
            PacketHeader::decode(&[0x04, 0x00, 0x00]),
            Err(PacketError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_header_rejects_undersized_length() {
        let mut buf = PacketHeader {
            addr: addr(0, 0),
            sync: false,
            opcode: OpCode::SyncSource,
        }
        .encode(3);
        buf[3] = OpCode::SyncSource as u8;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(PacketError::BadLength { .. })
        ));
    }

    #[test]
    fn test_header_rejects_unknown_opcode() {
        let mut buf = PacketHeader {
            addr: addr(0, 0),
            sync: false,
            opcode: OpCode::PcmWrite,
        }
        .encode(4);
        buf[3] = 0x7E;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(PacketError::UnknownOpcode(0x7E))
        ));
    }

    #[test]
    fn test_packet_decode_overrun() {
        let packet = Packet::control(addr(1, 1), OpCode::RegisterReply, vec![1, 2, 3, 4]);
        let encoded = packet.encode();
        // Truncate: declared length now exceeds the buffer.
        assert!(matches!(
            Packet::decode(&encoded[..encoded.len() - 1]),
            Err(PacketError::Overrun { .. })
        ));
    }

    #[test]
    fn test_pcm_write_layout() {
        let channels = ChannelSet::from_mask(0b101);
        let packet = Packet::pcm_write(addr(0, 0), channels);
        assert_eq!(packet.payload.len(), 4 + 2 * CHUNK_SIZE);
        let view = PcmView::parse(&packet.payload).unwrap();
        assert_eq!(view.channels(), channels);
        let pairs: Vec<usize> = view.chunks().map(|(ch, _)| ch).collect();
        assert_eq!(pairs, vec![0, 2]);
    }

    #[test]
    fn test_pcm_slots_fill() {
        let channels = ChannelSet::from_mask(0b110);
        let mut packet = Packet::pcm_write(addr(0, 0), channels);
        {
            let mut slots = PcmSlots::of(&mut packet);
            assert!(slots.chunk_mut(0).is_none());
            slots.chunk_mut(1).unwrap().copy_from_slice(&[0xAA; 8]);
            slots.chunk_mut(2).unwrap().copy_from_slice(&[0xBB; 8]);
        }
        let view = PcmView::parse(&packet.payload).unwrap();
        let chunks: Vec<(usize, u8)> = view.chunks().map(|(ch, c)| (ch, c[0])).collect();
        assert_eq!(chunks, vec![(1, 0xAA), (2, 0xBB)]);
    }

    #[test]
    fn test_pcm_view_length_mismatch() {
        let mut payload = vec![0u8; 4 + CHUNK_SIZE];
        LittleEndian::write_u32(&mut payload[0..4], 0b11); // claims 2 channels
        assert!(matches!(
            PcmView::parse(&payload),
            Err(PacketError::PcmLengthMismatch { .. })
        ));
    }
}
