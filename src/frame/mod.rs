//! Frames, packets and the bounded frame queues that carry them.

#[allow(clippy::module_inception)]
mod frame;
mod packet;
mod queue;

pub use frame::{Frame, PacketIter};
pub use packet::{
    pcm_payload_len, OpCode, Packet, PacketError, PacketHeader, PcmSlots, PcmView, CHUNK_SIZE,
    SILENCE_BYTE,
};
pub use queue::{FrameQueue, QueueStats};
