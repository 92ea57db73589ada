//! Transport abstraction between the engine and the connection hardware.

use std::fmt::Debug;

use crate::error::Result;
use crate::frame::Frame;
use crate::types::BusId;

/// Connection-type backend for one bus (USB, mock, ...).
///
/// Frame buffers move by ownership: `send_frame` consumes the frame, and a
/// frame handed out by `alloc_frame` comes back either through the engine's
/// buffer pools or through `free_frame`. Implementations must be callable
/// from the tick path, so they must not block.
pub trait Transport: Send + Sync + Debug {
    /// Short connection-type name for diagnostics.
    fn name(&self) -> &'static str;

    /// Largest frame, in bytes, this transport can carry in one transfer.
    fn max_frame_size(&self) -> usize;

    /// Allocate a fresh frame buffer when the pools run dry.
    ///
    /// Returning `None` signals allocation pressure; the caller drops the
    /// work item for this tick.
    fn alloc_frame(&self, bus: BusId) -> Option<Frame> {
        Some(Frame::new(bus, self.max_frame_size()))
    }

    /// Release a frame buffer the engine no longer pools.
    fn free_frame(&self, frame: Frame) {
        drop(frame);
    }

    /// Hand a filled frame to the hardware.
    ///
    /// # Errors
    ///
    /// Returns an error when the transfer cannot be submitted; the frame is
    /// consumed either way.
    fn send_frame(&self, frame: Frame) -> Result<()>;
}
