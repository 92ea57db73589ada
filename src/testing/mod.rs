//! Test doubles and helpers shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{BusError, Result};
use crate::frame::{Frame, Packet};
use crate::transport::Transport;
use crate::types::BusId;

/// In-memory transport that records every sent frame.
///
/// Tracks outstanding frame buffers (allocated minus returned), so tests
/// can assert that no buffer leaks across a disconnect.
#[derive(Debug)]
pub struct MockTransport {
    sent: Mutex<Vec<Vec<Packet>>>,
    sent_raw: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicI64,
    allocated: AtomicU64,
    fail_sends: AtomicBool,
    fail_allocs: AtomicBool,
    frame_size: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            sent_raw: Mutex::new(Vec::new()),
            outstanding: AtomicI64::new(0),
            allocated: AtomicU64::new(0),
            fail_sends: AtomicBool::new(false),
            fail_allocs: AtomicBool::new(false),
            frame_size: AtomicUsize::new(512),
        }
    }
}

impl MockTransport {
    /// Shared handle suitable for `Bus::connect_transport`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Shared handle carrying frames of at most `size` bytes.
    #[must_use]
    pub fn with_frame_size(size: usize) -> Arc<Self> {
        let transport = Self::default();
        transport.frame_size.store(size, Ordering::SeqCst);
        Arc::new(transport)
    }

    /// Packets of every frame sent so far, in send order.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Vec<Packet>> {
        self.sent.lock().expect("mock transport poisoned").clone()
    }

    /// Raw bytes of every frame sent so far.
    #[must_use]
    pub fn sent_bytes(&self) -> Vec<Vec<u8>> {
        self.sent_raw.lock().expect("mock transport poisoned").clone()
    }

    /// Number of frames sent so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock transport poisoned").len()
    }

    /// Frame buffers currently held by the engine.
    #[must_use]
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Total buffers ever allocated.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent allocations fail.
    pub fn fail_allocs(&self, fail: bool) {
        self.fail_allocs.store(fail, Ordering::SeqCst);
    }

    /// Forget recorded frames.
    pub fn clear_sent(&self) {
        self.sent.lock().expect("mock transport poisoned").clear();
        self.sent_raw.lock().expect("mock transport poisoned").clear();
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn max_frame_size(&self) -> usize {
        self.frame_size.load(Ordering::SeqCst)
    }

    fn alloc_frame(&self, bus: BusId) -> Option<Frame> {
        if self.fail_allocs.load(Ordering::SeqCst) {
            return None;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Some(Frame::new(bus, self.max_frame_size()))
    }

    fn free_frame(&self, frame: Frame) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        drop(frame);
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::TransportSend {
                bus_name: frame.bus().to_string(),
                message: "send failure injected".into(),
            });
        }
        let packets: Vec<Packet> = frame.packets().filter_map(std::result::Result::ok).collect();
        self.sent_raw
            .lock()
            .expect("mock transport poisoned")
            .push(frame.as_bytes().to_vec());
        self.sent
            .lock()
            .expect("mock transport poisoned")
            .push(packets);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use crate::types::DeviceAddr;

    #[test]
    fn test_outstanding_accounting() {
        let transport = MockTransport::shared();
        let bus = BusId::new(0, 1);
        let a = transport.alloc_frame(bus).unwrap();
        let b = transport.alloc_frame(bus).unwrap();
        assert_eq!(transport.outstanding(), 2);
        transport.free_frame(a);
        transport.send_frame(b).unwrap();
        assert_eq!(transport.outstanding(), 0);
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn test_send_failure_injection() {
        let transport = MockTransport::shared();
        let mut frame = transport.alloc_frame(BusId::new(0, 1)).unwrap();
        frame
            .push_packet(&Packet::control(
                DeviceAddr::new(0, 0).unwrap(),
                OpCode::RegisterRequest,
                vec![],
            ))
            .unwrap();
        transport.fail_sends(true);
        assert!(transport.send_frame(frame).is_err());
        assert_eq!(transport.sent_count(), 0);
    }
}
