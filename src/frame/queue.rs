//! Bounded frame queues with occupancy and lag statistics.
//!
//! Every producer/consumer edge in the engine (outbound commands, inbound
//! frames, buffer pools, PCM demux) is one of these queues.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::frame::Frame;

/// Read-only queue diagnostics, reset on demand.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    /// Current number of queued frames
    pub count: usize,
    /// Highest occupancy observed since the last reset
    pub worst_count: usize,
    /// Cumulative rejected enqueues
    pub overflows: u64,
    /// Worst observed delay between enqueue and dequeue
    #[serde(with = "crate::diag::serde_duration_usec")]
    pub worst_lag: Duration,
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<(Frame, Instant)>,
    disabled: bool,
    worst_count: usize,
    overflows: u64,
    worst_lag: Duration,
}

/// Bounded FIFO of [`Frame`]s.
///
/// `enqueue` transfers ownership into the queue and fails (handing the
/// frame back) when the queue is disabled or at capacity. Draining is
/// always allowed, even after `disable`, so in-flight frames are never
/// leaked on shutdown.
#[derive(Debug)]
pub struct FrameQueue {
    name: &'static str,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FrameQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                disabled: false,
                worst_count: 0,
                overflows: 0,
                worst_lag: Duration::ZERO,
            }),
        }
    }

    /// Queue name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum occupancy.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame.
    ///
    /// # Errors
    ///
    /// Returns the frame back when the queue is disabled or at capacity;
    /// the caller must dispose of it (usually back to a pool).
    pub fn enqueue(&self, frame: Frame) -> Result<(), Frame> {
        let mut inner = self.inner.lock().expect("frame queue poisoned");
        if inner.disabled || inner.frames.len() >= self.capacity {
            inner.overflows += 1;
            return Err(frame);
        }
        inner.frames.push_back((frame, Instant::now()));
        let count = inner.frames.len();
        if count > inner.worst_count {
            inner.worst_count = count;
        }
        Ok(())
    }

    /// Remove and return the oldest frame.
    #[must_use]
    pub fn dequeue(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().expect("frame queue poisoned");
        let (frame, queued_at) = inner.frames.pop_front()?;
        let lag = queued_at.elapsed();
        if lag > inner.worst_lag {
            inner.worst_lag = lag;
        }
        Some(frame)
    }

    /// Current occupancy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("frame queue poisoned").frames.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new frames. Idempotent; draining still works.
    pub fn disable(&self) {
        self.inner.lock().expect("frame queue poisoned").disabled = true;
    }

    /// Resume accepting frames (used when a bus reconnects).
    pub fn enable(&self) {
        self.inner.lock().expect("frame queue poisoned").disabled = false;
    }

    /// Whether `disable` has been called.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.inner.lock().expect("frame queue poisoned").disabled
    }

    /// Disable the queue and drain every queued frame out.
    #[must_use]
    pub fn drain(&self) -> Vec<Frame> {
        let mut inner = self.inner.lock().expect("frame queue poisoned");
        inner.disabled = true;
        inner.frames.drain(..).map(|(f, _)| f).collect()
    }

    /// Snapshot the queue statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("frame queue poisoned");
        QueueStats {
            count: inner.frames.len(),
            worst_count: inner.worst_count,
            overflows: inner.overflows,
            worst_lag: inner.worst_lag,
        }
    }

    /// Reset the high-water, overflow and lag statistics.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().expect("frame queue poisoned");
        inner.worst_count = inner.frames.len();
        inner.overflows = 0;
        inner.worst_lag = Duration::ZERO;
    }
}
