//! # Bounded Outbound Queue
//!
//! Each session owns one bounded queue of frames waiting to be written to its
//! socket. The bound is the backpressure threshold: when a slow consumer lets
//! the queue fill up, the **oldest** queued frame is dropped to make room
//! (drop-oldest policy). For a real-time audio stream, stale frames are worth
//! less than fresh ones, and dropping keeps a single slow client from
//! exhausting server memory.

use crate::frame::OutboundFrame;
use std::collections::VecDeque;

/// Result of pushing one frame onto the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    /// Frame queued, nothing evicted.
    Queued,
    /// Frame queued; the oldest pending frame was dropped to make room.
    DroppedOldest(OutboundFrame),
}

/// FIFO queue of pending outbound frames with a fixed capacity.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<OutboundFrame>,
    capacity: usize,
    /// Total frames evicted by the drop-oldest policy.
    dropped: u64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames. A capacity of zero is
    /// clamped to one so the queue can always hold the frame being pushed.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a frame, evicting the oldest pending frame when at capacity.
    pub fn push(&mut self, frame: OutboundFrame) -> EnqueueResult {
        if self.frames.len() >= self.capacity {
            // pop_front cannot return None here: capacity >= 1 implies the
            // queue is non-empty when full.
            if let Some(evicted) = self.frames.pop_front() {
                self.dropped += 1;
                self.frames.push_back(frame);
                return EnqueueResult::DroppedOldest(evicted);
            }
        }

        self.frames.push_back(frame);
        EnqueueResult::Queued
    }

    /// Remove and return all pending frames in enqueue order.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
