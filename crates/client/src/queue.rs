// FIFO buffer for frames composed while the link is down.
//
// The queue is bounded: at the ceiling the oldest frame is evicted to admit
// the newest, and the eviction is surfaced as a `QueueOverflow` warning.
// Delivery is deferred, never silently dropped.

use std::collections::VecDeque;

use uuid::Uuid;

use tandem_common::protocol::ws::Envelope;

/// Outbound queue ceiling when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Warning surfaced when the ceiling forces an eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOverflow {
    /// Envelope id of the evicted (oldest) frame.
    pub dropped_id: Uuid,
}

impl std::fmt::Display for QueueOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "outbound queue full; dropped oldest frame {}", self.dropped_id)
    }
}

impl std::error::Error for QueueOverflow {}

#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<Envelope>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { frames: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Appends a frame, evicting the oldest when at the ceiling.
    pub fn push(&mut self, frame: Envelope) -> Option<QueueOverflow> {
        let overflow = if self.frames.len() >= self.capacity {
            self.frames.pop_front().map(|evicted| QueueOverflow { dropped_id: evicted.id() })
        } else {
            None
        };
        self.frames.push_back(frame);
        overflow
    }

    /// Puts a frame back at the head after a failed flush, preserving order.
    pub fn requeue_front(&mut self, frame: Envelope) {
        self.frames.push_front(frame);
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.frames.pop_front()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
