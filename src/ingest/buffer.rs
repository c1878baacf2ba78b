use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::types::SearchEvent;

/// Bounded lock-free queue of pending search events. `submit` never blocks
/// a producer: when the queue is full, the oldest entry is dropped and the
/// overflow counter incremented. A single consumer (the flusher) drains it.
pub struct IngestBuffer {
    queue: ArrayQueue<SearchEvent>,
    overflow: AtomicU64,
}

impl IngestBuffer {
    pub fn new(capacity: usize) -> Self {
        IngestBuffer {
            queue: ArrayQueue::new(capacity),
            overflow: AtomicU64::new(0),
        }
    }

    /// Constant-time, wait-free enqueue.
    pub fn submit(&self, event: SearchEvent) {
        if self.queue.force_push(event).is_some() {
            // force_push returned the displaced oldest entry
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pops up to `max` events in arrival order.
    pub fn drain(&self, max: usize) -> Vec<SearchEvent> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop() {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
