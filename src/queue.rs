//! Bounded FIFO with an explicit overflow policy.
//!
//! Backpressure in this system is always handled by dropping, never by
//! blocking a producer. The policy object makes the choice (drop the newest
//! arrival vs evict the oldest entry) explicit and testable; the worker
//! backlog and viewer fan-out both use `DropNewest` so stale-but-ordered
//! frames keep flowing.

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the incoming item when full.
    DropNewest,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

pub struct OverflowQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl<T> OverflowQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
            dropped: 0,
        }
    }

    /// Returns false if the incoming item was dropped.
    pub fn push(&mut self, item: T) -> bool {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return true;
        }
        match self.policy {
            OverflowPolicy::DropNewest => {
                self.dropped += 1;
                false
            }
            OverflowPolicy::DropOldest => {
                self.items.pop_front();
                self.dropped += 1;
                self.items.push_back(item);
                true
            }
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items dropped by the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
