//! Bounded queue of finished operations waiting to be collected.
//!
//! Write, raw and control outcomes land here until the caller drains
//! them.  A caller that never drains loses the oldest outcomes, not
//! memory.

use heapless::Deque;
use log::warn;

/// Outcomes retained per queue before the oldest is dropped.
pub const OUTCOME_QUEUE_DEPTH: usize = 64;

pub struct OutcomeQueue<T> {
    items: Deque<T, OUTCOME_QUEUE_DEPTH>,
    label: &'static str,
    dropped: u64,
}

impl<T> OutcomeQueue<T> {
    /// `label` names the queue in log messages.
    pub const fn new(label: &'static str) -> Self {
        Self {
            items: Deque::new(),
            label,
            dropped: 0,
        }
    }

    /// Append `item`, evicting the oldest outcome when full.
    pub fn push(&mut self, item: T) {
        if self.items.is_full() {
            let _evicted = self.items.pop_front();
            self.dropped += 1;
            warn!(
                "Outcomes: {} queue full, dropped oldest ({} total)",
                self.label, self.dropped
            );
        }
        // Cannot fail: a slot was freed above.
        let _ = self.items.push_back(item);
    }

    /// Remove every outcome, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.items.len());
        while let Some(item) = self.items.pop_front() {
            out.push(item);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Outcomes evicted because nobody drained the queue.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
