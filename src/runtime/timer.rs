//! Timer heap bounding suspended waits.
//!
//! A min-heap of (deadline, wait, generation). Cancellation is lazy: a
//! completed wait detaches its generation, and stale heap entries are
//! filtered out when they surface.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    wait: usize,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a deadline for a wait registration, returning the generation
    /// the caller must hold to accept the expiry.
    pub fn insert(&mut self, wait: usize, deadline: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            wait,
            generation,
        });
        generation
    }

    /// Earliest pending deadline, if any.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops all entries with deadline <= now.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(usize, u64)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline <= now {
                let entry = self.heap.pop().unwrap();
                expired.push((entry.wait, entry.generation));
            } else {
                break;
            }
        }
        expired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earliest_first() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        let g1 = heap.insert(1, now + Duration::from_millis(100));
        let g2 = heap.insert(2, now + Duration::from_millis(50));
        heap.insert(3, now + Duration::from_millis(150));

        assert_eq!(heap.peek_deadline(), Some(now + Duration::from_millis(50)));

        let expired = heap.pop_expired(now + Duration::from_millis(100));
        assert_eq!(expired, vec![(2, g2), (1, g1)]);
        assert_eq!(heap.peek_deadline(), Some(now + Duration::from_millis(150)));
    }
}
