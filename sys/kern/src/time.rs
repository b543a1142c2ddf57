// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The timer heap: pending wake deadlines, ordered by tick.
//!
//! Entries are *lazily cancelled*: transitioning a task out of a wait state
//! leaves its heap entry behind, and the entry is discarded at pop time if
//! the task is no longer in the matching wait with the matching deadline.
//! That keeps cancellation O(1) and insert/pop O(log n), at the cost of some
//! dead weight in the heap between pops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use hsx_abi::{HandleId, Pid, Timestamp};

/// What a deadline will wake, used to re-check that the wait is still
/// current when the entry surfaces.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum WaitTag {
    /// A mailbox receive with a finite timeout, through this handle.
    Mailbox { handle: HandleId },
    /// An explicit sleep.
    Sleep,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimerEntry {
    // Field order is the comparison order: earliest deadline first, pid as
    // an arbitrary but deterministic tie-break.
    pub deadline: Timestamp,
    pub pid: Pid,
    pub tag: WaitTag,
}

#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deadline: Timestamp, pid: Pid, tag: WaitTag) {
        self.heap.push(Reverse(TimerEntry { deadline, pid, tag }));
    }

    /// Removes and returns the next entry whose deadline is `<= now`. The
    /// caller validates the entry against the task's current state and
    /// silently discards it when stale.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<TimerEntry> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => {
                let Reverse(entry) = self.heap.pop().unwrap();
                Some(entry)
            }
            _ => None,
        }
    }

    /// The earliest pending deadline, stale entries included.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(t: u64) -> Timestamp {
        Timestamp::from(t)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut h = TimerHeap::new();
        h.insert(ts(30), Pid(3), WaitTag::Sleep);
        h.insert(ts(10), Pid(1), WaitTag::Sleep);
        h.insert(
            ts(20),
            Pid(2),
            WaitTag::Mailbox {
                handle: HandleId(5),
            },
        );

        assert_eq!(h.next_deadline(), Some(ts(10)));
        assert!(h.pop_due(ts(9)).is_none());

        let order: Vec<Pid> = std::iter::from_fn(|| h.pop_due(ts(100)).map(|e| e.pid)).collect();
        assert_eq!(order, [Pid(1), Pid(2), Pid(3)]);
        assert!(h.is_empty());
    }

    #[test]
    fn equal_deadlines_break_ties_by_pid() {
        let mut h = TimerHeap::new();
        h.insert(ts(5), Pid(9), WaitTag::Sleep);
        h.insert(ts(5), Pid(2), WaitTag::Sleep);
        assert_eq!(h.pop_due(ts(5)).unwrap().pid, Pid(2));
        assert_eq!(h.pop_due(ts(5)).unwrap().pid, Pid(9));
    }

    #[test]
    fn due_means_less_or_equal() {
        let mut h = TimerHeap::new();
        h.insert(ts(50), Pid(1), WaitTag::Sleep);
        assert!(h.pop_due(ts(49)).is_none());
        assert_eq!(h.pop_due(ts(50)).unwrap().deadline, ts(50));
    }
}
