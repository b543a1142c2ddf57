// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event bus: sequenced observability with bounded backlogs.
//!
//! Every subsystem publishes through one [`EventBus`], which assigns a
//! bus-wide monotonic `seq` and fans the event out to matching subscribers.
//! Each subscriber owns a queue with a configured backlog. When a subscriber
//! lags, *progress-type* events (`trace_step`, `provisioning_progress`) are
//! coalesced: older queued events of the same kind for the same pid are
//! dropped in favor of the newest, and a single `Overrun` marker records how
//! many were lost. State-type events (`task_state`, `debug_break`, the
//! non-progress `mailbox_*` family) are never coalesced; they are queued
//! even past the backlog mark, on the grounds that a debugger would rather
//! spend memory than lose a state transition.

use std::collections::{HashSet, VecDeque};

use hsx_abi::{Event, EventKind, EventTag, Pid, Timestamp};

/// Subscriber identity on the control surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubId(pub u32);

/// What a subscriber wants to see. `None` means "everything" on that axis.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub tags: Option<HashSet<EventTag>>,
    pub pids: Option<HashSet<Pid>>,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(tags) = &self.tags {
            if !tags.contains(&event.kind.tag()) {
                return false;
            }
        }
        if let Some(pids) = &self.pids {
            match event.pid {
                Some(pid) if pids.contains(&pid) => {}
                // Events without a pid (bus markers) are delivered to
                // everyone; a pid filter only narrows pid-carrying events.
                None => {}
                Some(_) => return false,
            }
        }
        true
    }
}

#[derive(Debug)]
struct Subscriber {
    filter: EventFilter,
    queue: VecDeque<Event>,
    backlog: usize,
    /// Highest sequence the client has acknowledged. Purely diagnostic in
    /// this in-process incarnation: delivery removes events from the queue,
    /// and `acked` lets `stats` report how far behind the client's
    /// processing is.
    acked: u64,
}

#[derive(Debug)]
pub struct EventBus {
    next_seq: u64,
    subscribers: Vec<Option<Subscriber>>,
    default_backlog: usize,
}

/// Per-subscriber diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubscriberStats {
    pub queued: usize,
    pub acked: u64,
}

impl EventBus {
    pub fn new(default_backlog: usize) -> Self {
        Self {
            next_seq: 0,
            subscribers: Vec::new(),
            default_backlog,
        }
    }

    /// Registers a subscriber. `backlog` overrides the bus default.
    pub fn subscribe(&mut self, filter: EventFilter, backlog: Option<usize>) -> SubId {
        let sub = Subscriber {
            filter,
            queue: VecDeque::new(),
            backlog: backlog.unwrap_or(self.default_backlog).max(1),
            acked: 0,
        };
        for (i, slot) in self.subscribers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(sub);
                return SubId(i as u32);
            }
        }
        self.subscribers.push(Some(sub));
        SubId(self.subscribers.len() as u32 - 1)
    }

    pub fn unsubscribe(&mut self, id: SubId) -> bool {
        match self.subscribers.get_mut(id.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Publishes one event, returning its sequence number. Subscribers that
    /// lag have progress events coalesced as described on the module.
    pub fn publish(&mut self, ts: Timestamp, pid: Option<Pid>, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = Event { seq, ts, pid, kind };

        // The marker needs its own sequence number, allocated only if some
        // subscriber actually coalesces this round.
        let mut marker_seq = None;

        for slot in &mut self.subscribers {
            let Some(sub) = slot else { continue };
            if !sub.filter.matches(&event) {
                continue;
            }

            let tag = event.kind.tag();
            if tag.is_progress() && sub.queue.len() >= sub.backlog {
                let before = sub.queue.len();
                sub.queue
                    .retain(|e| !(e.kind.tag() == tag && e.pid == event.pid));
                let lost = (before - sub.queue.len()) as u64;
                if sub.queue.len() >= sub.backlog {
                    // Still saturated by non-coalescible events: the
                    // incoming progress event is dropped too.
                    note_loss(sub, lost + 1, ts, &mut marker_seq, &mut self.next_seq);
                    continue;
                }
                sub.queue.push_back(event.clone());
                if lost > 0 {
                    // The marker is appended (or merged) after the event so
                    // delivered sequence numbers stay strictly increasing.
                    note_loss(sub, lost, ts, &mut marker_seq, &mut self.next_seq);
                }
            } else {
                sub.queue.push_back(event.clone());
            }
        }
        seq
    }

    /// Drains up to `max` queued events for a subscriber, oldest first.
    pub fn poll(&mut self, id: SubId, max: usize) -> Vec<Event> {
        let Some(Some(sub)) = self.subscribers.get_mut(id.0 as usize) else {
            return Vec::new();
        };
        let n = max.min(sub.queue.len());
        sub.queue.drain(..n).collect()
    }

    /// Records the client's progress. Acknowledging a sequence lower than a
    /// previous acknowledgement is a no-op.
    pub fn ack(&mut self, id: SubId, seq: u64) {
        if let Some(Some(sub)) = self.subscribers.get_mut(id.0 as usize) {
            sub.acked = sub.acked.max(seq);
        }
    }

    pub fn stats(&self, id: SubId) -> Option<SubscriberStats> {
        let sub = self.subscribers.get(id.0 as usize)?.as_ref()?;
        Some(SubscriberStats {
            queued: sub.queue.len(),
            acked: sub.acked,
        })
    }

    /// Sequence number the next published event will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Accounts `lost` coalesced events against the subscriber's pending
/// `Overrun` marker, creating the marker (with a fresh bus sequence) if the
/// queue doesn't already hold one.
fn note_loss(
    sub: &mut Subscriber,
    lost: u64,
    ts: Timestamp,
    marker_seq: &mut Option<u64>,
    next_seq: &mut u64,
) {
    for e in sub.queue.iter_mut().rev() {
        if let EventKind::Overrun { lost: n } = &mut e.kind {
            *n += lost;
            return;
        }
    }
    let seq = *marker_seq.get_or_insert_with(|| {
        let s = *next_seq;
        *next_seq += 1;
        s
    });
    sub.queue.push_back(Event {
        seq,
        ts,
        pid: None,
        kind: EventKind::Overrun { lost },
    });
}
