// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mailbox manager: named, typed message queues with wait/wake.
//!
//! Descriptors live in an arena and are found by their namespaced target
//! name; handles are stable integers naming a descriptor plus per-reader
//! state. Tasks hold handles, descriptors hold waiter handles, and nothing
//! holds a back-pointer, so teardown in any order is safe.
//!
//! The manager itself never blocks anybody: operations that cannot complete
//! return a status, and the *executive* decides whether to park the calling
//! task. Ops that can ready a blocked task return the affected waiters as
//! [`Waker`] values for the executive to act on, which keeps the
//! manager/scheduler boundary one-directional.
//!
//! Delivery modes per descriptor:
//!
//! - **single-reader** (empty mode mask): a FIFO of capacity N. A full queue
//!   refuses the send (`WouldBlock`), or with `DROP_OLDEST` evicts the
//!   oldest and reports `Overrun`.
//! - **fan-out** (`FAN_OUT`): each message is retained until every
//!   registered reader's acknowledged sequence has passed it; a bounded
//!   retention buffer evicts the oldest (with `mailbox_overrun`) when a
//!   lagging reader would otherwise pin unbounded memory.
//! - **tap** (`TAP` admitted): best-effort observers with private bounded
//!   buffers; a full tap drops and emits `mailbox_overrun`, and can never
//!   delay the sender.

use std::collections::{HashMap, VecDeque};

use hsx_abi::{Code, EventKind, HandleId, MailboxMode, OpenFlags, Pid, Timestamp};
use ringq::RingQ;

use crate::events::EventBus;

/// Target namespaces, by name prefix.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Namespace {
    /// `svc:` -- owned by a system service; persists for the runtime's life.
    Svc,
    /// `pid:` -- private to one task; collected when its last handle closes.
    Task,
    /// `app:` -- application-scoped; persists across task restarts.
    App,
    /// `shared:` -- global.
    Shared,
}

fn parse_namespace(target: &str) -> Option<Namespace> {
    let prefix = target.split_once(':')?.0;
    match prefix {
        "svc" => Some(Namespace::Svc),
        "pid" => Some(Namespace::Task),
        "app" => Some(Namespace::App),
        "shared" => Some(Namespace::Shared),
        _ => None,
    }
}

/// One queued message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// Per-descriptor send sequence, starting at 1.
    pub seq: u64,
    pub sender: Pid,
    pub ts: Timestamp,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Descriptor {
    name: String,
    namespace: Namespace,
    mode: MailboxMode,
    /// Declared queue capacity (single-reader bound; fan-out descriptors
    /// are additionally bounded by the retention cap).
    capacity: usize,
    owner: Option<Pid>,
    queue: RingQ<Message>,
    /// Next send sequence to assign.
    next_seq: u64,
    /// Fan-out readers in registration order.
    readers: Vec<HandleId>,
    /// Blocked receivers, oldest first.
    waiters: VecDeque<HandleId>,
    taps: Vec<HandleId>,
    max_depth: usize,
    handle_count: usize,
}

#[derive(Debug)]
struct HandleRec {
    desc: u32,
    owner: Pid,
    reader: bool,
    /// Acknowledged sequence: the reader has consumed everything `<= this`.
    last_seq: u64,
    /// `Some` for tap handles; taps read their private buffer.
    tap_buf: Option<RingQ<Message>>,
}

/// A blocked receiver that an operation has made runnable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Waker {
    pub handle: HandleId,
    pub pid: Pid,
}

/// Manager-level policy, copied out of the executive's configuration.
#[derive(Copy, Clone, Debug)]
pub struct MailboxConfig {
    pub descriptor_pool: usize,
    pub handle_quota: usize,
    pub default_capacity: usize,
    pub fanout_retention_cap: usize,
    pub tap_buffer: usize,
}

/// Per-descriptor diagnostics from [`MailboxManager::resource_stats`].
#[derive(Clone, Debug)]
pub struct DescriptorStats {
    pub index: u32,
    pub name: String,
    pub mode: MailboxMode,
    pub capacity: usize,
    pub depth: usize,
    pub max_depth: usize,
    pub handle_count: usize,
    pub waiters: usize,
    pub owner: Option<Pid>,
}

/// Snapshot of the whole subsystem.
#[derive(Clone, Debug, Default)]
pub struct ResourceStats {
    pub descriptors: Vec<DescriptorStats>,
    pub handles_by_task: Vec<(Pid, usize)>,
}

/// Outcome of a send.
#[derive(Debug)]
pub struct SendOutcome {
    pub status: Code,
    /// Assigned sequence; 0 when nothing was accepted.
    pub seq: u64,
    pub wakers: Vec<Waker>,
}

impl SendOutcome {
    fn refused(status: Code) -> Self {
        Self {
            status,
            seq: 0,
            wakers: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct MailboxManager {
    cfg: MailboxConfig,
    descriptors: Vec<Option<Descriptor>>,
    by_name: HashMap<String, u32>,
    handles: HashMap<HandleId, HandleRec>,
    next_handle: u32,
    handle_counts: HashMap<Pid, usize>,
}

impl MailboxManager {
    pub fn new(cfg: MailboxConfig) -> Self {
        Self {
            cfg,
            descriptors: Vec::new(),
            by_name: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            handle_counts: HashMap::new(),
        }
    }

    /// Creates a descriptor, or reuses an existing one when the namespace
    /// policy allows and the parameters agree. Returns a handle that can
    /// send, and -- except on fan-out descriptors, where consumption is a
    /// reader-only affair -- also receive.
    pub fn bind(
        &mut self,
        bus: &mut EventBus,
        now: Timestamp,
        owner: Pid,
        target: &str,
        capacity: Option<u32>,
        mode: MailboxMode,
    ) -> Result<HandleId, Code> {
        let namespace = parse_namespace(target).ok_or(Code::BadState)?;
        if mode.intersects(MailboxMode::RESERVED) {
            return Err(Code::BadState);
        }

        if let Some(&idx) = self.by_name.get(target) {
            let desc = self.descriptor(idx);
            if desc.namespace == Namespace::Task {
                // Private descriptors are never shared by rebinding; the
                // taxonomy has no already-exists code, so Busy reports it.
                return Err(Code::Busy);
            }
            let capacity_matches =
                capacity.is_none() || capacity == Some(desc.capacity as u32);
            if desc.mode != mode || !capacity_matches {
                // Exists with conflicting parameters; Busy again stands in
                // for already-exists.
                return Err(Code::Busy);
            }
            self.check_quota(owner)?;
            let reader = !mode.contains(MailboxMode::FAN_OUT);
            return Ok(self.issue_handle(idx, owner, reader, None));
        }

        let live = self.descriptors.iter().flatten().count();
        if live >= self.cfg.descriptor_pool {
            bus.publish(
                now,
                Some(owner),
                EventKind::MailboxExhausted {
                    target: target.to_string(),
                },
            );
            return Err(Code::NoDescriptor);
        }
        self.check_quota(owner)?;

        let capacity = capacity.unwrap_or(self.cfg.default_capacity as u32) as usize;
        let ring_cap = if mode.contains(MailboxMode::FAN_OUT) {
            self.cfg.fanout_retention_cap.max(capacity)
        } else {
            capacity
        };
        let desc = Descriptor {
            name: target.to_string(),
            namespace,
            mode,
            capacity,
            owner: Some(owner),
            queue: RingQ::new(ring_cap),
            next_seq: 1,
            readers: Vec::new(),
            waiters: VecDeque::new(),
            taps: Vec::new(),
            max_depth: 0,
            handle_count: 0,
        };
        let idx = self.install(desc);
        self.by_name.insert(target.to_string(), idx);
        let reader = !mode.contains(MailboxMode::FAN_OUT);
        Ok(self.issue_handle(idx, owner, reader, None))
    }

    /// Obtains a reader or tap handle to an existing descriptor.
    pub fn open(&mut self, owner: Pid, target: &str, flags: OpenFlags) -> Result<HandleId, Code> {
        let &idx = self.by_name.get(target).ok_or(Code::NotFound)?;
        if flags.contains(OpenFlags::TAP) {
            return self.attach_tap(owner, idx, None);
        }
        if !flags.contains(OpenFlags::READER) {
            return Err(Code::BadState);
        }
        self.check_quota(owner)?;
        let start_seq = {
            let desc = self.descriptor(idx);
            // A late-joining fan-out reader starts at the current tail; it
            // does not retroactively pin messages sent before it existed.
            desc.next_seq - 1
        };
        let fan_out = self.descriptor(idx).mode.contains(MailboxMode::FAN_OUT);
        let handle = self.issue_handle(idx, owner, true, None);
        if fan_out {
            self.handles.get_mut(&handle).unwrap().last_seq = start_seq;
            self.descriptor_mut(idx).readers.push(handle);
        }
        Ok(handle)
    }

    /// Attaches a non-blocking observer.
    pub fn tap(
        &mut self,
        owner: Pid,
        target: &str,
        buffer_hint: Option<u32>,
    ) -> Result<HandleId, Code> {
        let &idx = self.by_name.get(target).ok_or(Code::NotFound)?;
        self.attach_tap(owner, idx, buffer_hint)
    }

    fn attach_tap(
        &mut self,
        owner: Pid,
        idx: u32,
        buffer_hint: Option<u32>,
    ) -> Result<HandleId, Code> {
        if !self.descriptor(idx).mode.contains(MailboxMode::TAP) {
            return Err(Code::BadState);
        }
        self.check_quota(owner)?;
        let cap = buffer_hint.map(|h| h as usize).unwrap_or(self.cfg.tap_buffer);
        let handle = self.issue_handle(idx, owner, false, Some(RingQ::new(cap.max(1))));
        self.descriptor_mut(idx).taps.push(handle);
        Ok(handle)
    }

    /// Enqueues one message. `src` overrides the sender pid recorded on the
    /// message (used when a service forwards on behalf of a task).
    pub fn send(
        &mut self,
        bus: &mut EventBus,
        now: Timestamp,
        handle: HandleId,
        bytes: Vec<u8>,
        src: Option<Pid>,
    ) -> SendOutcome {
        let Some(rec) = self.handles.get(&handle) else {
            return SendOutcome::refused(Code::BadHandle);
        };
        let idx = rec.desc;
        let sender = src.unwrap_or(rec.owner);

        let (fan_out, drop_oldest, full) = {
            let desc = self.descriptor(idx);
            (
                desc.mode.contains(MailboxMode::FAN_OUT),
                desc.mode.contains(MailboxMode::DROP_OLDEST),
                desc.queue.is_full(),
            )
        };
        // The default single-reader overflow policy refuses the send; the
        // message is never observable, so taps don't see it either.
        if !fan_out && full && !drop_oldest {
            return SendOutcome::refused(Code::WouldBlock);
        }

        let seq = self.descriptor(idx).next_seq;
        let message = Message {
            seq,
            sender,
            ts: now,
            bytes,
        };
        let size = message.bytes.len() as u32;

        // Taps first; they only ever drop on their own private buffers.
        let taps = self.descriptor(idx).taps.clone();
        for tap in taps {
            let buf = self
                .handles
                .get_mut(&tap)
                .and_then(|r| r.tap_buf.as_mut())
                .expect("tap list names a live tap handle");
            if buf.force_push(message.clone()).is_some() {
                bus.publish(
                    now,
                    Some(self.handles[&tap].owner),
                    EventKind::MailboxOverrun {
                        descriptor: idx,
                        handle: Some(tap),
                    },
                );
            }
        }

        let mut status = Code::Ok;
        let evicted = self.descriptor_mut(idx).queue.force_push(message);
        if let Some(evicted) = evicted {
            // Retention (fan-out) or drop-oldest (single-reader) eviction.
            status = Code::Overrun;
            bus.publish(
                now,
                None,
                EventKind::MailboxOverrun {
                    descriptor: idx,
                    handle: None,
                },
            );
            if fan_out {
                // Readers that hadn't consumed the evicted message skip it.
                let readers = self.descriptor(idx).readers.clone();
                for r in readers {
                    let rec = self.handles.get_mut(&r).unwrap();
                    rec.last_seq = rec.last_seq.max(evicted.seq);
                }
            }
        }

        let desc = self.descriptor_mut(idx);
        desc.next_seq += 1;
        desc.max_depth = desc.max_depth.max(desc.queue.len());

        bus.publish(
            now,
            Some(sender),
            EventKind::MailboxSend {
                descriptor: idx,
                handle,
                size,
            },
        );

        let wakers = self.collect_wakers(idx, seq);
        SendOutcome {
            status,
            seq,
            wakers,
        }
    }

    /// Picks the blocked receivers this message readies: the oldest waiter
    /// for a single-reader queue, every waiter behind the new message for
    /// fan-out. Chosen waiters are removed from the descriptor's list.
    fn collect_wakers(&mut self, idx: u32, seq: u64) -> Vec<Waker> {
        let fan_out = self
            .descriptor(idx)
            .mode
            .contains(MailboxMode::FAN_OUT);
        let mut wakers = Vec::new();
        if fan_out {
            let rest = std::mem::take(&mut self.descriptor_mut(idx).waiters);
            for h in rest {
                let lagging = self.handles[&h].last_seq < seq;
                if lagging {
                    wakers.push(Waker {
                        handle: h,
                        pid: self.handles[&h].owner,
                    });
                } else {
                    self.descriptor_mut(idx).waiters.push_back(h);
                }
            }
        } else {
            let woken = {
                let desc = self.descriptor_mut(idx);
                if desc.queue.is_empty() {
                    None
                } else {
                    desc.waiters.pop_front()
                }
            };
            if let Some(h) = woken {
                wakers.push(Waker {
                    handle: h,
                    pid: self.handles[&h].owner,
                });
            }
        }
        wakers
    }

    /// Non-blocking receive. `Ok(None)` means "nothing available right
    /// now"; the caller decides whether that becomes `WouldBlock`, a parked
    /// task, or a timeout.
    pub fn recv_poll(
        &mut self,
        bus: &mut EventBus,
        now: Timestamp,
        handle: HandleId,
    ) -> Result<Option<Message>, Code> {
        let rec = self.handles.get(&handle).ok_or(Code::BadHandle)?;
        let idx = rec.desc;
        let owner = rec.owner;

        if rec.tap_buf.is_some() {
            let rec = self.handles.get_mut(&handle).unwrap();
            let msg = rec.tap_buf.as_mut().unwrap().pop();
            if let Some(m) = &msg {
                bus.publish(
                    now,
                    Some(owner),
                    EventKind::MailboxRecv {
                        descriptor: idx,
                        handle,
                        size: m.bytes.len() as u32,
                    },
                );
            }
            return Ok(msg);
        }

        if !rec.reader {
            return Err(Code::BadState);
        }

        let fan_out = self.descriptor(idx).mode.contains(MailboxMode::FAN_OUT);
        let msg = if fan_out {
            let last = rec.last_seq;
            let found = self
                .descriptor(idx)
                .queue
                .iter()
                .find(|m| m.seq > last)
                .cloned();
            if let Some(m) = &found {
                self.handles.get_mut(&handle).unwrap().last_seq = m.seq;
                self.reclaim(idx);
            }
            found
        } else {
            let msg = self.descriptor_mut(idx).queue.pop();
            if let Some(m) = &msg {
                self.handles.get_mut(&handle).unwrap().last_seq = m.seq;
            }
            msg
        };

        if let Some(m) = &msg {
            bus.publish(
                now,
                Some(owner),
                EventKind::MailboxRecv {
                    descriptor: idx,
                    handle,
                    size: m.bytes.len() as u32,
                },
            );
        }
        Ok(msg)
    }

    /// Non-destructive look at the next message this handle would receive.
    pub fn peek(&self, handle: HandleId) -> Result<Option<Message>, Code> {
        let rec = self.handles.get(&handle).ok_or(Code::BadHandle)?;
        if let Some(buf) = &rec.tap_buf {
            return Ok(buf.front().cloned());
        }
        if !rec.reader {
            return Err(Code::BadState);
        }
        let desc = self.descriptor(rec.desc);
        if desc.mode.contains(MailboxMode::FAN_OUT) {
            Ok(desc.queue.iter().find(|m| m.seq > rec.last_seq).cloned())
        } else {
            Ok(desc.queue.front().cloned())
        }
    }

    /// Parks `handle` on its descriptor's waiter list (FIFO). The executive
    /// has already decided to block the owning task.
    pub fn enqueue_waiter(&mut self, bus: &mut EventBus, now: Timestamp, handle: HandleId) {
        let rec = &self.handles[&handle];
        let idx = rec.desc;
        let owner = rec.owner;
        self.descriptor_mut(idx).waiters.push_back(handle);
        bus.publish(
            now,
            Some(owner),
            EventKind::MailboxWait {
                descriptor: idx,
                handle,
            },
        );
    }

    /// Removes `handle` from its descriptor's waiter list, if present.
    /// Timeout, pause, kill, and closure all funnel through here.
    pub fn cancel_waiter(&mut self, handle: HandleId) {
        if let Some(rec) = self.handles.get(&handle) {
            let idx = rec.desc;
            self.descriptor_mut(idx).waiters.retain(|&h| h != handle);
        }
    }

    /// Releases a handle. Collects the descriptor when the last handle on a
    /// `pid:` descriptor goes away; other namespaces persist for idempotent
    /// rebinding.
    pub fn close(&mut self, handle: HandleId) -> Code {
        let Some(rec) = self.handles.remove(&handle) else {
            return Code::BadHandle;
        };
        let idx = rec.desc;
        if let Some(count) = self.handle_counts.get_mut(&rec.owner) {
            *count = count.saturating_sub(1);
        }

        let was_reader = {
            let desc = self.descriptor_mut(idx);
            desc.waiters.retain(|&h| h != handle);
            desc.taps.retain(|&h| h != handle);
            let before = desc.readers.len();
            desc.readers.retain(|&h| h != handle);
            desc.handle_count -= 1;
            before != desc.readers.len()
        };
        if was_reader {
            // A departed lagging reader no longer pins retention.
            self.reclaim(idx);
        }

        let desc = self.descriptor(idx);
        if desc.handle_count == 0 && desc.namespace == Namespace::Task {
            let name = desc.name.clone();
            self.by_name.remove(&name);
            self.descriptors[idx as usize] = None;
        }
        Code::Ok
    }

    /// Closes every handle owned by `pid`, for task teardown.
    pub fn close_all_for(&mut self, pid: Pid) {
        let owned: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, r)| r.owner == pid)
            .map(|(&h, _)| h)
            .collect();
        for h in owned {
            self.close(h);
        }
        self.handle_counts.remove(&pid);
    }

    /// The pid that owns `handle`, if it is live.
    pub fn handle_owner(&self, handle: HandleId) -> Option<Pid> {
        self.handles.get(&handle).map(|r| r.owner)
    }

    /// The descriptor index behind `handle`, if it is live.
    pub fn descriptor_of(&self, handle: HandleId) -> Option<u32> {
        self.handles.get(&handle).map(|r| r.desc)
    }

    pub fn resource_stats(&self) -> ResourceStats {
        let mut descriptors: Vec<DescriptorStats> = self
            .descriptors
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().map(|d| (i, d)))
            .map(|(i, d)| DescriptorStats {
                index: i as u32,
                name: d.name.clone(),
                mode: d.mode,
                capacity: d.capacity,
                depth: d.queue.len(),
                max_depth: d.max_depth,
                handle_count: d.handle_count,
                waiters: d.waiters.len(),
                owner: d.owner,
            })
            .collect();
        descriptors.sort_by_key(|d| d.index);
        let mut handles_by_task: Vec<(Pid, usize)> = self
            .handle_counts
            .iter()
            .filter(|(_, &n)| n > 0)
            .map(|(&p, &n)| (p, n))
            .collect();
        handles_by_task.sort_by_key(|&(p, _)| p);
        ResourceStats {
            descriptors,
            handles_by_task,
        }
    }

    /// Drops the longest fully-acknowledged prefix of a fan-out retention
    /// buffer. No-op while the descriptor has no registered readers, so
    /// early sends are not lost before the first reader opens.
    fn reclaim(&mut self, idx: u32) {
        let desc = self.descriptor(idx);
        if !desc.mode.contains(MailboxMode::FAN_OUT) || desc.readers.is_empty() {
            return;
        }
        let min_acked = desc
            .readers
            .iter()
            .map(|h| self.handles[h].last_seq)
            .min()
            .unwrap();
        self.descriptor_mut(idx)
            .queue
            .drain_front_while(|m| m.seq <= min_acked);
    }

    fn check_quota(&self, owner: Pid) -> Result<(), Code> {
        let used = self.handle_counts.get(&owner).copied().unwrap_or(0);
        if used >= self.cfg.handle_quota {
            Err(Code::Quota)
        } else {
            Ok(())
        }
    }

    fn issue_handle(
        &mut self,
        desc: u32,
        owner: Pid,
        reader: bool,
        tap_buf: Option<RingQ<Message>>,
    ) -> HandleId {
        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(
            id,
            HandleRec {
                desc,
                owner,
                reader,
                last_seq: 0,
                tap_buf,
            },
        );
        *self.handle_counts.entry(owner).or_insert(0) += 1;
        self.descriptor_mut(desc).handle_count += 1;
        id
    }

    fn install(&mut self, desc: Descriptor) -> u32 {
        for (i, slot) in self.descriptors.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(desc);
                return i as u32;
            }
        }
        self.descriptors.push(Some(desc));
        self.descriptors.len() as u32 - 1
    }

    fn descriptor(&self, idx: u32) -> &Descriptor {
        self.descriptors[idx as usize]
            .as_ref()
            .expect("descriptor index is live")
    }

    fn descriptor_mut(&mut self, idx: u32) -> &mut Descriptor {
        self.descriptors[idx as usize]
            .as_mut()
            .expect("descriptor index is live")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MailboxConfig {
        MailboxConfig {
            descriptor_pool: 8,
            handle_quota: 8,
            default_capacity: 4,
            fanout_retention_cap: 8,
            tap_buffer: 2,
        }
    }

    fn setup() -> (MailboxManager, EventBus) {
        (MailboxManager::new(cfg()), EventBus::new(64))
    }

    fn ts(t: u64) -> Timestamp {
        Timestamp::from(t)
    }

    #[test]
    fn single_reader_fifo() {
        let (mut m, mut bus) = setup();
        let h = m
            .bind(&mut bus, ts(0), Pid(1), "shared:q", Some(4), MailboxMode::empty())
            .unwrap();
        for b in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            assert_eq!(m.send(&mut bus, ts(1), h, b, None).status, Code::Ok);
        }
        let got: Vec<Vec<u8>> = std::iter::from_fn(|| {
            m.recv_poll(&mut bus, ts(2), h).unwrap().map(|msg| msg.bytes)
        })
        .collect();
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn single_reader_full_refuses_or_drops() {
        let (mut m, mut bus) = setup();
        let h = m
            .bind(&mut bus, ts(0), Pid(1), "shared:q", Some(1), MailboxMode::empty())
            .unwrap();
        assert_eq!(m.send(&mut bus, ts(0), h, vec![1], None).status, Code::Ok);
        assert_eq!(
            m.send(&mut bus, ts(0), h, vec![2], None).status,
            Code::WouldBlock
        );

        let d = m
            .bind(
                &mut bus,
                ts(0),
                Pid(1),
                "shared:dropper",
                Some(1),
                MailboxMode::DROP_OLDEST,
            )
            .unwrap();
        assert_eq!(m.send(&mut bus, ts(0), d, vec![1], None).status, Code::Ok);
        assert_eq!(
            m.send(&mut bus, ts(0), d, vec![2], None).status,
            Code::Overrun
        );
        assert_eq!(
            m.recv_poll(&mut bus, ts(0), d).unwrap().unwrap().bytes,
            vec![2]
        );
    }

    #[test]
    fn descriptor_pool_exhaustion_and_recovery() {
        let (mut m, mut bus) = {
            let mut c = cfg();
            c.descriptor_pool = 2;
            (MailboxManager::new(c), EventBus::new(64))
        };
        let sub = bus.subscribe(crate::events::EventFilter::default(), None);
        let a = m
            .bind(&mut bus, ts(0), Pid(1), "shared:a", None, MailboxMode::empty())
            .unwrap();
        let _b = m
            .bind(&mut bus, ts(0), Pid(1), "shared:b", None, MailboxMode::empty())
            .unwrap();
        assert_eq!(
            m.bind(&mut bus, ts(0), Pid(1), "pid:1:c", None, MailboxMode::empty()),
            Err(Code::NoDescriptor)
        );
        let events = bus.poll(sub, 64);
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::MailboxExhausted { target } if target == "pid:1:c")));

        // `shared:` descriptors persist after close, so freeing one does
        // not shrink the pool; a `pid:` one is collected and does.
        let c = {
            let mut m2 = MailboxManager::new(MailboxConfig {
                descriptor_pool: 2,
                ..cfg()
            });
            let h1 = m2
                .bind(&mut bus, ts(0), Pid(1), "pid:1:x", None, MailboxMode::empty())
                .unwrap();
            let _h2 = m2
                .bind(&mut bus, ts(0), Pid(1), "shared:y", None, MailboxMode::empty())
                .unwrap();
            assert_eq!(
                m2.bind(&mut bus, ts(0), Pid(1), "shared:z", None, MailboxMode::empty()),
                Err(Code::NoDescriptor)
            );
            m2.close(h1);
            m2.bind(&mut bus, ts(0), Pid(1), "shared:z", None, MailboxMode::empty())
        };
        assert!(c.is_ok());
        let _ = a;
    }

    #[test]
    fn handle_quota() {
        let (mut m, mut bus) = {
            let mut c = cfg();
            c.handle_quota = 2;
            (MailboxManager::new(c), EventBus::new(64))
        };
        let _a = m
            .bind(&mut bus, ts(0), Pid(1), "shared:a", None, MailboxMode::empty())
            .unwrap();
        let _b = m
            .bind(&mut bus, ts(0), Pid(1), "shared:b", None, MailboxMode::empty())
            .unwrap();
        assert_eq!(
            m.bind(&mut bus, ts(0), Pid(1), "shared:c", None, MailboxMode::empty()),
            Err(Code::Quota)
        );
        // Another task is not affected.
        assert!(m.open(Pid(2), "shared:a", OpenFlags::READER).is_ok());
    }

    #[test]
    fn fanout_retains_until_all_ack_then_reclaims() {
        let (mut m, mut bus) = setup();
        let w = m
            .bind(&mut bus, ts(0), Pid(1), "app:telem", Some(4), MailboxMode::FAN_OUT)
            .unwrap();
        let r1 = m.open(Pid(2), "app:telem", OpenFlags::READER).unwrap();
        let r2 = m.open(Pid(3), "app:telem", OpenFlags::READER).unwrap();

        for i in 0..3u8 {
            assert_eq!(m.send(&mut bus, ts(1), w, vec![i], None).status, Code::Ok);
        }
        // r1 drains fully; retention pinned by r2.
        for i in 0..3u8 {
            assert_eq!(
                m.recv_poll(&mut bus, ts(2), r1).unwrap().unwrap().bytes,
                vec![i]
            );
        }
        assert_eq!(m.resource_stats().descriptors[0].depth, 3);
        // r2 catches up; queue drains to empty.
        for i in 0..3u8 {
            assert_eq!(
                m.recv_poll(&mut bus, ts(3), r2).unwrap().unwrap().bytes,
                vec![i]
            );
        }
        assert_eq!(m.resource_stats().descriptors[0].depth, 0);
        assert!(m.recv_poll(&mut bus, ts(4), r1).unwrap().is_none());
    }

    #[test]
    fn fanout_preserves_order_per_reader() {
        let (mut m, mut bus) = setup();
        let w = m
            .bind(&mut bus, ts(0), Pid(1), "app:t", None, MailboxMode::FAN_OUT)
            .unwrap();
        let r1 = m.open(Pid(2), "app:t", OpenFlags::READER).unwrap();
        let r2 = m.open(Pid(3), "app:t", OpenFlags::READER).unwrap();
        for i in 0..4u8 {
            m.send(&mut bus, ts(0), w, vec![i], None);
        }
        // Interleaved consumption; each reader still sees 0,1,2,3.
        let mut got1 = Vec::new();
        let mut got2 = Vec::new();
        for _ in 0..2 {
            got1.push(m.recv_poll(&mut bus, ts(1), r1).unwrap().unwrap().bytes[0]);
        }
        for _ in 0..4 {
            got2.push(m.recv_poll(&mut bus, ts(1), r2).unwrap().unwrap().bytes[0]);
        }
        for _ in 0..2 {
            got1.push(m.recv_poll(&mut bus, ts(1), r1).unwrap().unwrap().bytes[0]);
        }
        assert_eq!(got1, [0, 1, 2, 3]);
        assert_eq!(got2, [0, 1, 2, 3]);
    }

    #[test]
    fn fanout_retention_cap_drops_oldest_with_overrun() {
        let (mut m, mut bus) = {
            let mut c = cfg();
            c.fanout_retention_cap = 2;
            (MailboxManager::new(c), EventBus::new(64))
        };
        let sub = bus.subscribe(crate::events::EventFilter::default(), None);
        let w = m
            .bind(&mut bus, ts(0), Pid(1), "app:t", Some(2), MailboxMode::FAN_OUT)
            .unwrap();
        let r = m.open(Pid(2), "app:t", OpenFlags::READER).unwrap();
        for i in 0..4u8 {
            m.send(&mut bus, ts(0), w, vec![i], None);
        }
        // The two oldest were evicted; the reader resumes at message 2.
        assert_eq!(
            m.recv_poll(&mut bus, ts(1), r).unwrap().unwrap().bytes,
            vec![2]
        );
        let events = bus.poll(sub, 64);
        let overruns = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::MailboxOverrun { handle: None, .. }))
            .count();
        assert_eq!(overruns, 2);
    }

    #[test]
    fn taps_never_block_and_drop_on_overflow() {
        let (mut m, mut bus) = setup();
        let w = m
            .bind(
                &mut bus,
                ts(0),
                Pid(1),
                "svc:uart",
                Some(8),
                MailboxMode::TAP,
            )
            .unwrap();
        let t = m.tap(Pid(9), "svc:uart", Some(2)).unwrap();
        let sub = bus.subscribe(crate::events::EventFilter::default(), None);
        for i in 0..5u8 {
            assert_eq!(m.send(&mut bus, ts(0), w, vec![i], None).status, Code::Ok);
        }
        // Tap buffer kept the newest two; sends never failed.
        assert_eq!(
            m.recv_poll(&mut bus, ts(1), t).unwrap().unwrap().bytes,
            vec![3]
        );
        assert_eq!(
            m.recv_poll(&mut bus, ts(1), t).unwrap().unwrap().bytes,
            vec![4]
        );
        let tap_overruns = bus
            .poll(sub, 64)
            .iter()
            .filter(|e| matches!(e.kind, EventKind::MailboxOverrun { handle: Some(h), .. } if h == t))
            .count();
        assert_eq!(tap_overruns, 3);
    }

    #[test]
    fn waiters_wake_fifo_one_per_message() {
        let (mut m, mut bus) = setup();
        let h = m
            .bind(&mut bus, ts(0), Pid(1), "shared:q", Some(4), MailboxMode::empty())
            .unwrap();
        let r1 = m.open(Pid(2), "shared:q", OpenFlags::READER).unwrap();
        let r2 = m.open(Pid(3), "shared:q", OpenFlags::READER).unwrap();
        m.enqueue_waiter(&mut bus, ts(0), r1);
        m.enqueue_waiter(&mut bus, ts(1), r2);

        let out = m.send(&mut bus, ts(2), h, vec![7], None);
        assert_eq!(
            out.wakers,
            vec![Waker {
                handle: r1,
                pid: Pid(2)
            }]
        );
        let out = m.send(&mut bus, ts(3), h, vec![8], None);
        assert_eq!(
            out.wakers,
            vec![Waker {
                handle: r2,
                pid: Pid(3)
            }]
        );
    }

    #[test]
    fn bind_reuse_is_idempotent_for_app_namespace() {
        let (mut m, mut bus) = setup();
        let a = m
            .bind(&mut bus, ts(0), Pid(1), "app:cfg", Some(4), MailboxMode::empty())
            .unwrap();
        let b = m
            .bind(&mut bus, ts(0), Pid(2), "app:cfg", Some(4), MailboxMode::empty())
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(m.resource_stats().descriptors.len(), 1);
        // Conflicting parameters refuse.
        assert_eq!(
            m.bind(&mut bus, ts(0), Pid(3), "app:cfg", Some(9), MailboxMode::empty()),
            Err(Code::Busy)
        );
        assert_eq!(
            m.bind(&mut bus, ts(0), Pid(3), "app:cfg", None, MailboxMode::FAN_OUT),
            Err(Code::Busy)
        );
    }

    #[test]
    fn malformed_targets_are_refused() {
        let (mut m, mut bus) = setup();
        assert_eq!(
            m.bind(&mut bus, ts(0), Pid(1), "noprefix", None, MailboxMode::empty()),
            Err(Code::BadState)
        );
        assert_eq!(
            m.bind(&mut bus, ts(0), Pid(1), "bogus:q", None, MailboxMode::empty()),
            Err(Code::BadState)
        );
        assert_eq!(m.open(Pid(1), "shared:nope", OpenFlags::READER), Err(Code::NotFound));
    }

    #[test]
    fn close_collects_pid_descriptors_only() {
        let (mut m, mut bus) = setup();
        let p = m
            .bind(&mut bus, ts(0), Pid(4), "pid:4:inbox", None, MailboxMode::empty())
            .unwrap();
        let s = m
            .bind(&mut bus, ts(0), Pid(4), "shared:keep", None, MailboxMode::empty())
            .unwrap();
        m.close(p);
        m.close(s);
        let stats = m.resource_stats();
        assert_eq!(stats.descriptors.len(), 1);
        assert_eq!(stats.descriptors[0].name, "shared:keep");
        // The collected name can be bound fresh.
        assert!(m
            .bind(&mut bus, ts(1), Pid(4), "pid:4:inbox", None, MailboxMode::empty())
            .is_ok());
    }

    #[test]
    fn stale_handles_report_bad_handle() {
        let (mut m, mut bus) = setup();
        let h = m
            .bind(&mut bus, ts(0), Pid(1), "shared:q", None, MailboxMode::empty())
            .unwrap();
        m.close(h);
        assert_eq!(m.close(h), Code::BadHandle);
        assert_eq!(m.recv_poll(&mut bus, ts(0), h), Err(Code::BadHandle));
        assert_eq!(m.send(&mut bus, ts(0), h, vec![], None).status, Code::BadHandle);
        assert_eq!(m.peek(h), Err(Code::BadHandle));
    }
}
