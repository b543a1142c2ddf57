// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The executive: task table, scheduler, clock, loader front-end, and the
//! in-process control surface.
//!
//! One [`Executive`] value owns every subsystem -- register file, task
//! table, mailbox manager, event bus, timer heap, stream sessions -- and is
//! the only way in. A host drives it by pumping [`Executive::clock_step`]
//! (or the debugger-style per-task [`Executive::step`]) and talking to the
//! control-surface methods between ticks; everything inside runs on the
//! caller's thread.
//!
//! Each clock tick is: advance time, fire due timers, reap stalled load
//! sessions, pick the task to run (cyclic scan, most important runnable
//! priority wins, strictly-higher priority preempts at the instruction
//! boundary, quantum expiry rotates equals), then execute exactly one
//! instruction and absorb whatever trap it produced.
//!
//! Scheduling-churn transitions (READY ⇄ RUNNING at dispatch) are
//! deliberately not published as events; every other state transition is.

use std::collections::HashMap;
use std::sync::Arc;

use hsx_abi::{
    isa, CapFlags, Code, EventKind, FaultInfo, HandleId, MailboxMode, MemPolicy, OpenFlags,
    Pid, Priority, RegSnapshot, SchedState, StateKind, TaskState, Timestamp,
};
use indexmap::IndexMap;

use crate::events::{EventBus, EventFilter, SubId};
use crate::image::{self, ImageLimits, StreamSession};
use crate::mailbox::{MailboxConfig, MailboxManager, Message, ResourceStats, Waker};
use crate::mem::TaskMemory;
use crate::regfile::RegisterFile;
use crate::task::{self, LoadSource, Task};
use crate::time::{TimerHeap, WaitTag};
use crate::trace::{DisasmCache, DisasmLine, DisasmMode};
use crate::vm;

/// Pid reserved for the host/control surface itself (mailbox handles bound
/// from outside any task are owned by it). Task pids start at 1.
pub const HOST_PID: Pid = Pid(0);

/// Engine configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Instructions granted per dispatch before equals rotate.
    pub quantum: u32,
    /// Stack arena size per task, bytes.
    pub default_stack: u32,
    /// Ceiling on a whole image, monolithic or streamed.
    pub max_image_bytes: usize,
    /// Ceiling on a header's BSS request, bytes.
    pub max_bss_bytes: u32,
    pub descriptor_pool: usize,
    pub handle_quota: usize,
    pub default_mailbox_capacity: usize,
    pub fanout_retention_cap: usize,
    pub tap_buffer: usize,
    pub event_backlog: usize,
    /// Ticks a stream session may sit idle before it is reaped.
    pub stall_timeout: u64,
    /// Capabilities this runtime grants to images.
    pub caps: CapFlags,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            quantum: 32,
            default_stack: 4096,
            max_image_bytes: 64 * 1024,
            max_bss_bytes: 256 * 1024,
            descriptor_pool: 32,
            handle_quota: 16,
            default_mailbox_capacity: 8,
            fanout_retention_cap: 64,
            tap_buffer: 16,
            event_backlog: 256,
            stall_timeout: 10_000,
            caps: CapFlags::MAILBOX
                .union(CapFlags::TIMER)
                .union(CapFlags::FS)
                .union(CapFlags::CAN)
                .union(CapFlags::UART)
                .union(CapFlags::GPIO),
        }
    }
}

/// Diagnostic counters, exposed by value.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecCounters {
    /// Total instructions retired.
    pub step_count: u64,
    /// Dispatches that changed the running task.
    pub context_switches: u64,
    /// Mailbox SVCs processed.
    pub mailbox_step: u64,
    /// Blocked receivers made runnable by a message.
    pub mailbox_wake: u64,
    /// Receives that ended by deadline.
    pub mailbox_timeout: u64,
}

/// The engine clock. Ticks are the only time base; `rate_hz` is an
/// advisory hint for hosts that pace ticks against wall time, and the
/// engine itself never reads it.
#[derive(Copy, Clone, Debug)]
pub struct Clock {
    pub now: Timestamp,
    pub running: bool,
    pub rate_hz: u32,
}

/// One row of `ps()`.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub pid: Pid,
    pub state: StateKind,
    pub priority: Priority,
    pub pc: u32,
    pub last_opcode: u8,
    pub provenance: Option<LoadSource>,
    /// Image identity (CRC32, byte length); `None` while loading.
    pub image: Option<(u32, u32)>,
}

pub struct Executive {
    pub(crate) cfg: ExecConfig,
    pub(crate) clock: Clock,
    pub(crate) regs: RegisterFile,
    pub(crate) tasks: IndexMap<Pid, Task>,
    pub(crate) next_pid: u32,
    pub(crate) current: Option<Pid>,
    pub(crate) quantum_left: u32,
    pub(crate) mailboxes: MailboxManager,
    pub(crate) bus: EventBus,
    pub(crate) timers: TimerHeap,
    pub(crate) sessions: HashMap<Pid, StreamSession>,
    pub(crate) services: HashMap<u32, Box<dyn crate::svc::Service>>,
    pub(crate) counters: ExecCounters,
    pub(crate) disasm: DisasmCache,
}

impl Executive {
    pub fn new(cfg: ExecConfig) -> Self {
        let mailboxes = MailboxManager::new(MailboxConfig {
            descriptor_pool: cfg.descriptor_pool,
            handle_quota: cfg.handle_quota,
            default_capacity: cfg.default_mailbox_capacity,
            fanout_retention_cap: cfg.fanout_retention_cap,
            tap_buffer: cfg.tap_buffer,
        });
        let bus = EventBus::new(cfg.event_backlog);
        Self {
            clock: Clock {
                now: Timestamp::ZERO,
                running: false,
                rate_hz: 0,
            },
            regs: RegisterFile::new(),
            tasks: IndexMap::new(),
            next_pid: 1,
            current: None,
            quantum_left: 0,
            mailboxes,
            bus,
            timers: TimerHeap::new(),
            sessions: HashMap::new(),
            services: HashMap::new(),
            counters: ExecCounters::default(),
            disasm: DisasmCache::new(),
            cfg,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now
    }

    pub fn counters(&self) -> ExecCounters {
        self.counters
    }

    fn limits(&self) -> ImageLimits {
        ImageLimits {
            max_image_bytes: self.cfg.max_image_bytes,
            max_bss_bytes: self.cfg.max_bss_bytes,
        }
    }

    // ----- Loading -----

    /// Validates and admits a monolithic image, returning the new pid.
    pub fn load(&mut self, bytes: Vec<u8>) -> Result<Pid, Code> {
        let image = image::validate(bytes, self.cfg.caps, self.limits())?;
        let pid = self.alloc_pid();
        self.admit(pid, image, LoadSource::Monolithic)
    }

    /// Opens a streaming load session and returns the pid it will become.
    pub fn load_stream_begin(&mut self, expected: Option<u32>) -> Result<Pid, Code> {
        self.load_stream_begin_cfg(expected, MemPolicy::default())
    }

    /// `load_stream_begin` with an explicit debug-access policy for the
    /// finished task.
    pub fn load_stream_begin_cfg(
        &mut self,
        expected: Option<u32>,
        policy: MemPolicy,
    ) -> Result<Pid, Code> {
        if let Some(expected) = expected {
            if expected as usize > self.cfg.max_image_bytes {
                return Err(Code::NoSpace);
            }
        }
        let pid = self.alloc_pid();
        let deadline = self.clock.now.plus(self.cfg.stall_timeout);
        let mut session = StreamSession::new(expected, deadline);
        session.policy = policy;
        self.sessions.insert(pid, session);
        self.bus.publish(
            self.clock.now,
            Some(pid),
            EventKind::ProvisioningStarted { expected },
        );
        Ok(pid)
    }

    /// Appends bytes to a session. `SessionOverflow` leaves the session
    /// open and abortable.
    pub fn load_stream_write(&mut self, pid: Pid, chunk: &[u8]) -> Result<(), Code> {
        let deadline = self.clock.now.plus(self.cfg.stall_timeout);
        let max = self.cfg.max_image_bytes;
        let session = self.sessions.get_mut(&pid).ok_or(Code::NotFound)?;
        let written = session.write(chunk, max)?;
        session.deadline = deadline;
        self.bus.publish(
            self.clock.now,
            Some(pid),
            EventKind::ProvisioningProgress {
                written: written as u32,
            },
        );
        Ok(())
    }

    /// Finalizes a session through the same validation as a monolithic
    /// load. On failure the session is gone and the pid is dead.
    pub fn load_stream_end(&mut self, pid: Pid) -> Result<(), Code> {
        let session = self.sessions.remove(&pid).ok_or(Code::NotFound)?;
        let policy = session.policy;
        let (bytes, _stream_crc) = session.finish();
        let size = bytes.len() as u32;
        match image::validate(bytes, self.cfg.caps, self.limits()) {
            Ok(image) => {
                let crc = image.header().crc;
                match self.admit(pid, image, LoadSource::Streamed) {
                    Ok(_) => {
                        self.tasks.get_mut(&pid).unwrap().policy = policy;
                        self.bus.publish(
                            self.clock.now,
                            Some(pid),
                            EventKind::ProvisioningComplete { size, crc },
                        );
                        Ok(())
                    }
                    Err(status) => {
                        self.bus.publish(
                            self.clock.now,
                            Some(pid),
                            EventKind::ProvisioningError { status },
                        );
                        Err(status)
                    }
                }
            }
            Err(status) => {
                self.bus.publish(
                    self.clock.now,
                    Some(pid),
                    EventKind::ProvisioningError { status },
                );
                Err(status)
            }
        }
    }

    /// Discards a session and everything it reserved.
    pub fn load_stream_abort(&mut self, pid: Pid) -> Result<(), Code> {
        self.sessions.remove(&pid).ok_or(Code::NotFound)?;
        self.bus.publish(
            self.clock.now,
            Some(pid),
            EventKind::ProvisioningAborted { status: Code::Ok },
        );
        Ok(())
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Shared tail of both load paths: allocate arenas and window, seed
    /// registers, preregister declarative resources, go READY.
    fn admit(&mut self, pid: Pid, image: image::CodeImage, provenance: LoadSource) -> Result<Pid, Code> {
        let image = Arc::new(image);
        let mem = TaskMemory::new(image.clone(), self.cfg.default_stack);
        let window = self.regs.alloc();
        self.regs.set_pc_of(&window, image.header().entry);
        self.regs.set_sp_of(&window, mem.stack_top());

        let mut task = Task::new(pid, image.clone(), mem, window, provenance);

        // Declarative `.mailbox` resources bind before the first
        // instruction runs; any failure unwinds the whole load.
        if let Some(manifest) = image.manifest() {
            for entry in &manifest.mailboxes {
                let mode = match MailboxMode::from_bits(entry.mode_mask.unwrap_or(0)) {
                    Some(m) => m,
                    None => {
                        self.unwind_admit(pid, task);
                        return Err(Code::MailboxCreationFailed);
                    }
                };
                if let Err(status) = self.mailboxes.bind(
                    &mut self.bus,
                    self.clock.now,
                    pid,
                    &entry.target,
                    entry.capacity,
                    mode,
                ) {
                    log::warn!(
                        "load of {pid} failed: mailbox {:?} refused with {status:?}",
                        entry.target
                    );
                    self.unwind_admit(pid, task);
                    return Err(Code::MailboxCreationFailed);
                }
            }
        }

        task.set_healthy(SchedState::Ready);
        self.tasks.insert(pid, task);
        self.publish_task_state(pid, StateKind::Ready, Code::Ok);
        Ok(pid)
    }

    fn unwind_admit(&mut self, pid: Pid, task: Task) {
        self.mailboxes.close_all_for(pid);
        self.regs.release(task.window);
    }

    // ----- Clock and scheduling -----

    pub fn clock_start(&mut self) {
        self.clock.running = true;
    }

    pub fn clock_stop(&mut self) {
        self.clock.running = false;
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock.rate_hz
    }

    pub fn set_clock_rate(&mut self, hz: u32) {
        self.clock.rate_hz = hz;
    }

    pub fn clock_running(&self) -> bool {
        self.clock.running
    }

    /// Advances the clock by `n` ticks, executing at most one instruction
    /// per tick. Idle ticks (no runnable task) still advance time, so
    /// timeouts fire on a quiet system.
    pub fn clock_step(&mut self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Advances until `deadline` (inclusive) or until nothing can run and
    /// no timer is pending, whichever is first.
    pub fn run_until(&mut self, deadline: Timestamp) {
        while self.clock.now < deadline {
            let idle = self.current.is_none()
                && !self.tasks.values().any(|t| t.state.is_runnable())
                && self.timers.is_empty()
                && self.sessions.is_empty();
            if idle {
                break;
            }
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.clock.now = self.clock.now.plus(1);
        self.expire_timers();
        self.reap_sessions();
        self.dispatch();
        if let Some(pid) = self.current {
            self.run_instruction(pid);
            if self.quantum_left > 0 {
                self.quantum_left -= 1;
            }
        }
    }

    /// Chooses the task the next instruction belongs to. Keeps the current
    /// task unless it stopped being runnable, exhausted its quantum, or a
    /// strictly more important task is ready.
    fn dispatch(&mut self) {
        let keep = match self.current {
            Some(pid) => match self.tasks.get(&pid) {
                Some(t) if t.state.is_runnable() => {
                    self.quantum_left > 0
                        && !task::higher_priority_ready(&self.tasks, t.priority)
                }
                _ => false,
            },
            None => false,
        };
        if keep {
            return;
        }

        let prev = self.current;
        if let Some(pid) = prev {
            if let Some(t) = self.tasks.get_mut(&pid) {
                if t.sched_state() == Some(SchedState::Running) {
                    t.set_healthy(SchedState::Ready);
                }
            }
        }

        match task::select_next(&self.tasks, prev) {
            Some(pid) => {
                if prev != Some(pid) {
                    self.counters.context_switches += 1;
                }
                let t = self.tasks.get_mut(&pid).unwrap();
                t.set_healthy(SchedState::Running);
                self.regs.activate(&t.window);
                self.current = Some(pid);
                self.quantum_left = self.cfg.quantum;
            }
            None => {
                self.current = None;
                self.regs.deactivate();
            }
        }
    }

    /// Executes one instruction of `pid`, whose window is active. Handles
    /// breakpoints, traps, and trace bookkeeping.
    fn run_instruction(&mut self, pid: Pid) {
        let pc = self.regs.pc();
        let (bp_hit, opcode) = {
            let t = self.tasks.get(&pid).expect("current task exists");
            let hit = !t.skip_bp_once && t.breakpoints.contains(&pc);
            let opcode = t.image.fetch_word(pc).map(|w| w as u8).unwrap_or(0);
            (hit, opcode)
        };
        if bp_hit {
            self.pause_at_breakpoint(pid, pc, false);
            return;
        }

        let step_result = {
            let t = self.tasks.get_mut(&pid).unwrap();
            t.skip_bp_once = false;
            let image = t.image.clone();
            vm::step(&image, &mut self.regs, &mut t.mem)
        };
        self.counters.step_count += 1;

        // Per-step trace surface, kept fresh whether or not events are on.
        {
            let t = self.tasks.get_mut(&pid).unwrap();
            t.last_pc = pc;
            t.last_opcode = opcode;
            let snap = self.regs.snapshot(&t.window);
            t.last_regs = Some(snap);
            if t.trace {
                self.bus.publish(
                    self.clock.now,
                    Some(pid),
                    EventKind::TraceStep {
                        pc,
                        opcode,
                        regs: snap,
                    },
                );
            }
        }

        match step_result {
            Ok(vm::Step::Normal) => {}
            Ok(vm::Step::Svc) => self.handle_svc(pid),
            Ok(vm::Step::Break) => self.pause_at_breakpoint(pid, pc, true),
            Err(fault) => self.force_fault(pid, fault),
        }
    }

    fn pause_at_breakpoint(&mut self, pid: Pid, pc: u32, from_brk: bool) {
        let t = self.tasks.get_mut(&pid).unwrap();
        t.set_healthy(SchedState::Paused);
        t.paused_in_brk = from_brk;
        self.bus
            .publish(self.clock.now, Some(pid), EventKind::DebugBreak { pc });
        self.publish_task_state(pid, StateKind::Paused, Code::Breakpoint);
        self.drop_current(pid);
    }

    /// Puts a task into a forced fault condition, preserving its PC and
    /// pre-fault state for post-mortem work. R0 carries the fault's status
    /// code, mirroring the in-band SVC convention.
    pub(crate) fn force_fault(&mut self, pid: Pid, fault: FaultInfo) {
        let t = self.tasks.get_mut(&pid).unwrap();
        let original_state = t.sched_state().unwrap_or(SchedState::Stopped);
        t.state = TaskState::Failed {
            fault,
            original_state,
        };
        t.pending_recv = None;
        self.regs.set_gpr_of(&t.window, 0, fault.code() as u32);
        log::warn!("{pid} faulted: {fault:?}");
        self.publish_task_state(pid, StateKind::Failed, fault.code());
        self.drop_current(pid);
    }

    pub(crate) fn drop_current(&mut self, pid: Pid) {
        if self.current == Some(pid) {
            self.current = None;
            self.regs.deactivate();
        }
    }

    pub(crate) fn publish_task_state(&mut self, pid: Pid, state: StateKind, reason: Code) {
        self.bus
            .publish(self.clock.now, Some(pid), EventKind::TaskState { state, reason });
    }

    fn expire_timers(&mut self) {
        while let Some(entry) = self.timers.pop_due(self.clock.now) {
            let Some(t) = self.tasks.get_mut(&entry.pid) else {
                continue;
            };
            match (t.sched_state(), entry.tag) {
                (Some(SchedState::InTimerWait { deadline }), WaitTag::Sleep)
                    if deadline == entry.deadline =>
                {
                    t.set_healthy(SchedState::Ready);
                    self.publish_task_state(entry.pid, StateKind::Ready, Code::Ok);
                }
                (
                    Some(SchedState::InMailboxWait {
                        handle,
                        deadline: Some(deadline),
                    }),
                    WaitTag::Mailbox { handle: h },
                ) if h == handle && deadline == entry.deadline => {
                    self.counters.mailbox_timeout += 1;
                    self.mailboxes.cancel_waiter(handle);
                    let t = self.tasks.get_mut(&entry.pid).unwrap();
                    t.pending_recv = None;
                    self.regs.set_gpr_of(&t.window, 0, 0);
                    self.regs
                        .set_gpr_of(&t.window, 1, Code::Timeout as u32);
                    t.set_healthy(SchedState::Ready);
                    self.bus.publish(
                        self.clock.now,
                        Some(entry.pid),
                        EventKind::MailboxTimeout {
                            handle,
                            status: Code::Timeout,
                        },
                    );
                    self.publish_task_state(entry.pid, StateKind::Ready, Code::Timeout);
                }
                // Stale entry: the wait it belonged to already ended.
                _ => {}
            }
        }
    }

    fn reap_sessions(&mut self) {
        let now = self.clock.now;
        let stalled: Vec<Pid> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(&p, _)| p)
            .collect();
        for pid in stalled {
            log::warn!("stream session for {pid} stalled; aborting");
            self.sessions.remove(&pid);
            self.bus.publish(
                now,
                Some(pid),
                EventKind::ProvisioningAborted {
                    status: Code::Timeout,
                },
            );
        }
    }

    /// Completes receives for waiters a send has readied.
    pub(crate) fn apply_wakers(&mut self, wakers: Vec<Waker>) {
        for w in wakers {
            let Some(t) = self.tasks.get(&w.pid) else {
                continue;
            };
            let waiting_here = matches!(
                t.sched_state(),
                Some(SchedState::InMailboxWait { handle, .. }) if handle == w.handle
            );
            if !waiting_here {
                continue;
            }
            self.counters.mailbox_wake += 1;
            if let Some(descriptor) = self.mailboxes.descriptor_of(w.handle) {
                self.bus.publish(
                    self.clock.now,
                    Some(w.pid),
                    EventKind::MailboxWake {
                        descriptor,
                        handle: w.handle,
                    },
                );
            }
            match self.mailboxes.recv_poll(&mut self.bus, self.clock.now, w.handle) {
                Ok(Some(msg)) => self.finish_recv(w.pid, &msg),
                Ok(None) => {
                    // The message went elsewhere between wake selection and
                    // delivery; with single-threaded wake pairing this is a
                    // bookkeeping bug, not a race.
                    log::warn!("spurious wake for {} on {:?}", w.pid, w.handle);
                    self.complete_recv_status(w.pid, 0, Code::WouldBlock);
                }
                Err(code) => self.complete_recv_status(w.pid, 0, code),
            }
        }
    }

    /// Delivers `msg` into a parked receiver's buffer and makes it READY.
    fn finish_recv(&mut self, pid: Pid, msg: &Message) {
        let t = self.tasks.get_mut(&pid).unwrap();
        let Some(pending) = t.pending_recv.take() else {
            log::warn!("woken receiver {pid} had no pending buffer");
            return;
        };
        let n = msg.bytes.len().min(pending.buf_cap as usize);
        if let Err(fault) = t.mem.write_bytes(pending.buf_ptr, &msg.bytes[..n]) {
            // The task handed us a buffer it cannot back; that's its fault,
            // in both senses.
            self.force_fault(pid, fault);
            return;
        }
        self.complete_recv_status(pid, n as u32, Code::Ok);
    }

    /// Writes a receive outcome into a parked task's registers and readies
    /// it.
    fn complete_recv_status(&mut self, pid: Pid, value: u32, status: Code) {
        let t = self.tasks.get_mut(&pid).unwrap();
        t.pending_recv = None;
        self.regs.set_gpr_of(&t.window, 0, value);
        self.regs.set_gpr_of(&t.window, 1, status as u32);
        t.set_healthy(SchedState::Ready);
        self.publish_task_state(pid, StateKind::Ready, status);
    }

    // ----- Task lifecycle controls -----

    pub fn pause(&mut self, pid: Pid) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        match t.sched_state() {
            Some(SchedState::Ready) | Some(SchedState::Running) => {
                t.set_healthy(SchedState::Paused);
            }
            Some(SchedState::InMailboxWait { handle, .. }) => {
                // Cancel the wait; the interrupted receive reports
                // WouldBlock when the task eventually resumes.
                self.mailboxes.cancel_waiter(handle);
                let t = self.tasks.get_mut(&pid).unwrap();
                t.pending_recv = None;
                self.regs.set_gpr_of(&t.window, 0, 0);
                self.regs
                    .set_gpr_of(&t.window, 1, Code::WouldBlock as u32);
                t.set_healthy(SchedState::Paused);
            }
            Some(SchedState::InTimerWait { .. }) => {
                // The sleep is abandoned; its heap entry dies lazily.
                t.set_healthy(SchedState::Paused);
            }
            _ => return Err(Code::BadState),
        }
        self.publish_task_state(pid, StateKind::Paused, Code::Ok);
        self.drop_current(pid);
        Ok(())
    }

    pub fn resume(&mut self, pid: Pid) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        if t.sched_state() != Some(SchedState::Paused) {
            return Err(Code::BadState);
        }
        if t.paused_in_brk {
            // The BRK was observed, not executed around: move past it now.
            let pc = self.regs.pc_of(&t.window);
            self.regs.set_pc_of(&t.window, pc.wrapping_add(4));
            t.paused_in_brk = false;
        }
        t.skip_bp_once = true;
        t.set_healthy(SchedState::Ready);
        self.publish_task_state(pid, StateKind::Ready, Code::Ok);
        Ok(())
    }

    /// Debugger stepping: executes up to `n` instructions of `pid` while it
    /// stays steppable, returning how many ran. The task ends PAUSED (or
    /// wherever a trap left it); the clock advances one tick per
    /// instruction so timeouts remain coherent.
    pub fn step(&mut self, pid: Pid, n: u32) -> Result<u32, Code> {
        {
            let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
            match t.sched_state() {
                Some(SchedState::Paused) | Some(SchedState::Ready) => {}
                _ => return Err(Code::BadState),
            }
            if t.paused_in_brk {
                let pc = self.regs.pc_of(&t.window);
                self.regs.set_pc_of(&t.window, pc.wrapping_add(4));
                t.paused_in_brk = false;
            }
            t.skip_bp_once = true;
            self.regs.activate(&t.window);
        }

        let mut executed = 0;
        for _ in 0..n {
            let steppable = matches!(
                self.tasks.get(&pid).and_then(|t| t.sched_state()),
                Some(SchedState::Paused) | Some(SchedState::Ready)
            );
            if !steppable {
                break;
            }
            self.clock.now = self.clock.now.plus(1);
            self.expire_timers();
            self.reap_sessions();
            self.run_instruction(pid);
            executed += 1;
        }

        // A task that stepped without trapping parks as PAUSED again.
        if let Some(t) = self.tasks.get_mut(&pid) {
            if matches!(
                t.sched_state(),
                Some(SchedState::Ready) | Some(SchedState::Running)
            ) {
                t.set_healthy(SchedState::Paused);
            }
        }

        // Restore whatever window the scheduler had active.
        match self.current.and_then(|c| self.tasks.get(&c)) {
            Some(t) => self.regs.activate(&t.window),
            None => self.regs.deactivate(),
        }
        Ok(executed)
    }

    /// Destroys a task outright: releases its window and handles, cancels
    /// its timers (lazily), and emits the terminal state event.
    pub fn kill(&mut self, pid: Pid) -> Result<(), Code> {
        if self.sessions.contains_key(&pid) {
            return self.load_stream_abort(pid);
        }
        let task = self.tasks.shift_remove(&pid).ok_or(Code::NotFound)?;
        self.drop_current(pid);
        self.mailboxes.close_all_for(pid);
        self.disasm.invalidate(pid);
        self.regs.release(task.window);
        self.publish_task_state(pid, StateKind::Stopped, Code::Ok);
        Ok(())
    }

    /// Rewinds a STOPPED or FAILED task to its initial state without
    /// re-validating the image. Mailbox handles survive a restart.
    pub fn restart(&mut self, pid: Pid) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        match t.state.kind() {
            StateKind::Stopped | StateKind::Failed => {}
            _ => return Err(Code::BadState),
        }
        t.mem.reset();
        for cell in 0..crate::regfile::WINDOW_CELLS {
            self.regs.set_cell_of(&t.window, cell, 0);
        }
        self.regs.set_pc_of(&t.window, t.image.header().entry);
        self.regs.set_sp_of(&t.window, t.mem.stack_top());
        t.state = TaskState::Healthy(SchedState::Ready);
        t.pending_recv = None;
        t.paused_in_brk = false;
        t.skip_bp_once = false;
        t.last_pc = 0;
        t.last_opcode = 0;
        t.last_regs = None;
        t.exit_code = None;
        self.publish_task_state(pid, StateKind::Ready, Code::Ok);
        Ok(())
    }

    pub fn set_priority(&mut self, pid: Pid, priority: Priority) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        t.priority = priority;
        Ok(())
    }

    pub fn set_policy(&mut self, pid: Pid, policy: MemPolicy) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        t.policy = policy;
        Ok(())
    }

    pub fn exit_code(&self, pid: Pid) -> Option<u32> {
        self.tasks.get(&pid).and_then(|t| t.exit_code)
    }

    pub fn task_state(&self, pid: Pid) -> Option<StateKind> {
        if self.sessions.contains_key(&pid) {
            return Some(StateKind::Loading);
        }
        self.tasks.get(&pid).map(|t| t.state.kind())
    }

    pub fn task_fault(&self, pid: Pid) -> Option<FaultInfo> {
        match self.tasks.get(&pid).map(|t| t.state) {
            Some(TaskState::Failed { fault, .. }) => Some(fault),
            _ => None,
        }
    }

    pub fn ps(&self) -> Vec<TaskInfo> {
        let mut out: Vec<TaskInfo> = self
            .tasks
            .values()
            .map(|t| TaskInfo {
                pid: t.pid,
                state: t.state.kind(),
                priority: t.priority,
                pc: self.regs.pc_of(&t.window),
                last_opcode: t.last_opcode,
                provenance: Some(t.provenance),
                image: Some(t.image.identity()),
            })
            .collect();
        for &pid in self.sessions.keys() {
            out.push(TaskInfo {
                pid,
                state: StateKind::Loading,
                priority: Priority::default(),
                pc: 0,
                last_opcode: 0,
                provenance: None,
                image: None,
            });
        }
        out.sort_by_key(|i| i.pid);
        out
    }

    // ----- Debug surface -----

    pub fn reg_get(&self, pid: Pid, index: usize) -> Result<u32, Code> {
        let t = self.tasks.get(&pid).ok_or(Code::NotFound)?;
        let w = &t.window;
        Ok(match index {
            r if r < isa::REG_COUNT => self.regs.gpr_of(w, r),
            isa::REG_IDX_PC => self.regs.pc_of(w),
            isa::REG_IDX_SP => self.regs.sp_of(w),
            isa::REG_IDX_FP => self.regs.cell_of(w, isa::REG_IDX_FP),
            isa::REG_IDX_PSW => self.regs.psw_of(w).0,
            _ => return Err(Code::NotFound),
        })
    }

    /// Pokes a register. Allowed while the task is paused, stopped,
    /// waiting, or failed; refused mid-run, and gated by the task's policy
    /// bits.
    pub fn reg_set(&mut self, pid: Pid, index: usize, value: u32) -> Result<(), Code> {
        let t = self.tasks.get(&pid).ok_or(Code::NotFound)?;
        let kind = t.state.kind();
        if kind == StateKind::Running {
            return Err(Code::BadState);
        }
        if index == isa::REG_IDX_PC
            && kind == StateKind::Stopped
            && t.policy.contains(MemPolicy::DENY_PC_WRITE_STOPPED)
        {
            return Err(Code::BadState);
        }
        let w = &t.window;
        match index {
            r if r < isa::REG_COUNT => self.regs.set_gpr_of(w, r, value),
            isa::REG_IDX_PC | isa::REG_IDX_SP | isa::REG_IDX_FP | isa::REG_IDX_PSW => {
                self.regs.set_cell_of(w, index, value)
            }
            _ => return Err(Code::NotFound),
        }
        Ok(())
    }

    pub fn snapshot(&self, pid: Pid) -> Result<RegSnapshot, Code> {
        let t = self.tasks.get(&pid).ok_or(Code::NotFound)?;
        Ok(self.regs.snapshot(&t.window))
    }

    pub fn mem_read(&self, pid: Pid, addr: u32, len: u32) -> Result<Vec<u8>, Code> {
        let t = self.tasks.get(&pid).ok_or(Code::NotFound)?;
        t.mem.read_bytes(addr, len).map_err(|f| f.code())
    }

    pub fn mem_write(&mut self, pid: Pid, addr: u32, bytes: &[u8]) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        if t.state.kind() == StateKind::Running
            && t.policy.contains(MemPolicy::DENY_MEM_WRITE_RUNNING)
        {
            return Err(Code::BadState);
        }
        t.mem.write_bytes(addr, bytes).map_err(|f| f.code())
    }

    pub fn bp_set(&mut self, pid: Pid, addr: u32) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        t.breakpoints.insert(addr);
        Ok(())
    }

    pub fn bp_clear(&mut self, pid: Pid, addr: u32) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        if t.breakpoints.remove(&addr) {
            Ok(())
        } else {
            Err(Code::NotFound)
        }
    }

    pub fn bp_list(&self, pid: Pid) -> Result<Vec<u32>, Code> {
        let t = self.tasks.get(&pid).ok_or(Code::NotFound)?;
        Ok(t.breakpoints.iter().copied().collect())
    }

    pub fn trace_enable(&mut self, pid: Pid, on: bool) -> Result<(), Code> {
        let t = self.tasks.get_mut(&pid).ok_or(Code::NotFound)?;
        t.trace = on;
        Ok(())
    }

    pub fn last_pc(&self, pid: Pid) -> Option<u32> {
        self.tasks.get(&pid).map(|t| t.last_pc)
    }

    pub fn last_opcode(&self, pid: Pid) -> Option<u8> {
        self.tasks.get(&pid).map(|t| t.last_opcode)
    }

    pub fn last_regs(&self, pid: Pid) -> Option<RegSnapshot> {
        self.tasks.get(&pid).and_then(|t| t.last_regs)
    }

    /// Disassembles from the immutable code image. With `AroundPc` and no
    /// explicit anchor, the window centers on the task's current PC.
    pub fn disasm_read(
        &mut self,
        pid: Pid,
        anchor: Option<u32>,
        count: usize,
        mode: DisasmMode,
    ) -> Result<Vec<DisasmLine>, Code> {
        let t = self.tasks.get(&pid).ok_or(Code::NotFound)?;
        let anchor = anchor.unwrap_or_else(|| self.regs.pc_of(&t.window));
        Ok(self.disasm.read(pid, &t.image, anchor, count, mode))
    }

    // ----- Events -----

    pub fn events_subscribe(&mut self, filter: EventFilter, backlog: Option<usize>) -> SubId {
        self.bus.subscribe(filter, backlog)
    }

    pub fn events_poll(&mut self, id: SubId, max: usize) -> Vec<hsx_abi::Event> {
        self.bus.poll(id, max)
    }

    pub fn events_ack(&mut self, id: SubId, seq: u64) {
        self.bus.ack(id, seq);
    }

    pub fn events_unsubscribe(&mut self, id: SubId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ----- Host mailbox access (drivers and tests) -----

    pub fn mailbox_bind(
        &mut self,
        target: &str,
        capacity: Option<u32>,
        mode: MailboxMode,
    ) -> Result<HandleId, Code> {
        self.mailboxes
            .bind(&mut self.bus, self.clock.now, HOST_PID, target, capacity, mode)
    }

    pub fn mailbox_open(&mut self, target: &str, flags: OpenFlags) -> Result<HandleId, Code> {
        self.mailboxes.open(HOST_PID, target, flags)
    }

    pub fn mailbox_tap(&mut self, target: &str, buffer_hint: Option<u32>) -> Result<HandleId, Code> {
        self.mailboxes.tap(HOST_PID, target, buffer_hint)
    }

    /// Host-side send; wakes any parked receivers before returning.
    pub fn mailbox_send(&mut self, handle: HandleId, bytes: Vec<u8>) -> Code {
        let out = self
            .mailboxes
            .send(&mut self.bus, self.clock.now, handle, bytes, None);
        self.apply_wakers(out.wakers);
        out.status
    }

    /// Host-side non-blocking receive (the host has no task to park).
    pub fn mailbox_recv(&mut self, handle: HandleId) -> Result<Option<Message>, Code> {
        self.mailboxes
            .recv_poll(&mut self.bus, self.clock.now, handle)
    }

    pub fn mailbox_peek(&self, handle: HandleId) -> Result<Option<Message>, Code> {
        self.mailboxes.peek(handle)
    }

    pub fn mailbox_close(&mut self, handle: HandleId) -> Code {
        self.mailboxes.close(handle)
    }

    pub fn mailbox_snapshot(&self) -> ResourceStats {
        self.mailboxes.resource_stats()
    }

    /// Alias for [`Self::mailbox_snapshot`] under its diagnostic name.
    pub fn resource_stats(&self) -> ResourceStats {
        self.mailboxes.resource_stats()
    }

    // ----- Services -----

    /// Registers an external service module (the driver hook). The built-in
    /// and reserved modules (Task, Memory, Timer, Mailbox) are refused.
    pub fn register_service(
        &mut self,
        module: u32,
        service: Box<dyn crate::svc::Service>,
    ) -> Result<(), Code> {
        if matches!(module, 0x00 | 0x01 | 0x04 | 0x05) {
            return Err(Code::Busy);
        }
        if self.services.contains_key(&module) {
            return Err(Code::Busy);
        }
        self.services.insert(module, service);
        Ok(())
    }
}
