// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A `Task` owns everything private to one program: its validated code
//! image, its data arenas, its register window, its breakpoints, and its
//! scheduling state. The executive's task table is the only owner of `Task`
//! values; everything else refers to tasks by pid.

use std::collections::BTreeSet;
use std::sync::Arc;

use hsx_abi::{
    HandleId, MemPolicy, Pid, Priority, RegSnapshot, SchedState, TaskState,
};
use indexmap::IndexMap;

use crate::image::CodeImage;
use crate::mem::TaskMemory;
use crate::regfile::Window;

/// Where a task's image came from, kept for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadSource {
    Monolithic,
    Streamed,
}

/// Saved arguments of a receive that parked its caller; consumed when the
/// wait ends (message, timeout, or cancellation).
#[derive(Copy, Clone, Debug)]
pub(crate) struct PendingRecv {
    pub handle: HandleId,
    pub buf_ptr: u32,
    pub buf_cap: u32,
}

#[derive(Debug)]
pub struct Task {
    pub(crate) pid: Pid,
    pub(crate) priority: Priority,
    pub(crate) policy: MemPolicy,
    pub(crate) state: TaskState,
    pub(crate) window: Window,
    pub(crate) image: Arc<CodeImage>,
    pub(crate) mem: TaskMemory,
    pub(crate) provenance: LoadSource,
    pub(crate) breakpoints: BTreeSet<u32>,
    pub(crate) trace: bool,
    /// One-shot breakpoint exemption, set on resume/step so the task can
    /// leave a breakpoint it is paused on.
    pub(crate) skip_bp_once: bool,
    /// The task is paused on a `BRK` instruction; resume must advance the
    /// PC past it.
    pub(crate) paused_in_brk: bool,
    pub(crate) last_pc: u32,
    pub(crate) last_opcode: u8,
    pub(crate) last_regs: Option<RegSnapshot>,
    pub(crate) pending_recv: Option<PendingRecv>,
    pub(crate) exit_code: Option<u32>,
}

impl Task {
    pub(crate) fn new(
        pid: Pid,
        image: Arc<CodeImage>,
        mem: TaskMemory,
        window: Window,
        provenance: LoadSource,
    ) -> Self {
        Self {
            pid,
            priority: Priority::default(),
            policy: MemPolicy::default(),
            state: TaskState::Healthy(SchedState::Ready),
            window,
            image,
            mem,
            provenance,
            breakpoints: BTreeSet::new(),
            trace: false,
            skip_bp_once: false,
            paused_in_brk: false,
            last_pc: 0,
            last_opcode: 0,
            last_regs: None,
            pending_recv: None,
            exit_code: None,
        }
    }

    /// Alters this task's state from one healthy state to another.
    ///
    /// To record a fault, the executive uses its `force_fault`, which
    /// preserves the pre-fault state; the only way out of `Failed` is a
    /// restart, which rebuilds the state wholesale.
    ///
    /// # Panics
    ///
    /// If used to move a failed task, which would lose the fault record.
    pub(crate) fn set_healthy(&mut self, s: SchedState) {
        let last = core::mem::replace(&mut self.state, s.into());
        if let TaskState::Failed { .. } = last {
            panic!("attempted healthy transition out of a fault");
        }
    }

    pub(crate) fn sched_state(&self) -> Option<SchedState> {
        match self.state {
            TaskState::Healthy(s) => Some(s),
            _ => None,
        }
    }
}

/// Scans `tasks` for the next task to run after `previous`, mod table
/// order. The most important runnable task wins; among equals, the first in
/// cyclic order after `previous`. Returns `None` when nothing is runnable
/// (the clock idles).
pub(crate) fn select_next(tasks: &IndexMap<Pid, Task>, previous: Option<Pid>) -> Option<Pid> {
    let n = tasks.len();
    if n == 0 {
        return None;
    }
    let start = previous
        .and_then(|p| tasks.get_index_of(&p))
        .map(|i| (i + 1) % n)
        .unwrap_or(0);

    let mut choice: Option<(Pid, Priority)> = None;
    for k in 0..n {
        let (pid, task) = tasks.get_index((start + k) % n).unwrap();
        if !task.state.is_runnable() {
            continue;
        }
        if let Some((_, prio)) = choice {
            if !task.priority.is_more_important_than(prio) {
                continue;
            }
        }
        choice = Some((*pid, task.priority));
    }
    choice.map(|(pid, _)| pid)
}

/// True when some runnable task is strictly more important than `prio`;
/// drives boundary preemption of the current task.
pub(crate) fn higher_priority_ready(tasks: &IndexMap<Pid, Task>, prio: Priority) -> bool {
    tasks
        .values()
        .any(|t| t.state.is_runnable() && t.priority.is_more_important_than(prio))
}
