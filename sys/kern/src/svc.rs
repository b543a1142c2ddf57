// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Service-call dispatch.
//!
//! An `SVC` trap carries its module id in R6 and function id in R7, with
//! arguments in R0..R3. Results go back as a value in R0 and a status code
//! in R1 -- one convention for every module, built-in or external.
//!
//! With a couple of exceptions, built-in functions are implemented by
//! methods with the shape:
//!
//! ```ignore
//! fn svc_xxx(&mut self, pid: Pid, func: u32, args: [u32; 4])
//!     -> Result<SvcDone, SvcError>;
//! ```
//!
//! A `SvcDone::Result` is written into the caller's registers by the common
//! wrapper; `Parked` and `Stopped` mean the handler already moved the task
//! out of RUNNING and results (if any) will be delivered at wake.
//! `SvcError::Recoverable` becomes a status in R1; `SvcError::Fatal` faults
//! the task. Unknown modules and functions report `ENOSYS`, except for the
//! explicitly reserved Memory module, whose semantics are deliberately left
//! undefined and therefore also report `ENOSYS`.
//!
//! External modules (String, Math, Value, Command, and anything
//! vendor-specific) attach through the [`Service`] trait; that is the hook
//! hardware drivers plug into.

use core::convert::TryFrom;

use hsx_abi::{
    isa, Code, HandleId, MailboxFn, MailboxMode, OpenFlags, Pid, SchedState, StateKind,
    SvcModule, TaskFn, TimerFn, UsageError,
};

use crate::err::SvcError;
use crate::exec::Executive;
use crate::mem::TaskMemory;
use crate::task::PendingRecv;
use crate::time::WaitTag;

/// An externally registered service module.
///
/// The engine marshals the designated registers and hands the handler
/// validated access to the calling task's memory; the handler returns the
/// value/status pair for R0/R1.
pub trait Service {
    fn call(&mut self, cx: SvcContext<'_>) -> (u32, Code);
}

/// What an external service sees of one call.
pub struct SvcContext<'a> {
    pub pid: Pid,
    pub func: u32,
    pub args: [u32; 4],
    pub mem: &'a mut TaskMemory,
}

/// How a built-in handler concluded.
pub(crate) enum SvcDone {
    /// Write `value` to R0 and `status` to R1; the task keeps running.
    Result { value: u32, status: Code },
    /// The task was parked (wait state); results arrive at wake.
    Parked,
    /// The task reached a terminal state.
    Stopped,
}

fn ok(value: u32) -> Result<SvcDone, SvcError> {
    Ok(SvcDone::Result {
        value,
        status: Code::Ok,
    })
}

impl Executive {
    /// Entry point from the decoder's `SvcRequested` trap. The caller's
    /// window is active and its PC is already past the SVC.
    pub(crate) fn handle_svc(&mut self, pid: Pid) {
        let module = self.regs.gpr(isa::REG_SVC_MODULE);
        let func = self.regs.gpr(isa::REG_SVC_FN);
        let args = [
            self.regs.gpr(0),
            self.regs.gpr(1),
            self.regs.gpr(2),
            self.regs.gpr(3),
        ];

        let result = match SvcModule::try_from(module) {
            Ok(SvcModule::Task) => self.svc_task(pid, func, args),
            Ok(SvcModule::Timer) => self.svc_timer(pid, func, args),
            Ok(SvcModule::Mailbox) => {
                self.counters.mailbox_step += 1;
                self.svc_mailbox(pid, func, args)
            }
            // Reserved: heap semantics are deliberately not defined.
            Ok(SvcModule::Memory) => Err(SvcError::Recoverable(Code::Enosys)),
            Ok(_) => self.svc_external(pid, module, func, args),
            Err(()) => Err(SvcError::Recoverable(Code::Enosys)),
        };

        match result {
            Ok(SvcDone::Result { value, status }) => {
                self.regs.set_gpr(0, value);
                self.regs.set_gpr(1, status as u32);
            }
            Ok(SvcDone::Parked) | Ok(SvcDone::Stopped) => {}
            Err(SvcError::Recoverable(status)) => {
                self.regs.set_gpr(0, 0);
                self.regs.set_gpr(1, status as u32);
            }
            Err(SvcError::Fatal(fault)) => self.force_fault(pid, fault),
        }
    }

    fn svc_task(&mut self, pid: Pid, func: u32, args: [u32; 4]) -> Result<SvcDone, SvcError> {
        match TaskFn::try_from(func).map_err(|()| SvcError::Recoverable(Code::Enosys))? {
            TaskFn::Exit => {
                let t = self.tasks.get_mut(&pid).unwrap();
                t.exit_code = Some(args[0]);
                t.set_healthy(SchedState::Stopped);
                self.publish_task_state(pid, StateKind::Stopped, Code::Ok);
                self.drop_current(pid);
                Ok(SvcDone::Stopped)
            }
            TaskFn::Yield => {
                self.quantum_left = 0;
                ok(0)
            }
            TaskFn::CurrentPid => ok(pid.0),
        }
    }

    fn svc_timer(&mut self, pid: Pid, func: u32, args: [u32; 4]) -> Result<SvcDone, SvcError> {
        match TimerFn::try_from(func).map_err(|()| SvcError::Recoverable(Code::Enosys))? {
            TimerFn::Sleep => {
                let ticks = u64::from(args[0]);
                if ticks == 0 {
                    return ok(0);
                }
                let deadline = self.clock.now.plus(ticks);
                // Results for the resumed task are fixed now; the wake path
                // only flips the state back.
                self.regs.set_gpr(0, 0);
                self.regs.set_gpr(1, Code::Ok as u32);
                let t = self.tasks.get_mut(&pid).unwrap();
                t.set_healthy(SchedState::InTimerWait { deadline });
                self.timers.insert(deadline, pid, WaitTag::Sleep);
                self.publish_task_state(pid, StateKind::WaitTimer, Code::Ok);
                self.drop_current(pid);
                Ok(SvcDone::Parked)
            }
            TimerFn::Ticks => {
                let now = u64::from(self.clock.now);
                // Low half in R0, high half in R2.
                self.regs.set_gpr(2, (now >> 32) as u32);
                ok(now as u32)
            }
        }
    }

    fn svc_mailbox(&mut self, pid: Pid, func: u32, args: [u32; 4]) -> Result<SvcDone, SvcError> {
        let func = MailboxFn::try_from(func).map_err(|()| SvcError::Recoverable(Code::Enosys))?;
        match func {
            MailboxFn::Bind => {
                let target = self.read_name(pid, args[0], args[1])?;
                let capacity = if args[2] == 0 { None } else { Some(args[2]) };
                let mode =
                    MailboxMode::from_bits(args[3]).ok_or(SvcError::Recoverable(Code::BadState))?;
                let handle = self.mailboxes.bind(
                    &mut self.bus,
                    self.clock.now,
                    pid,
                    &target,
                    capacity,
                    mode,
                )?;
                ok(handle.0)
            }
            MailboxFn::Open => {
                let target = self.read_name(pid, args[0], args[1])?;
                let flags =
                    OpenFlags::from_bits(args[2]).ok_or(SvcError::Recoverable(Code::BadState))?;
                let handle = self.mailboxes.open(pid, &target, flags)?;
                ok(handle.0)
            }
            MailboxFn::Tap => {
                let target = self.read_name(pid, args[0], args[1])?;
                let hint = if args[2] == 0 { None } else { Some(args[2]) };
                let handle = self.mailboxes.tap(pid, &target, hint)?;
                ok(handle.0)
            }
            MailboxFn::Send => {
                let handle = self.own_handle(pid, args[0])?;
                let bytes = {
                    let t = self.tasks.get(&pid).unwrap();
                    t.mem
                        .read_bytes(args[1], args[2])
                        .map_err(|_| UsageError::InvalidSlice)?
                };
                let out = self
                    .mailboxes
                    .send(&mut self.bus, self.clock.now, handle, bytes, Some(pid));
                self.apply_wakers(out.wakers);
                Ok(SvcDone::Result {
                    value: out.seq as u32,
                    status: out.status,
                })
            }
            MailboxFn::Recv => {
                let handle = self.own_handle(pid, args[0])?;
                let (buf_ptr, buf_cap) = (args[1], args[2]);
                let timeout = args[3] as i32;
                if let Some(msg) =
                    self.mailboxes
                        .recv_poll(&mut self.bus, self.clock.now, handle)?
                {
                    let n = msg.bytes.len().min(buf_cap as usize);
                    let t = self.tasks.get_mut(&pid).unwrap();
                    t.mem
                        .write_bytes(buf_ptr, &msg.bytes[..n])
                        .map_err(|_| UsageError::InvalidSlice)?;
                    return ok(n as u32);
                }
                if timeout == 0 {
                    return Err(SvcError::Recoverable(Code::WouldBlock));
                }
                let deadline = if timeout < 0 {
                    None
                } else {
                    Some(self.clock.now.plus(timeout as u64))
                };
                let t = self.tasks.get_mut(&pid).unwrap();
                t.pending_recv = Some(PendingRecv {
                    handle,
                    buf_ptr,
                    buf_cap,
                });
                t.set_healthy(SchedState::InMailboxWait { handle, deadline });
                self.mailboxes
                    .enqueue_waiter(&mut self.bus, self.clock.now, handle);
                if let Some(d) = deadline {
                    self.timers.insert(d, pid, WaitTag::Mailbox { handle });
                }
                self.publish_task_state(pid, StateKind::WaitMbx, Code::Ok);
                self.drop_current(pid);
                Ok(SvcDone::Parked)
            }
            MailboxFn::Peek => {
                let handle = self.own_handle(pid, args[0])?;
                match self.mailboxes.peek(handle)? {
                    Some(msg) => ok(msg.bytes.len() as u32),
                    None => Err(SvcError::Recoverable(Code::WouldBlock)),
                }
            }
            MailboxFn::Close => {
                let handle = self.own_handle(pid, args[0])?;
                match self.mailboxes.close(handle) {
                    Code::Ok => ok(0),
                    status => Err(SvcError::Recoverable(status)),
                }
            }
        }
    }

    fn svc_external(
        &mut self,
        pid: Pid,
        module: u32,
        func: u32,
        args: [u32; 4],
    ) -> Result<SvcDone, SvcError> {
        let Some(service) = self.services.get_mut(&module) else {
            return Err(SvcError::Recoverable(Code::Enosys));
        };
        let t = self.tasks.get_mut(&pid).unwrap();
        let (value, status) = service.call(SvcContext {
            pid,
            func,
            args,
            mem: &mut t.mem,
        });
        Ok(SvcDone::Result { value, status })
    }

    /// Reads a UTF-8 name argument out of the caller's memory. A bad slice
    /// or bad encoding is a malfunction, not a recoverable status.
    fn read_name(&self, pid: Pid, ptr: u32, len: u32) -> Result<String, SvcError> {
        let t = self.tasks.get(&pid).unwrap();
        let bytes = t
            .mem
            .read_bytes(ptr, len)
            .map_err(|_| UsageError::InvalidSlice)?;
        String::from_utf8(bytes).map_err(|_| UsageError::BadName.into())
    }

    /// Resolves a handle argument, refusing handles that belong to someone
    /// else: a handle id is a capability only in its owner's hands.
    fn own_handle(&self, pid: Pid, raw: u32) -> Result<HandleId, SvcError> {
        let handle = HandleId(raw);
        match self.mailboxes.handle_owner(handle) {
            Some(owner) if owner == pid => Ok(handle),
            _ => Err(SvcError::Recoverable(Code::BadHandle)),
        }
    }
}
