// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HSX runtime ABI definitions, shared between the engine and its clients.
//!
//! Everything a debugger front-end, an assembler, or a driver crate needs to
//! interoperate with the executive lives here: pids and priorities, the task
//! state machine, fault records, the status-code taxonomy, the processor
//! status word, the instruction set (see [`isa`]), the HXE image header and
//! manifest, service-call numbering, and the event vocabulary.
//!
//! The engine itself lives in `hsx-kern`; this crate deliberately contains no
//! behavior beyond encoding, decoding, and small classification helpers, so
//! that tools can depend on it without pulling in the runtime.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

pub mod isa;

/// Names a task for its entire life. Pids are handed out by the executive in
/// increasing order and are never reused, so a stale pid held by a debugger
/// can only ever name the task it was issued for (or nothing).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers; numerically *higher* priorities are more
/// important and preempt equal-or-lower ones at quantum boundaries.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means more important or
/// less important.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Engine timestamp, measured in clock ticks. One tick is one instruction
/// step; hosts that want wall-clock pacing map ticks to time outside the
/// engine.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Returns the deadline `ticks` after `self`, saturating at the end of
    /// time rather than wrapping.
    pub fn plus(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// A per-task view onto a mailbox descriptor. Handles are issued by the
/// mailbox manager and are only meaningful to the task (or host client) they
/// were issued to.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct HandleId(pub u32);

/// The uniform status-code taxonomy. Every public engine operation reports
/// failure through one of these, and SVC callers receive the same values in
/// R1; no error crosses a component boundary as anything else.
///
/// The numeric values are ABI: they are grouped by family (format, resource,
/// lifecycle, runtime, IPC, dispatch) with room left in each family.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Code {
    Ok = 0,

    // Image format.
    BadMagic = 0x10,
    BadVersion = 0x11,
    BadCrc = 0x12,
    Truncated = 0x13,
    ManifestInvalid = 0x14,
    CapsUnsupported = 0x15,
    MailboxCreationFailed = 0x16,

    // Resource exhaustion.
    NoSpace = 0x20,
    NoDescriptor = 0x21,
    Quota = 0x22,
    SessionOverflow = 0x23,

    // Lifecycle.
    NotFound = 0x30,
    Busy = 0x31,
    BadState = 0x32,

    // Runtime traps.
    IllegalOpcode = 0x40,
    MemoryFault = 0x41,
    DivZero = 0x42,
    IntOverflow = 0x43,
    Breakpoint = 0x44,

    // IPC.
    BadHandle = 0x50,
    WouldBlock = 0x51,
    Timeout = 0x52,
    Overrun = 0x53,

    // Dispatch.
    Enosys = 0x60,
}

impl Code {
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl From<Code> for u32 {
    fn from(c: Code) -> u32 {
        c as u32
    }
}

impl core::convert::TryFrom<u32> for Code {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Ok),
            0x10 => Ok(Self::BadMagic),
            0x11 => Ok(Self::BadVersion),
            0x12 => Ok(Self::BadCrc),
            0x13 => Ok(Self::Truncated),
            0x14 => Ok(Self::ManifestInvalid),
            0x15 => Ok(Self::CapsUnsupported),
            0x16 => Ok(Self::MailboxCreationFailed),
            0x20 => Ok(Self::NoSpace),
            0x21 => Ok(Self::NoDescriptor),
            0x22 => Ok(Self::Quota),
            0x23 => Ok(Self::SessionOverflow),
            0x30 => Ok(Self::NotFound),
            0x31 => Ok(Self::Busy),
            0x32 => Ok(Self::BadState),
            0x40 => Ok(Self::IllegalOpcode),
            0x41 => Ok(Self::MemoryFault),
            0x42 => Ok(Self::DivZero),
            0x43 => Ok(Self::IntOverflow),
            0x44 => Ok(Self::Breakpoint),
            0x50 => Ok(Self::BadHandle),
            0x51 => Ok(Self::WouldBlock),
            0x52 => Ok(Self::Timeout),
            0x53 => Ok(Self::Overrun),
            0x60 => Ok(Self::Enosys),
            _ => Err(()),
        }
    }
}

/// The processor status word.
///
/// Bits 0..=3 are the architectural flags Z, C, N, V. All remaining bits are
/// reserved for extension and must be preserved bitwise by every instruction
/// that does not explicitly set them; the flag setters here only touch their
/// own bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Psw(pub u32);

impl Psw {
    pub const Z: u32 = 1 << 0;
    pub const C: u32 = 1 << 1;
    pub const N: u32 = 1 << 2;
    pub const V: u32 = 1 << 3;

    pub fn z(self) -> bool {
        self.0 & Self::Z != 0
    }

    pub fn c(self) -> bool {
        self.0 & Self::C != 0
    }

    pub fn n(self) -> bool {
        self.0 & Self::N != 0
    }

    pub fn v(self) -> bool {
        self.0 & Self::V != 0
    }

    pub fn set_z(&mut self, on: bool) {
        self.set_bit(Self::Z, on);
    }

    pub fn set_c(&mut self, on: bool) {
        self.set_bit(Self::C, on);
    }

    pub fn set_n(&mut self, on: bool) {
        self.set_bit(Self::N, on);
    }

    pub fn set_v(&mut self, on: bool) {
        self.set_bit(Self::V, on);
    }

    /// Sets Z and N from a 32-bit result, leaving C and V alone.
    pub fn set_nz(&mut self, result: u32) {
        self.set_z(result == 0);
        self.set_n(result & 0x8000_0000 != 0);
    }

    fn set_bit(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// State used to make status and scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// The task's image is still arriving (a streaming load session is open
    /// for this pid). Not schedulable.
    Loading,
    /// Task is healthy and can be scheduled subject to the `SchedState`
    /// requirements.
    Healthy(SchedState),
    /// Task has been stopped by a fault and must not be scheduled without
    /// intervention. The PC at the faulting instruction is preserved in the
    /// register window for post-mortem inspection.
    Failed {
        /// Information about the fault.
        fault: FaultInfo,
        /// Record of the previous healthy state at the time the fault was
        /// taken.
        original_state: SchedState,
    },
}

impl TaskState {
    /// Projects the full state machine onto the eight canonical lifecycle
    /// names used on the control surface.
    pub fn kind(&self) -> StateKind {
        match self {
            TaskState::Loading => StateKind::Loading,
            TaskState::Healthy(SchedState::Ready) => StateKind::Ready,
            TaskState::Healthy(SchedState::Running) => StateKind::Running,
            TaskState::Healthy(SchedState::Paused) => StateKind::Paused,
            TaskState::Healthy(SchedState::InMailboxWait { .. }) => StateKind::WaitMbx,
            TaskState::Healthy(SchedState::InTimerWait { .. }) => StateKind::WaitTimer,
            TaskState::Healthy(SchedState::Stopped) => StateKind::Stopped,
            TaskState::Failed { .. } => StateKind::Failed,
        }
    }

    /// Checks if this task is in a potentially schedulable state.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            TaskState::Healthy(SchedState::Ready) | TaskState::Healthy(SchedState::Running)
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Healthy(SchedState::Stopped)
    }
}

impl From<SchedState> for TaskState {
    fn from(s: SchedState) -> Self {
        Self::Healthy(s)
    }
}

/// Scheduler parameters for a healthy task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SchedState {
    /// This task is ignored for scheduling purposes (terminal exit, or never
    /// started).
    Stopped,
    /// This task could be dispatched onto the CPU.
    Ready,
    /// This task is the one currently consuming instruction steps.
    Running,
    /// This task has been halted by BRK, a breakpoint, or an explicit pause,
    /// and resumes only on request.
    Paused,
    /// This task is blocked in a mailbox receive, with an optional wake
    /// deadline on the timer heap.
    InMailboxWait {
        handle: HandleId,
        deadline: Option<Timestamp>,
    },
    /// This task is sleeping until the deadline.
    InTimerWait { deadline: Timestamp },
}

/// The eight canonical lifecycle states reported by `ps()` and carried on
/// `task_state` events.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Loading,
    Ready,
    Running,
    Paused,
    WaitMbx,
    WaitTimer,
    Stopped,
    Failed,
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// The task touched an address outside its mapped arenas, violated an
    /// alignment rule, or asked the executive to do so on its behalf.
    MemoryAccess {
        /// Problematic address, when one can be named precisely.
        address: Option<u32>,
    },
    /// Execution reached an unassigned or disabled opcode.
    IllegalOpcode { opcode: u8 },
    /// Division by zero.
    DivideByZero,
    /// `INT_MIN / -1`, whose quotient is unrepresentable.
    IntegerOverflow,
    /// Arguments passed to an SVC were invalid.
    SvcUsage(UsageError),
}

impl FaultInfo {
    /// The status code reported for this fault, both in R0 of the faulted
    /// task and on the terminal `task_state` event.
    pub fn code(&self) -> Code {
        match self {
            FaultInfo::MemoryAccess { .. } => Code::MemoryFault,
            FaultInfo::IllegalOpcode { .. } => Code::IllegalOpcode,
            FaultInfo::DivideByZero => Code::DivZero,
            FaultInfo::IntegerOverflow => Code::IntOverflow,
            FaultInfo::SvcUsage(_) => Code::MemoryFault,
        }
    }
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SvcUsage(e)
    }
}

/// An engine-defined fault arising from how a task used an SVC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    /// A slice argument (pointer + length) wraps the address space or lies
    /// outside the task's arenas.
    InvalidSlice,
    /// A name argument is not valid UTF-8.
    BadName,
}

bitflags::bitflags! {
    /// Capabilities an image may require and a runtime may grant. An image
    /// whose required set is not a subset of the runtime's is rejected at
    /// load with `CapsUnsupported`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct CapFlags: u32 {
        const MAILBOX = 1 << 0;
        const TIMER = 1 << 1;
        const FS = 1 << 2;
        const CAN = 1 << 3;
        const UART = 1 << 4;
        const GPIO = 1 << 5;

        const RESERVED = !((1 << 6) - 1);
    }
}

bitflags::bitflags! {
    /// Delivery-mode mask of a mailbox descriptor. An empty mask is a plain
    /// single-reader FIFO.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct MailboxMode: u32 {
        /// Retain each message until every registered reader has
        /// acknowledged it.
        const FAN_OUT = 1 << 0;
        /// Descriptor admits tap observers.
        const TAP = 1 << 1;
        /// Single-reader overflow policy: drop the oldest queued message
        /// instead of failing the send.
        const DROP_OLDEST = 1 << 2;

        const RESERVED = !((1 << 3) - 1);
    }
}

bitflags::bitflags! {
    /// Flags passed to `open()` describing the kind of handle wanted.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct OpenFlags: u32 {
        const READER = 1 << 0;
        const TAP = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Per-task debug-access policy. All bits clear is the permissive
    /// default. Bits 2..=31 are reserved: they are accepted and preserved
    /// but never interpreted.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct MemPolicy: u32 {
        /// Refuse `reg_set` of the PC while the task is STOPPED.
        const DENY_PC_WRITE_STOPPED = 1 << 0;
        /// Refuse `mem_write` while the task is RUNNING.
        const DENY_MEM_WRITE_RUNNING = 1 << 1;

        const RESERVED = !((1 << 2) - 1);
    }
}

/// Magic at offset 0 of every HXE image.
pub const HXE_MAGIC: [u8; 4] = *b"HSXE";

/// Size of the fixed HXE header, in bytes.
pub const HXE_HEADER_LEN: usize = 32;

/// The CRC32 stored in the header covers header bytes `0x00..0x18`
/// concatenated with the code and rodata sections (never the manifest).
pub const HXE_CRC_PREFIX_LEN: usize = 0x18;

/// The header version this runtime produces and accepts.
pub const HXE_VERSION: u16 = 1;

/// Parsed form of the 32-byte little-endian HXE header.
///
/// | Offset | Size | Field                      |
/// |--------|------|----------------------------|
/// | 0x00   | 4    | Magic `HSXE`               |
/// | 0x04   | 2    | Version                    |
/// | 0x06   | 2    | Flags                      |
/// | 0x08   | 4    | Entry PC                   |
/// | 0x0C   | 4    | Code length                |
/// | 0x10   | 4    | Rodata length              |
/// | 0x14   | 4    | BSS size                   |
/// | 0x18   | 4    | Required capability bitset |
/// | 0x1C   | 4    | CRC32                      |
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HxeHeader {
    pub version: u16,
    pub flags: u16,
    pub entry: u32,
    pub code_len: u32,
    pub rodata_len: u32,
    pub bss_len: u32,
    pub caps: CapFlags,
    pub crc: u32,
}

impl HxeHeader {
    /// Parses the fixed header from the front of `bytes`, checking only the
    /// structural properties (length and magic). Version, capability, and
    /// CRC validation are the loader's job, because their outcomes depend on
    /// runtime configuration and on the rest of the image.
    pub fn parse(bytes: &[u8]) -> Result<Self, Code> {
        if bytes.len() < HXE_HEADER_LEN {
            return Err(Code::Truncated);
        }
        if bytes[0..4] != HXE_MAGIC {
            return Err(Code::BadMagic);
        }
        Ok(Self {
            version: LittleEndian::read_u16(&bytes[0x04..]),
            flags: LittleEndian::read_u16(&bytes[0x06..]),
            entry: LittleEndian::read_u32(&bytes[0x08..]),
            code_len: LittleEndian::read_u32(&bytes[0x0C..]),
            rodata_len: LittleEndian::read_u32(&bytes[0x10..]),
            bss_len: LittleEndian::read_u32(&bytes[0x14..]),
            caps: CapFlags::from_bits_retain(LittleEndian::read_u32(&bytes[0x18..])),
            crc: LittleEndian::read_u32(&bytes[0x1C..]),
        })
    }

    /// Appends the 32-byte encoding of this header to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; HXE_HEADER_LEN];
        buf[0..4].copy_from_slice(&HXE_MAGIC);
        LittleEndian::write_u16(&mut buf[0x04..], self.version);
        LittleEndian::write_u16(&mut buf[0x06..], self.flags);
        LittleEndian::write_u32(&mut buf[0x08..], self.entry);
        LittleEndian::write_u32(&mut buf[0x0C..], self.code_len);
        LittleEndian::write_u32(&mut buf[0x10..], self.rodata_len);
        LittleEndian::write_u32(&mut buf[0x14..], self.bss_len);
        LittleEndian::write_u32(&mut buf[0x18..], self.caps.bits());
        LittleEndian::write_u32(&mut buf[0x1C..], self.crc);
        out.extend_from_slice(&buf);
    }
}

/// The optional manifest that may follow the rodata section: a 4-byte
/// little-endian length, then that many bytes of UTF-8 JSON.
///
/// Unknown fields are preserved verbatim in `extra`, so an image produced by
/// a newer toolchain survives a round-trip through this runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest schema version; absent means 1.
    #[serde(default = "manifest_version_default")]
    pub version: u32,
    /// `.mailbox` section: queues to pre-bind before the task runs.
    #[serde(default)]
    pub mailboxes: Vec<MailboxInit>,
    /// `.value` section, opaque to the core.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub values: serde_json::Value,
    /// `.cmd` section, opaque to the core.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub cmds: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn manifest_version_default() -> u32 {
    1
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: manifest_version_default(),
            mailboxes: Vec::new(),
            values: serde_json::Value::Null,
            cmds: serde_json::Value::Null,
            extra: serde_json::Map::new(),
        }
    }
}

/// One `.mailbox` manifest entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MailboxInit {
    /// Namespaced target name, e.g. `app:telem`.
    pub target: String,
    /// Queue capacity; the runtime default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    /// Raw `MailboxMode` bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_mask: Option<u32>,
    /// Diagnostic owner override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    /// Opaque binding descriptions, forwarded to collaborating subsystems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Reserved service-call module numbers. The module id is taken from R6 at
/// the SVC trap, the function id from R7.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum SvcModule {
    Task = 0x00,
    Memory = 0x01,
    Str = 0x02,
    Timer = 0x04,
    Mailbox = 0x05,
    Math = 0x06,
    Value = 0x07,
    Command = 0x08,
}

impl core::convert::TryFrom<u32> for SvcModule {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0x00 => Ok(Self::Task),
            0x01 => Ok(Self::Memory),
            0x02 => Ok(Self::Str),
            0x04 => Ok(Self::Timer),
            0x05 => Ok(Self::Mailbox),
            0x06 => Ok(Self::Math),
            0x07 => Ok(Self::Value),
            0x08 => Ok(Self::Command),
            _ => Err(()),
        }
    }
}

/// Functions of the Task module (0x00).
#[repr(u32)]
pub enum TaskFn {
    Exit = 0,
    Yield = 1,
    CurrentPid = 2,
}

impl core::convert::TryFrom<u32> for TaskFn {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Yield),
            2 => Ok(Self::CurrentPid),
            _ => Err(()),
        }
    }
}

/// Functions of the Timer module (0x04).
#[repr(u32)]
pub enum TimerFn {
    Sleep = 0,
    Ticks = 1,
}

impl core::convert::TryFrom<u32> for TimerFn {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Sleep),
            1 => Ok(Self::Ticks),
            _ => Err(()),
        }
    }
}

/// Functions of the Mailbox module (0x05).
#[repr(u32)]
pub enum MailboxFn {
    Bind = 0,
    Open = 1,
    Send = 2,
    Recv = 3,
    Peek = 4,
    Tap = 5,
    Close = 6,
}

impl core::convert::TryFrom<u32> for MailboxFn {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Bind),
            1 => Ok(Self::Open),
            2 => Ok(Self::Send),
            3 => Ok(Self::Recv),
            4 => Ok(Self::Peek),
            5 => Ok(Self::Tap),
            6 => Ok(Self::Close),
            _ => Err(()),
        }
    }
}

/// Immutable copy of a task's register window, as captured by `snapshot()`
/// and carried on `trace_step` events.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegSnapshot {
    pub regs: [u32; isa::REG_COUNT],
    pub pc: u32,
    pub sp: u32,
    pub fp: u32,
    pub psw: Psw,
}

/// A structured observability event.
///
/// `seq` is bus-wide monotonic; `ts` is the clock tick at emission; `pid` is
/// the task the event concerns, when there is one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: Timestamp,
    pub pid: Option<Pid>,
    pub kind: EventKind,
}

/// Event payloads. Progress-type events (see [`EventTag::is_progress`]) may
/// be coalesced under back-pressure; state-type events never are.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    TraceStep {
        pc: u32,
        opcode: u8,
        regs: RegSnapshot,
    },
    DebugBreak {
        pc: u32,
    },
    TaskState {
        state: StateKind,
        reason: Code,
    },
    MailboxSend {
        descriptor: u32,
        handle: HandleId,
        size: u32,
    },
    MailboxRecv {
        descriptor: u32,
        handle: HandleId,
        size: u32,
    },
    MailboxWait {
        descriptor: u32,
        handle: HandleId,
    },
    MailboxWake {
        descriptor: u32,
        handle: HandleId,
    },
    MailboxTimeout {
        handle: HandleId,
        status: Code,
    },
    MailboxOverrun {
        descriptor: u32,
        handle: Option<HandleId>,
    },
    MailboxExhausted {
        target: String,
    },
    ProvisioningStarted {
        expected: Option<u32>,
    },
    ProvisioningProgress {
        written: u32,
    },
    ProvisioningComplete {
        size: u32,
        crc: u32,
    },
    ProvisioningError {
        status: Code,
    },
    ProvisioningAborted {
        status: Code,
    },
    /// Bus back-pressure marker: `lost` progress events were coalesced away
    /// for this subscriber since its last delivery.
    Overrun {
        lost: u64,
    },
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            EventKind::TraceStep { .. } => EventTag::TraceStep,
            EventKind::DebugBreak { .. } => EventTag::DebugBreak,
            EventKind::TaskState { .. } => EventTag::TaskState,
            EventKind::MailboxSend { .. } => EventTag::MailboxSend,
            EventKind::MailboxRecv { .. } => EventTag::MailboxRecv,
            EventKind::MailboxWait { .. } => EventTag::MailboxWait,
            EventKind::MailboxWake { .. } => EventTag::MailboxWake,
            EventKind::MailboxTimeout { .. } => EventTag::MailboxTimeout,
            EventKind::MailboxOverrun { .. } => EventTag::MailboxOverrun,
            EventKind::MailboxExhausted { .. } => EventTag::MailboxExhausted,
            EventKind::ProvisioningStarted { .. } => EventTag::ProvisioningStarted,
            EventKind::ProvisioningProgress { .. } => EventTag::ProvisioningProgress,
            EventKind::ProvisioningComplete { .. } => EventTag::ProvisioningComplete,
            EventKind::ProvisioningError { .. } => EventTag::ProvisioningError,
            EventKind::ProvisioningAborted { .. } => EventTag::ProvisioningAborted,
            EventKind::Overrun { .. } => EventTag::Overrun,
        }
    }
}

/// Discriminant-only view of [`EventKind`], used in subscriber filters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EventTag {
    TraceStep,
    DebugBreak,
    TaskState,
    MailboxSend,
    MailboxRecv,
    MailboxWait,
    MailboxWake,
    MailboxTimeout,
    MailboxOverrun,
    MailboxExhausted,
    ProvisioningStarted,
    ProvisioningProgress,
    ProvisioningComplete,
    ProvisioningError,
    ProvisioningAborted,
    Overrun,
}

impl EventTag {
    /// Progress-type events may be coalesced to the newest when a subscriber
    /// lags; everything else must be delivered or the subscriber must see an
    /// `Overrun` marker.
    pub fn is_progress(self) -> bool {
        matches!(self, EventTag::TraceStep | EventTag::ProvisioningProgress)
    }
}
