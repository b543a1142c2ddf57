// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HSX executive and MiniVM.
//!
//! This is the engine of the HSX runtime: a deterministic 32-bit virtual
//! machine plus the executive that owns its tasks, streams executable images
//! into them, dispatches service calls, and connects tasks through the
//! mailbox subsystem. Debugger front-ends, transports, and hardware drivers
//! are separate crates that talk to [`exec::Executive`] through its
//! in-process control surface and the [`svc::Service`] hook.
//!
//! # Design principles
//!
//! 1. One owner. There are no global singletons: an `Executive` is a plain
//!    value, every subsystem is a field of it, and tests build as many fresh
//!    ones as they like.
//! 2. Cooperative and single-threaded. The engine suspends only between
//!    instructions; everything that looks concurrent (blocking receives,
//!    timeouts, streamed loads) is an explicit state machine driven by the
//!    clock.
//! 3. Status codes, not exceptions. Every public operation reports failure
//!    through [`hsx_abi::Code`]; runtime traps become a FAILED task with its
//!    PC preserved. Panics are reserved for engine invariant violations.
//! 4. Arenas and indices over pointers. Tasks name register windows, mailbox
//!    descriptors name waiters, and handles name descriptors by stable
//!    integer, so the object graph has no cycles to manage.

pub mod err;
pub mod events;
pub mod exec;
pub mod image;
pub mod mailbox;
pub mod mem;
pub mod regfile;
pub mod svc;
pub mod task;
pub mod time;
pub mod trace;
pub mod vm;
