// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The register arena and workspace-pointer context switch.
//!
//! Every task's machine state -- sixteen general registers plus PC, PSW, SP,
//! and FP -- lives in one shared `u32` arena, partitioned into fixed-size
//! windows. A task holds the index of its window (the *workspace pointer*),
//! and a context switch is nothing but replacing the active index: no
//! register contents move, ever.
//!
//! Windows are recycled through a free list and zeroed on allocation, so a
//! new task can never observe a predecessor's register contents.

use hsx_abi::{isa, Psw, RegSnapshot};

/// Cells per window: R0..R15, then PC, PSW, SP, FP.
pub const WINDOW_CELLS: usize = isa::REG_COUNT + 4;

const PC_CELL: usize = isa::REG_COUNT;
const PSW_CELL: usize = isa::REG_COUNT + 1;
const SP_CELL: usize = isa::REG_COUNT + 2;
const FP_CELL: usize = isa::REG_COUNT + 3;

/// An owned workspace pointer: the index of one window in the arena.
///
/// Deliberately not `Copy` or `Clone`: exactly one `Window` exists per
/// allocated window, the owning task holds it, and giving it back to
/// [`RegisterFile::release`] consumes it. That makes double-release and
/// aliased windows unrepresentable rather than merely discouraged.
#[derive(Debug, Eq, PartialEq)]
pub struct Window(usize);

#[derive(Debug)]
pub struct RegisterFile {
    arena: Vec<u32>,
    free: Vec<usize>,
    /// Base cell of the active window. Points at a scratch window (index 0)
    /// when no task is active, so stray accesses can't corrupt a task.
    active_base: usize,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            // Window 0 is the executive's scratch window and is never handed
            // to a task.
            arena: vec![0; WINDOW_CELLS],
            free: Vec::new(),
            active_base: 0,
        }
    }

    /// Allocates a zeroed window.
    pub fn alloc(&mut self) -> Window {
        if let Some(index) = self.free.pop() {
            let base = index * WINDOW_CELLS;
            self.arena[base..base + WINDOW_CELLS].fill(0);
            Window(index)
        } else {
            let index = self.arena.len() / WINDOW_CELLS;
            self.arena.extend(core::iter::repeat(0).take(WINDOW_CELLS));
            Window(index)
        }
    }

    /// Returns a window to the free list.
    pub fn release(&mut self, w: Window) {
        if self.active_base == w.0 * WINDOW_CELLS {
            self.active_base = 0;
        }
        self.free.push(w.0);
    }

    /// Makes `w` the active window. O(1): this updates one index and touches
    /// no register contents.
    pub fn activate(&mut self, w: &Window) {
        self.active_base = w.0 * WINDOW_CELLS;
    }

    /// Deactivates whatever window was active, parking on the scratch
    /// window.
    pub fn deactivate(&mut self) {
        self.active_base = 0;
    }

    // Active-window accessors, used by the decoder on the running task.

    pub fn gpr(&self, r: usize) -> u32 {
        debug_assert!(r < isa::REG_COUNT);
        self.arena[self.active_base + r]
    }

    pub fn set_gpr(&mut self, r: usize, v: u32) {
        debug_assert!(r < isa::REG_COUNT);
        self.arena[self.active_base + r] = v;
    }

    pub fn pc(&self) -> u32 {
        self.arena[self.active_base + PC_CELL]
    }

    pub fn set_pc(&mut self, v: u32) {
        self.arena[self.active_base + PC_CELL] = v;
    }

    pub fn psw(&self) -> Psw {
        Psw(self.arena[self.active_base + PSW_CELL])
    }

    pub fn set_psw(&mut self, v: Psw) {
        self.arena[self.active_base + PSW_CELL] = v.0;
    }

    pub fn sp(&self) -> u32 {
        self.arena[self.active_base + SP_CELL]
    }

    pub fn set_sp(&mut self, v: u32) {
        self.arena[self.active_base + SP_CELL] = v;
    }

    pub fn fp(&self) -> u32 {
        self.arena[self.active_base + FP_CELL]
    }

    pub fn set_fp(&mut self, v: u32) {
        self.arena[self.active_base + FP_CELL] = v;
    }

    // Explicit-window accessors, used by the debug surface on non-active
    // tasks.

    pub fn gpr_of(&self, w: &Window, r: usize) -> u32 {
        debug_assert!(r < isa::REG_COUNT);
        self.arena[w.0 * WINDOW_CELLS + r]
    }

    pub fn set_gpr_of(&mut self, w: &Window, r: usize, v: u32) {
        debug_assert!(r < isa::REG_COUNT);
        self.arena[w.0 * WINDOW_CELLS + r] = v;
    }

    pub fn cell_of(&self, w: &Window, cell: usize) -> u32 {
        debug_assert!(cell < WINDOW_CELLS);
        self.arena[w.0 * WINDOW_CELLS + cell]
    }

    pub fn set_cell_of(&mut self, w: &Window, cell: usize, v: u32) {
        debug_assert!(cell < WINDOW_CELLS);
        self.arena[w.0 * WINDOW_CELLS + cell] = v;
    }

    pub fn pc_of(&self, w: &Window) -> u32 {
        self.cell_of(w, PC_CELL)
    }

    pub fn set_pc_of(&mut self, w: &Window, v: u32) {
        self.set_cell_of(w, PC_CELL, v);
    }

    pub fn psw_of(&self, w: &Window) -> Psw {
        Psw(self.cell_of(w, PSW_CELL))
    }

    pub fn sp_of(&self, w: &Window) -> u32 {
        self.cell_of(w, SP_CELL)
    }

    pub fn set_sp_of(&mut self, w: &Window, v: u32) {
        self.set_cell_of(w, SP_CELL, v);
    }

    /// Captures an immutable copy of a window. Because the engine only runs
    /// between instructions, a snapshot can never observe a half-executed
    /// instruction.
    pub fn snapshot(&self, w: &Window) -> RegSnapshot {
        let base = w.0 * WINDOW_CELLS;
        let mut regs = [0u32; isa::REG_COUNT];
        regs.copy_from_slice(&self.arena[base..base + isa::REG_COUNT]);
        RegSnapshot {
            regs,
            pc: self.arena[base + PC_CELL],
            sp: self.arena[base + SP_CELL],
            fp: self.arena[base + FP_CELL],
            psw: Psw(self.arena[base + PSW_CELL]),
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
