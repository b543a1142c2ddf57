// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Breakpoint and BRK semantics: halt before execution, resume runs the
//! halted instruction exactly once, single-step crosses a breakpoint by
//! exactly one instruction.

mod common;

use common::*;
use hsx_abi::isa::REG_IDX_PC;
use hsx_abi::{Code, EventKind, StateKind};
use hsx_kern::events::EventFilter;

/// LDI R1..R3 then BRK, then a clean exit.
fn program() -> Vec<u32> {
    let mut words = vec![ldi(1, 1), ldi(2, 2), ldi(3, 3), brk()];
    words.extend(exit_seq(0));
    words
}

#[test]
fn breakpoint_halts_before_executing() {
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    ex.bp_set(pid, 4).unwrap();

    run_until_state(&mut ex, pid, StateKind::Paused, 16);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 4);
    assert_eq!(ex.reg_get(pid, 1).unwrap(), 1, "first LDI retired");
    assert_eq!(ex.reg_get(pid, 2).unwrap(), 0, "halted instruction did not run");
}

#[test]
fn resume_executes_the_halted_instruction_once() {
    let mut ex = exec();
    let sub = ex.events_subscribe(EventFilter::default(), None);
    let pid = load(&mut ex, &program());
    ex.bp_set(pid, 4).unwrap();
    run_until_state(&mut ex, pid, StateKind::Paused, 16);

    ex.resume(pid).unwrap();
    // Next stop is the BRK; R2 was set exactly once on the way.
    run_until_state(&mut ex, pid, StateKind::Paused, 16);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 12, "paused at BRK");
    assert_eq!(ex.reg_get(pid, 2).unwrap(), 2);
    assert_eq!(ex.reg_get(pid, 3).unwrap(), 3);

    // Two pauses, two debug_break events.
    let breaks = ex
        .events_poll(sub, 256)
        .iter()
        .filter(|e| matches!(e.kind, EventKind::DebugBreak { .. }))
        .count();
    assert_eq!(breaks, 2);
}

#[test]
fn brk_leaves_pc_on_the_brk_until_resumed() {
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    run_until_state(&mut ex, pid, StateKind::Paused, 16);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 12);

    ex.resume(pid).unwrap();
    run_until_state(&mut ex, pid, StateKind::Stopped, 32);
    assert_eq!(ex.exit_code(pid), Some(0));
}

#[test]
fn single_step_crosses_a_breakpoint_by_one_instruction() {
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    ex.bp_set(pid, 4).unwrap();

    // First step: the instruction at 0 runs, landing on the breakpoint
    // address without triggering it.
    assert_eq!(ex.step(pid, 1).unwrap(), 1);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 4);
    assert_eq!(ex.task_state(pid), Some(StateKind::Paused));

    // Second step: exactly the halted instruction.
    assert_eq!(ex.step(pid, 1).unwrap(), 1);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 8);
    assert_eq!(ex.reg_get(pid, 2).unwrap(), 2);
}

#[test]
fn step_over_a_brk_advances_past_it() {
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    run_until_state(&mut ex, pid, StateKind::Paused, 16);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 12);

    // Stepping a BRK-paused task moves past the BRK and executes the next
    // instruction (the first word of the exit sequence).
    assert_eq!(ex.step(pid, 1).unwrap(), 1);
    assert_eq!(ex.reg_get(pid, REG_IDX_PC).unwrap(), 20);
}

#[test]
fn stepping_a_running_task_is_refused() {
    let mut ex = exec();
    let pid = load(&mut ex, &spinner());
    ex.clock_step(1);
    assert_eq!(ex.task_state(pid), Some(StateKind::Running));
    assert_eq!(ex.step(pid, 1), Err(Code::BadState));
}

fn spinner() -> Vec<u32> {
    vec![jmp(0)]
}

#[test]
fn bp_list_and_clear() {
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    ex.bp_set(pid, 4).unwrap();
    ex.bp_set(pid, 8).unwrap();
    assert_eq!(ex.bp_list(pid).unwrap(), vec![4, 8]);
    ex.bp_clear(pid, 4).unwrap();
    assert_eq!(ex.bp_list(pid).unwrap(), vec![8]);
    assert_eq!(ex.bp_clear(pid, 4), Err(Code::NotFound));
}

#[test]
fn trace_surface_tracks_last_step() {
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    ex.clock_step(2);
    assert_eq!(ex.last_pc(pid), Some(4));
    assert_eq!(ex.last_opcode(pid), Some(hsx_abi::isa::Opcode::Ldi as u8));
    let snap = ex.last_regs(pid).unwrap();
    assert_eq!(snap.regs[1], 1);
    assert_eq!(snap.regs[2], 2);
    assert_eq!(snap.pc, 8);
}

#[test]
fn disasm_reads_the_immutable_image() {
    use hsx_kern::trace::DisasmMode;
    let mut ex = exec();
    let pid = load(&mut ex, &program());
    let lines = ex
        .disasm_read(pid, Some(0), 4, DisasmMode::FromAddr)
        .unwrap();
    assert_eq!(lines[0].text, "LDI R1, #1");
    assert_eq!(lines[3].text, "BRK");
    // Writable memory never feeds the disassembler; the cache is keyed on
    // the image identity, so a second read is served from cache.
    let again = ex
        .disasm_read(pid, Some(0), 4, DisasmMode::FromAddr)
        .unwrap();
    assert_eq!(lines, again);
}
