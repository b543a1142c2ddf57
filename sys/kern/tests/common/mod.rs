// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures: a tiny assembler on top of the ABI encoders and an
//! executive factory.

#![allow(dead_code)]

use hsx_abi::isa::{self, Opcode};
use hsx_abi::{CapFlags, Manifest, Pid, StateKind};
use hsx_kern::exec::{ExecConfig, Executive};
use hsx_kern::image;

/// Serializes instruction words into a code section.
pub fn code_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// A well-formed image with entry 0 and no capability demands.
pub fn image_of(words: &[u32]) -> Vec<u8> {
    image::build_image(0, &code_bytes(words), &[], 0, CapFlags::empty(), None)
}

pub fn image_with(
    words: &[u32],
    rodata: &[u8],
    bss: u32,
    manifest: Option<&Manifest>,
) -> Vec<u8> {
    image::build_image(
        0,
        &code_bytes(words),
        rodata,
        bss,
        CapFlags::empty(),
        manifest,
    )
}

pub fn exec() -> Executive {
    Executive::new(ExecConfig::default())
}

pub fn exec_with(cfg: ExecConfig) -> Executive {
    Executive::new(cfg)
}

pub fn load(exec: &mut Executive, words: &[u32]) -> Pid {
    exec.load(image_of(words)).expect("test image loads")
}

/// Runs the clock until `pid` reaches `state`, with a tick bound so a
/// broken scheduler fails the test instead of hanging it.
pub fn run_until_state(exec: &mut Executive, pid: Pid, state: StateKind, max_ticks: u64) {
    for _ in 0..max_ticks {
        if exec.task_state(pid) == Some(state) {
            return;
        }
        exec.clock_step(1);
    }
    panic!(
        "{pid} did not reach {state:?} within {max_ticks} ticks (now {:?})",
        exec.task_state(pid)
    );
}

pub fn psw_of(exec: &Executive, pid: Pid) -> hsx_abi::Psw {
    hsx_abi::Psw(exec.reg_get(pid, isa::REG_IDX_PSW).unwrap())
}

// Mnemonic-ish wrappers so test programs read like listings.

pub fn ldi(rd: usize, imm: i16) -> u32 {
    isa::enc_ri(Opcode::Ldi, rd, imm as u16)
}

/// `LDI32` occupies two words.
pub fn ldi32(rd: usize, imm: u32) -> [u32; 2] {
    [isa::enc_ri(Opcode::Ldi32, rd, 0), imm]
}

pub fn alu(op: Opcode, rd: usize, rs1: usize, rs2: usize) -> u32 {
    isa::enc_rrr(op, rd, rs1, rs2)
}

pub fn brk() -> u32 {
    isa::enc_none(Opcode::Brk)
}

pub fn svc() -> u32 {
    isa::enc_none(Opcode::Svc)
}

pub fn jmp(target: u16) -> u32 {
    isa::enc_j(Opcode::Jmp, target)
}

/// The Task.exit SVC preamble: module 0, function 0, code in R0.
pub fn exit_seq(code: i16) -> Vec<u32> {
    vec![
        ldi(isa::REG_SVC_MODULE, 0),
        ldi(isa::REG_SVC_FN, 0),
        ldi(0, code),
        svc(),
    ]
}
