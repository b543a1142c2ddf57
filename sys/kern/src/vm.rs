// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MiniVM instruction executor.
//!
//! [`step`] runs exactly one instruction of the active task: fetch from the
//! immutable code image at PC, decode, execute against the active register
//! window and the task's data arenas, update the PSW, and report how the
//! step ended. The executor never blocks and never yields mid-instruction;
//! anything that needs the executive (SVC, BRK, faults) is returned as a
//! [`Step`] or a [`FaultInfo`] for the caller to act on.
//!
//! PC discipline: on a fault the PC is left at the faulting instruction so
//! post-mortem state is exact. On `SVC` the PC has already advanced past the
//! trap, so the task resumes after it once the executive writes the results.
//! On `BRK` the PC stays at the BRK; the executive advances it on resume.
//!
//! PSW discipline is the one documented on each helper below; flags an
//! instruction does not set are preserved bitwise, including the reserved
//! upper bits.

use hsx_abi::isa::{Insn, Opcode};
use hsx_abi::{FaultInfo, Psw};

use crate::image::CodeImage;
use crate::mem::TaskMemory;
use crate::regfile::RegisterFile;

/// How a single instruction step concluded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// The instruction retired; nothing for the executive to do.
    Normal,
    /// An `SVC` trap. Module and function ids are in R6/R7, arguments in
    /// R0..R3; the PC is already past the SVC.
    Svc,
    /// A `BRK` trap. The PC still points at the BRK.
    Break,
}

/// Executes one instruction of the active window. The caller has already
/// activated the task's window on `regs`.
pub fn step(
    image: &CodeImage,
    regs: &mut RegisterFile,
    mem: &mut TaskMemory,
) -> Result<Step, FaultInfo> {
    let pc = regs.pc();
    let word = image.fetch_word(pc)?;
    let insn = Insn::decode(word).map_err(|opcode| FaultInfo::IllegalOpcode { opcode })?;
    let mut next_pc = pc.wrapping_add(insn.op.len_bytes());
    let mut psw = regs.psw();

    match insn.op {
        // Data movement. None of these touch the PSW.
        Opcode::Ldi => {
            regs.set_gpr(insn.ra, insn.simm16() as u32);
        }
        Opcode::Ldi32 => {
            let imm = image.fetch_word(pc.wrapping_add(4))?;
            regs.set_gpr(insn.ra, imm);
        }
        Opcode::Mov => {
            let v = regs.gpr(insn.rb);
            regs.set_gpr(insn.ra, v);
        }
        Opcode::Ld => {
            let addr = regs.gpr(insn.rb).wrapping_add(insn.simm16() as u32);
            let v = mem.read_u32(addr)?;
            regs.set_gpr(insn.ra, v);
        }
        Opcode::Ldh => {
            let addr = regs.gpr(insn.rb).wrapping_add(insn.simm16() as u32);
            let v = mem.read_u16(addr)?;
            regs.set_gpr(insn.ra, u32::from(v));
        }
        Opcode::Ldb => {
            let addr = regs.gpr(insn.rb).wrapping_add(insn.simm16() as u32);
            let v = mem.read_u8(addr)?;
            regs.set_gpr(insn.ra, u32::from(v));
        }
        Opcode::St => {
            let addr = regs.gpr(insn.rb).wrapping_add(insn.simm16() as u32);
            mem.write_u32(addr, regs.gpr(insn.ra))?;
        }
        Opcode::Sth => {
            let addr = regs.gpr(insn.rb).wrapping_add(insn.simm16() as u32);
            mem.write_u16(addr, regs.gpr(insn.ra) as u16)?;
        }
        Opcode::Stb => {
            let addr = regs.gpr(insn.rb).wrapping_add(insn.simm16() as u32);
            mem.write_u8(addr, regs.gpr(insn.ra) as u8)?;
        }

        // ALU.
        Opcode::Add => {
            let r = add_with_carry(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc), 0);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Adc => {
            let carry_in = psw.c() as u32;
            let r = add_with_carry(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc), carry_in);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Sub => {
            let r = sub_with_borrow(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc), 0);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Sbc => {
            let borrow_in = psw.c() as u32;
            let r = sub_with_borrow(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc), borrow_in);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Cmp => {
            // SUB flags without a destination. `ra` is the left operand so
            // that two-operand forms read naturally.
            let _ = sub_with_borrow(&mut psw, regs.gpr(insn.ra), regs.gpr(insn.rb), 0);
        }
        Opcode::Mul => {
            let a = regs.gpr(insn.rb);
            let b = regs.gpr(insn.rc);
            let r = a.wrapping_mul(b);
            let signed = i64::from(a as i32) * i64::from(b as i32);
            let unsigned = u64::from(a) * u64::from(b);
            psw.set_nz(r);
            psw.set_v(signed != i64::from(r as i32));
            psw.set_c(unsigned > u64::from(u32::MAX));
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Div => {
            let n = regs.gpr(insn.rb) as i32;
            let d = regs.gpr(insn.rc) as i32;
            if d == 0 {
                return Err(FaultInfo::DivideByZero);
            }
            if n == i32::MIN && d == -1 {
                return Err(FaultInfo::IntegerOverflow);
            }
            let r = n.wrapping_div(d) as u32;
            psw.set_nz(r);
            psw.set_c(false);
            psw.set_v(false);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::And => {
            let r = regs.gpr(insn.rb) & regs.gpr(insn.rc);
            logical_flags(&mut psw, r);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Or => {
            let r = regs.gpr(insn.rb) | regs.gpr(insn.rc);
            logical_flags(&mut psw, r);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Xor => {
            let r = regs.gpr(insn.rb) ^ regs.gpr(insn.rc);
            logical_flags(&mut psw, r);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Not => {
            let r = !regs.gpr(insn.rb);
            logical_flags(&mut psw, r);
            regs.set_gpr(insn.ra, r);
        }

        // Shifts. The count comes from the low 8 bits of `rc`.
        Opcode::Lsl => {
            let r = shift_left(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc) & 0xFF);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Lsr => {
            let r = shift_right(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc) & 0xFF, false);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Asr => {
            let r = shift_right(&mut psw, regs.gpr(insn.rb), regs.gpr(insn.rc) & 0xFF, true);
            regs.set_gpr(insn.ra, r);
        }

        // Control flow and stack. Branch targets are absolute code byte
        // addresses; a bad target faults at the *next* fetch, with the PC
        // pointing there for diagnosis.
        Opcode::Jmp => {
            next_pc = u32::from(insn.imm16);
        }
        Opcode::Jz => {
            if psw.z() {
                next_pc = u32::from(insn.imm16);
            }
        }
        Opcode::Jnz => {
            if !psw.z() {
                next_pc = u32::from(insn.imm16);
            }
        }
        Opcode::Call => {
            let sp = regs.sp().wrapping_sub(4);
            mem.write_u32(sp, next_pc)?;
            regs.set_sp(sp);
            next_pc = u32::from(insn.imm16);
        }
        Opcode::Ret => {
            let sp = regs.sp();
            next_pc = mem.read_u32(sp)?;
            regs.set_sp(sp.wrapping_add(4));
        }
        Opcode::Push => {
            let sp = regs.sp().wrapping_sub(4);
            mem.write_u32(sp, regs.gpr(insn.ra))?;
            regs.set_sp(sp);
        }
        Opcode::Pop => {
            let sp = regs.sp();
            let v = mem.read_u32(sp)?;
            regs.set_sp(sp.wrapping_add(4));
            regs.set_gpr(insn.ra, v);
        }

        // binary16 helpers. These leave the PSW untouched; float divide
        // follows IEEE-754 (inf/NaN), only the *integer* DIV traps.
        Opcode::Fadd => {
            let r = f16_binop(regs.gpr(insn.rb), regs.gpr(insn.rc), |a, b| a + b);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Fsub => {
            let r = f16_binop(regs.gpr(insn.rb), regs.gpr(insn.rc), |a, b| a - b);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Fmul => {
            let r = f16_binop(regs.gpr(insn.rb), regs.gpr(insn.rc), |a, b| a * b);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::Fdiv => {
            let r = f16_binop(regs.gpr(insn.rb), regs.gpr(insn.rc), |a, b| a / b);
            regs.set_gpr(insn.ra, r);
        }
        Opcode::I2f => {
            let v = regs.gpr(insn.rb) as i32;
            regs.set_gpr(insn.ra, u32::from(f32_to_f16(v as f32)));
        }
        Opcode::F2i => {
            let v = f16_to_f32(regs.gpr(insn.rb) as u16);
            // Truncation toward zero, saturating at the i32 range; NaN
            // converts to 0.
            regs.set_gpr(insn.ra, v as i32 as u32);
        }

        // Traps.
        Opcode::Svc => {
            regs.set_psw(psw);
            regs.set_pc(next_pc);
            return Ok(Step::Svc);
        }
        Opcode::Brk => {
            return Ok(Step::Break);
        }
    }

    regs.set_psw(psw);
    regs.set_pc(next_pc);
    Ok(Step::Normal)
}

/// ADD/ADC result and flags. C is the 33rd bit of the unsigned sum; V fires
/// when both operands share a sign and the result does not.
fn add_with_carry(psw: &mut Psw, a: u32, b: u32, carry_in: u32) -> u32 {
    let wide = u64::from(a) + u64::from(b) + u64::from(carry_in);
    let r = wide as u32;
    psw.set_nz(r);
    psw.set_c(wide >> 32 != 0);
    psw.set_v(!(a ^ b) & (a ^ r) & 0x8000_0000 != 0);
    r
}

/// SUB/SBC/CMP result and flags. C is the *borrow* flag: set when the
/// unsigned `a - b - borrow_in` wraps. V fires when the operand signs differ
/// and the result's sign matches the subtrahend's.
fn sub_with_borrow(psw: &mut Psw, a: u32, b: u32, borrow_in: u32) -> u32 {
    let r = a.wrapping_sub(b).wrapping_sub(borrow_in);
    psw.set_nz(r);
    psw.set_c(u64::from(b) + u64::from(borrow_in) > u64::from(a));
    psw.set_v((a ^ b) & (a ^ r) & 0x8000_0000 != 0);
    r
}

/// AND/OR/XOR/NOT flags: Z/N from the result, V cleared, C preserved.
fn logical_flags(psw: &mut Psw, r: u32) {
    psw.set_nz(r);
    psw.set_v(false);
}

/// LSL. A zero count preserves Z/N/C and clears only V; otherwise C takes
/// the last bit shifted out. Counts are honored up to 255 through 64-bit
/// widening, so counts past 32 produce zero with C=0 (except exactly 32,
/// where C is bit 0 of the original value).
fn shift_left(psw: &mut Psw, v: u32, count: u32) -> u32 {
    if count == 0 {
        psw.set_v(false);
        return v;
    }
    let wide = if count < 64 { u64::from(v) << count } else { 0 };
    let r = wide as u32;
    psw.set_nz(r);
    psw.set_c(wide >> 32 & 1 != 0);
    psw.set_v(false);
    r
}

/// LSR/ASR. A zero count preserves Z/N/C and clears only V; otherwise C
/// takes the last bit shifted into it (bit `count-1` of the original value,
/// or the sign fill once an arithmetic shift has consumed the whole word).
fn shift_right(psw: &mut Psw, v: u32, count: u32, arithmetic: bool) -> u32 {
    if count == 0 {
        psw.set_v(false);
        return v;
    }
    let wide: i64 = if arithmetic {
        i64::from(v as i32)
    } else {
        u64::from(v) as i64
    };
    let shift = count.min(63);
    let r = (wide >> shift) as u32;
    let c = wide >> (shift - 1) & 1 != 0;
    psw.set_nz(r);
    psw.set_c(c);
    psw.set_v(false);
    r
}

fn f16_binop(a: u32, b: u32, op: impl Fn(f32, f32) -> f32) -> u32 {
    u32::from(f32_to_f16(op(f16_to_f32(a as u16), f16_to_f32(b as u16))))
}

/// Widens an IEEE-754 binary16 value to binary32. Exact: every binary16
/// value (normals, subnormals, infinities, NaNs) is representable.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from(bits >> 10) & 0x1F;
    let frac = u32::from(bits) & 0x3FF;

    let out = if exp == 0 {
        if frac == 0 {
            sign
        } else {
            // Subnormal: renormalize into the binary32 format.
            let mut e = 113u32;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((f & 0x3FF) << 13)
        }
    } else if exp == 0x1F {
        sign | (0xFF << 23) | (frac << 13)
    } else {
        sign | ((exp + 112) << 23) | (frac << 13)
    };
    f32::from_bits(out)
}

/// Narrows a binary32 value to binary16 with round-to-nearest-even,
/// overflowing to infinity and flushing tiny values to signed zero.
fn f32_to_f16(v: f32) -> u16 {
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x7F_FFFF;

    if exp == 0xFF {
        if frac == 0 {
            return sign | 0x7C00;
        }
        // NaN: keep the top payload bits, forcing at least the quiet bit so
        // the result stays a NaN.
        let payload = (frac >> 13) as u16 & 0x3FF;
        return sign | 0x7C00 | if payload == 0 { 0x200 } else { payload };
    }

    let e = exp - 127 + 15;
    if e >= 0x1F {
        return sign | 0x7C00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        // Subnormal result: shift the full significand (implicit bit
        // included) down to the 2^-24 grid, rounding half to even.
        let mant = frac | 0x80_0000;
        let shift = (14 - e) as u32;
        let sub = mant >> shift;
        let rem = mant & ((1 << shift) - 1);
        let half = 1 << (shift - 1);
        let round_up = rem > half || (rem == half && sub & 1 == 1);
        return sign | (sub + u32::from(round_up)) as u16;
    }

    let sub = frac >> 13;
    let rem = frac & 0x1FFF;
    let mut out = ((e as u32) << 10) | sub;
    if rem > 0x1000 || (rem == 0x1000 && out & 1 == 1) {
        // A carry out of the mantissa rolls into the exponent, which is
        // exactly the right behavior up to and including overflow to inf.
        out += 1;
    }
    sign | out as u16
}
