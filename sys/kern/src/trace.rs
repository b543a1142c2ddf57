// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disassembly for the debug surface.
//!
//! Listings are produced by a linear sweep over the *immutable code image*
//! only -- never over writable memory, so what the debugger shows is what
//! the decoder will execute. Listings are cached per `(pid, code identity)`;
//! the identity is the image's CRC + length, so a restarted task with the
//! same image hits the cache and a task that loaded different bytes cannot.

use std::collections::HashMap;

use hsx_abi::isa::{Insn, Opcode};
use hsx_abi::Pid;

use crate::image::CodeImage;

/// How `disasm_read` anchors its window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisasmMode {
    /// Center the window on the anchor address (typically the PC).
    AroundPc,
    /// Start the window at the anchor address.
    FromAddr,
}

/// One listing line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisasmLine {
    pub addr: u32,
    /// Raw instruction word (first word, for two-word instructions).
    pub word: u32,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct DisasmCache {
    listings: HashMap<(Pid, (u32, u32)), Vec<DisasmLine>>,
}

impl DisasmCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `count` lines anchored at `anchor` from the listing for
    /// `pid`'s image, building and caching the listing on first use.
    pub fn read(
        &mut self,
        pid: Pid,
        image: &CodeImage,
        anchor: u32,
        count: usize,
        mode: DisasmMode,
    ) -> Vec<DisasmLine> {
        let key = (pid, image.identity());
        let listing = self
            .listings
            .entry(key)
            .or_insert_with(|| build_listing(image));

        let at = listing.partition_point(|line| line.addr < anchor);
        let start = match mode {
            DisasmMode::FromAddr => at.min(listing.len()),
            DisasmMode::AroundPc => at.saturating_sub(count / 2),
        };
        listing.iter().skip(start).take(count).cloned().collect()
    }

    /// Drops cached listings for a destroyed pid.
    pub fn invalidate(&mut self, pid: Pid) {
        self.listings.retain(|(p, _), _| *p != pid);
    }
}

/// Linear sweep of the code section. Unassigned encodings disassemble as
/// `.word`, and the sweep resynchronizes on the next word boundary.
fn build_listing(image: &CodeImage) -> Vec<DisasmLine> {
    let mut lines = Vec::new();
    let mut pc = 0u32;
    let code_len = image.header().code_len;
    while pc + 4 <= code_len {
        let word = image.fetch_word(pc).expect("sweep stays inside code");
        match Insn::decode(word) {
            Ok(insn) => {
                let mut step = insn.op.len_bytes();
                let text = if insn.op == Opcode::Ldi32 {
                    match image.fetch_word(pc + 4) {
                        Ok(imm) => format!("LDI32 R{}, #{:#010x}", insn.ra, imm),
                        Err(_) => {
                            // Truncated two-word instruction at the end of
                            // the section; show the first word as data.
                            step = 4;
                            format!(".word {word:#010x}")
                        }
                    }
                } else {
                    format_insn(&insn)
                };
                lines.push(DisasmLine {
                    addr: pc,
                    word,
                    text,
                });
                pc += step;
            }
            Err(_) => {
                lines.push(DisasmLine {
                    addr: pc,
                    word,
                    text: format!(".word {word:#010x}"),
                });
                pc += 4;
            }
        }
    }
    lines
}

fn format_insn(insn: &Insn) -> String {
    use Opcode::*;
    let m = insn.op.mnemonic();
    match insn.op {
        Add | Sub | Mul | Div | And | Or | Xor | Adc | Sbc | Lsl | Lsr | Asr | Fadd | Fsub
        | Fmul | Fdiv => {
            format!("{m} R{}, R{}, R{}", insn.ra, insn.rb, insn.rc)
        }
        Mov | Not | I2f | F2i => format!("{m} R{}, R{}", insn.ra, insn.rb),
        Cmp => format!("{m} R{}, R{}", insn.ra, insn.rb),
        Ldi => format!("{m} R{}, #{}", insn.ra, insn.simm16()),
        Ld | Ldb | Ldh | St | Stb | Sth => {
            let off = insn.simm16();
            if off < 0 {
                format!("{m} R{}, [R{}{off}]", insn.ra, insn.rb)
            } else {
                format!("{m} R{}, [R{}+{off}]", insn.ra, insn.rb)
            }
        }
        Jmp | Jz | Jnz | Call => format!("{m} {:#06x}", insn.imm16),
        Push | Pop => format!("{m} R{}", insn.ra),
        Ret | Svc | Brk => m.to_string(),
        // Handled by the caller, which has the second word in hand.
        Ldi32 => format!("{m} R{}, #<imm32>", insn.ra),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsx_abi::isa::{enc_j, enc_mem, enc_none, enc_ri, enc_rrr};

    fn image_of(words: &[u32]) -> CodeImage {
        let mut code = Vec::new();
        for w in words {
            code.extend_from_slice(&w.to_le_bytes());
        }
        CodeImage::synthetic(&code, &[], 0)
    }

    #[test]
    fn listing_covers_every_instruction() {
        let img = image_of(&[
            enc_ri(Opcode::Ldi, 1, 5),
            enc_rrr(Opcode::Add, 3, 1, 2),
            enc_mem(Opcode::Ld, 2, 4, -8),
            enc_j(Opcode::Jmp, 0),
            enc_none(Opcode::Brk),
        ]);
        let mut cache = DisasmCache::new();
        let lines = cache.read(Pid(1), &img, 0, 16, DisasmMode::FromAddr);
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            [
                "LDI R1, #5",
                "ADD R3, R1, R2",
                "LD R2, [R4-8]",
                "JMP 0x0000",
                "BRK",
            ]
        );
        assert_eq!(lines[2].addr, 8);
    }

    #[test]
    fn ldi32_consumes_two_words() {
        let img = image_of(&[enc_ri(Opcode::Ldi32, 7, 0), 0x7FFF_FFFF, enc_none(Opcode::Ret)]);
        let mut cache = DisasmCache::new();
        let lines = cache.read(Pid(1), &img, 0, 16, DisasmMode::FromAddr);
        assert_eq!(lines[0].text, "LDI32 R7, #0x7fffffff");
        assert_eq!(lines[1].addr, 8);
        assert_eq!(lines[1].text, "RET");
    }

    #[test]
    fn unassigned_words_render_as_data() {
        let img = image_of(&[0x0000_00FE, enc_none(Opcode::Ret)]);
        let mut cache = DisasmCache::new();
        let lines = cache.read(Pid(1), &img, 0, 16, DisasmMode::FromAddr);
        assert_eq!(lines[0].text, ".word 0x000000fe");
        assert_eq!(lines[1].text, "RET");
    }

    #[test]
    fn around_pc_centers_and_from_addr_starts() {
        let words: Vec<u32> = (0..8).map(|_| enc_none(Opcode::Ret)).collect();
        let img = image_of(&words);
        let mut cache = DisasmCache::new();
        let around = cache.read(Pid(1), &img, 16, 4, DisasmMode::AroundPc);
        assert_eq!(around.first().unwrap().addr, 8);
        let from = cache.read(Pid(1), &img, 16, 4, DisasmMode::FromAddr);
        assert_eq!(from.first().unwrap().addr, 16);
        assert_eq!(from.len(), 4);
    }

    #[test]
    fn invalidate_is_per_pid() {
        let img = image_of(&[enc_none(Opcode::Ret)]);
        let mut cache = DisasmCache::new();
        cache.read(Pid(1), &img, 0, 1, DisasmMode::FromAddr);
        cache.read(Pid(2), &img, 0, 1, DisasmMode::FromAddr);
        cache.invalidate(Pid(1));
        assert_eq!(cache.listings.len(), 1);
    }
}
