// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task data memory: arenas, bounds checks, and typed accessors.
//!
//! A task sees a fixed data address map:
//!
//! ```text
//! 0x1000_0000  rodata   read-only, backed by the code image
//! 0x2000_0000  data/BSS read-write, zero-initialized at load
//! 0x3000_0000  stack    read-write; SP starts at the top and grows down
//! ```
//!
//! Code is not part of this map: the PC addresses the code section directly
//! and instruction fetch goes through [`crate::image::CodeImage`]. Every
//! access here is validated against the region table before any byte moves;
//! a miss or an alignment violation produces a [`FaultInfo`] value, never a
//! panic. Word and half-word accesses require natural alignment and are
//! little-endian, matching the wire format.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use hsx_abi::FaultInfo;

use crate::image::CodeImage;

pub const RODATA_BASE: u32 = 0x1000_0000;
pub const DATA_BASE: u32 = 0x2000_0000;
pub const STACK_BASE: u32 = 0x3000_0000;

/// The arenas of one task.
#[derive(Debug)]
pub struct TaskMemory {
    /// Shared with the decoder and disassembler; rodata reads resolve into
    /// this image.
    image: Arc<CodeImage>,
    data: Vec<u8>,
    stack: Vec<u8>,
}

impl TaskMemory {
    pub fn new(image: Arc<CodeImage>, stack_len: u32) -> Self {
        let bss = image.header().bss_len as usize;
        Self {
            image,
            data: vec![0; bss],
            stack: vec![0; stack_len as usize],
        }
    }

    /// Address one past the highest stack byte; the initial SP.
    pub fn stack_top(&self) -> u32 {
        STACK_BASE + self.stack.len() as u32
    }

    /// Rewinds data and stack to their load-time (all-zero) contents, for a
    /// task restart. The rodata backing is immutable and needs no reset.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.stack.fill(0);
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, FaultInfo> {
        Ok(self.region(addr, 1)?[0])
    }

    pub fn read_u16(&self, addr: u32) -> Result<u16, FaultInfo> {
        self.check_align(addr, 2)?;
        Ok(LittleEndian::read_u16(self.region(addr, 2)?))
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, FaultInfo> {
        self.check_align(addr, 4)?;
        Ok(LittleEndian::read_u32(self.region(addr, 4)?))
    }

    pub fn write_u8(&mut self, addr: u32, v: u8) -> Result<(), FaultInfo> {
        self.region_mut(addr, 1)?[0] = v;
        Ok(())
    }

    pub fn write_u16(&mut self, addr: u32, v: u16) -> Result<(), FaultInfo> {
        self.check_align(addr, 2)?;
        LittleEndian::write_u16(self.region_mut(addr, 2)?, v);
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u32, v: u32) -> Result<(), FaultInfo> {
        self.check_align(addr, 4)?;
        LittleEndian::write_u32(self.region_mut(addr, 4)?, v);
        Ok(())
    }

    /// Byte-wise read for SVC marshalling and the debug surface. No
    /// alignment requirement, but the whole range must fall inside a single
    /// region.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, FaultInfo> {
        Ok(self.region(addr, len)?.to_vec())
    }

    /// Byte-wise write for SVC marshalling and the debug surface.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FaultInfo> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| FaultInfo::MemoryAccess { address: Some(addr) })?;
        self.region_mut(addr, len)?.copy_from_slice(bytes);
        Ok(())
    }

    fn check_align(&self, addr: u32, natural: u32) -> Result<(), FaultInfo> {
        if addr % natural != 0 {
            Err(FaultInfo::MemoryAccess {
                address: Some(addr),
            })
        } else {
            Ok(())
        }
    }

    /// Resolves `addr..addr+len` to a readable slice. Zero-length ranges are
    /// accepted anywhere a region starts, like any other in-bounds range.
    fn region(&self, addr: u32, len: u32) -> Result<&[u8], FaultInfo> {
        let fault = FaultInfo::MemoryAccess {
            address: Some(addr),
        };
        let rodata = self.image.rodata();
        if let Some(r) = slice_of(rodata, RODATA_BASE, addr, len) {
            return Ok(r);
        }
        if let Some(r) = slice_of(&self.data, DATA_BASE, addr, len) {
            return Ok(r);
        }
        if let Some(r) = slice_of(&self.stack, STACK_BASE, addr, len) {
            return Ok(r);
        }
        Err(fault)
    }

    /// Resolves `addr..addr+len` to a writable slice. Rodata is never
    /// writable, so a store into it lands on the fault path by falling
    /// through the region table.
    fn region_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], FaultInfo> {
        let fault = FaultInfo::MemoryAccess {
            address: Some(addr),
        };
        if let Some(range) = range_of(self.data.len(), DATA_BASE, addr, len) {
            return Ok(&mut self.data[range]);
        }
        if let Some(range) = range_of(self.stack.len(), STACK_BASE, addr, len) {
            return Ok(&mut self.stack[range]);
        }
        Err(fault)
    }
}

fn range_of(region_len: usize, base: u32, addr: u32, len: u32) -> Option<core::ops::Range<usize>> {
    let off = addr.checked_sub(base)? as usize;
    let end = off.checked_add(len as usize)?;
    if end <= region_len {
        Some(off..end)
    } else {
        None
    }
}

fn slice_of<'a>(region: &'a [u8], base: u32, addr: u32, len: u32) -> Option<&'a [u8]> {
    range_of(region.len(), base, addr, len).map(|r| &region[r])
}
