// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HXE image validation, construction, and streamed ingestion.
//!
//! Both load paths end in [`validate`]: the monolithic loader hands it the
//! whole byte buffer, and the streaming path hands it the assembled session
//! buffer, so a streamed image produces a task byte-identical to the same
//! image loaded monolithically.
//!
//! Validation order is fixed: magic → version → capabilities → section
//! bounds → CRC → manifest → arena budget. Nothing is allocated for a task
//! until every check has passed.

use std::sync::Arc;

use crc::{Crc, CRC_32_ISO_HDLC};
use hsx_abi::{
    CapFlags, Code, FaultInfo, HxeHeader, Manifest, MemPolicy, Timestamp,
    HXE_CRC_PREFIX_LEN, HXE_HEADER_LEN, HXE_VERSION,
};

/// The image checksum algorithm (standard CRC-32, the ISO-HDLC polynomial).
pub static HXE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the stored checksum: header bytes `0x00..0x18`, then code, then
/// rodata. The CRC field itself and any trailing manifest are not covered.
pub fn image_crc(header_prefix: &[u8], code: &[u8], rodata: &[u8]) -> u32 {
    let mut digest = HXE_CRC.digest();
    digest.update(header_prefix);
    digest.update(code);
    digest.update(rodata);
    digest.finalize()
}

/// Resource ceilings applied during validation, from the executive's
/// configuration.
#[derive(Copy, Clone, Debug)]
pub struct ImageLimits {
    /// Upper bound on the whole image byte count (shared with the streaming
    /// session bound).
    pub max_image_bytes: usize,
    /// Upper bound on the BSS arena a header may request.
    pub max_bss_bytes: u32,
}

/// A validated, immutable executable image.
///
/// The underlying buffer is shared (`Arc`) between the owning task, the
/// decoder, and the disassembler; nothing may mutate it after validation.
#[derive(Debug, PartialEq)]
pub struct CodeImage {
    header: HxeHeader,
    bytes: Vec<u8>,
    manifest: Option<Manifest>,
}

impl CodeImage {
    pub fn header(&self) -> &HxeHeader {
        &self.header
    }

    pub fn code(&self) -> &[u8] {
        let start = HXE_HEADER_LEN;
        &self.bytes[start..start + self.header.code_len as usize]
    }

    pub fn rodata(&self) -> &[u8] {
        let start = HXE_HEADER_LEN + self.header.code_len as usize;
        &self.bytes[start..start + self.header.rodata_len as usize]
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Content identity: the stored CRC plus the total byte length. This is
    /// the key any content-addressed store uses for this image, and the key
    /// the disassembly cache uses.
    pub fn identity(&self) -> (u32, u32) {
        (self.header.crc, self.bytes.len() as u32)
    }

    /// Fetches the instruction word at `pc`. The PC addresses code bytes
    /// directly; it must be word-aligned and wholly inside the code section.
    pub fn fetch_word(&self, pc: u32) -> Result<u32, FaultInfo> {
        if pc % 4 != 0 || u64::from(pc) + 4 > u64::from(self.header.code_len) {
            return Err(FaultInfo::MemoryAccess { address: Some(pc) });
        }
        let off = HXE_HEADER_LEN + pc as usize;
        Ok(u32::from_le_bytes(
            self.bytes[off..off + 4].try_into().unwrap(),
        ))
    }

    /// Builds a throwaway image for unit tests of neighboring modules.
    #[cfg(test)]
    pub fn synthetic(code: &[u8], rodata: &[u8], bss_len: u32) -> Self {
        let bytes = build_image(0, code, rodata, bss_len, CapFlags::empty(), None);
        validate(
            bytes,
            CapFlags::empty(),
            ImageLimits {
                max_image_bytes: 1 << 20,
                max_bss_bytes: 1 << 20,
            },
        )
        .expect("synthetic image must validate")
    }
}

/// Serializes a well-formed image: header (with computed CRC), code, rodata,
/// and an optional length-prefixed JSON manifest. This is the writer half of
/// the format, used by tooling and tests; [`validate`] is the reader half.
pub fn build_image(
    entry: u32,
    code: &[u8],
    rodata: &[u8],
    bss_len: u32,
    caps: CapFlags,
    manifest: Option<&Manifest>,
) -> Vec<u8> {
    let mut header = HxeHeader {
        version: HXE_VERSION,
        flags: 0,
        entry,
        code_len: code.len() as u32,
        rodata_len: rodata.len() as u32,
        bss_len,
        caps,
        crc: 0,
    };
    let mut prefix = Vec::with_capacity(HXE_HEADER_LEN);
    header.write_to(&mut prefix);
    header.crc = image_crc(&prefix[..HXE_CRC_PREFIX_LEN], code, rodata);

    let mut out = Vec::new();
    header.write_to(&mut out);
    out.extend_from_slice(code);
    out.extend_from_slice(rodata);
    if let Some(m) = manifest {
        let payload = serde_json::to_vec(m).expect("manifest serialization cannot fail");
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
    }
    out
}

/// Validates a complete image buffer and produces the immutable
/// [`CodeImage`]. Shared by the monolithic and streaming load paths.
pub fn validate(bytes: Vec<u8>, runtime_caps: CapFlags, limits: ImageLimits) -> Result<CodeImage, Code> {
    if bytes.len() > limits.max_image_bytes {
        return Err(Code::NoSpace);
    }

    let header = HxeHeader::parse(&bytes)?;
    if header.version != HXE_VERSION {
        return Err(Code::BadVersion);
    }
    if !runtime_caps.contains(header.caps & !CapFlags::RESERVED) {
        return Err(Code::CapsUnsupported);
    }

    let code_len = header.code_len as usize;
    let rodata_len = header.rodata_len as usize;
    let sections_end = HXE_HEADER_LEN
        .checked_add(code_len)
        .and_then(|n| n.checked_add(rodata_len))
        .ok_or(Code::Truncated)?;
    if bytes.len() < sections_end {
        return Err(Code::Truncated);
    }

    let computed = image_crc(
        &bytes[..HXE_CRC_PREFIX_LEN],
        &bytes[HXE_HEADER_LEN..HXE_HEADER_LEN + code_len],
        &bytes[HXE_HEADER_LEN + code_len..sections_end],
    );
    if computed != header.crc {
        log::warn!(
            "image rejected: crc mismatch (stored {:#010x}, computed {:#010x})",
            header.crc,
            computed
        );
        return Err(Code::BadCrc);
    }

    let manifest = parse_manifest(&bytes[sections_end..])?;

    if header.bss_len > limits.max_bss_bytes {
        return Err(Code::NoSpace);
    }
    // The entry PC must land on an instruction inside the code section. The
    // taxonomy has no dedicated code for this, so it reports as a truncation
    // of the section the entry was supposed to be in.
    if header.entry % 4 != 0 || header.entry >= header.code_len {
        return Err(Code::Truncated);
    }

    Ok(CodeImage {
        header,
        bytes,
        manifest,
    })
}

/// Parses the optional trailing manifest: absent, or a 4-byte little-endian
/// length followed by exactly that many bytes of JSON. Anything else is a
/// malformed image.
fn parse_manifest(tail: &[u8]) -> Result<Option<Manifest>, Code> {
    if tail.is_empty() {
        return Ok(None);
    }
    if tail.len() < 4 {
        return Err(Code::Truncated);
    }
    let declared = u32::from_le_bytes(tail[..4].try_into().unwrap()) as usize;
    let payload = &tail[4..];
    if payload.len() < declared {
        return Err(Code::Truncated);
    }
    if payload.len() > declared {
        return Err(Code::ManifestInvalid);
    }
    match serde_json::from_slice::<Manifest>(&payload[..declared]) {
        Ok(m) => Ok(Some(m)),
        Err(e) => {
            log::warn!("image rejected: manifest does not parse: {e}");
            Err(Code::ManifestInvalid)
        }
    }
}

/// Transient state of one byte-streamed load, keyed by pid in the executive.
///
/// The session exists from `begin` until `end` or `abort` (or until the
/// executive reaps it for stalling past `deadline`). Its buffer is bounded
/// by the configured maximum before any byte is accepted, so a hostile
/// stream cannot grow memory without limit.
pub struct StreamSession {
    pub expected: Option<u32>,
    pub deadline: Timestamp,
    /// Debug-access policy requested at `begin`, applied to the task at
    /// finalize.
    pub policy: MemPolicy,
    buf: Vec<u8>,
    digest: Option<crc::Digest<'static, u32>>,
}

// `crc::Digest` carries no useful state to print, and does not implement
// `Debug` itself.
impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("expected", &self.expected)
            .field("deadline", &self.deadline)
            .field("bytes_written", &self.buf.len())
            .finish()
    }
}

impl StreamSession {
    pub fn new(expected: Option<u32>, deadline: Timestamp) -> Self {
        Self {
            expected,
            deadline,
            policy: MemPolicy::default(),
            buf: Vec::new(),
            digest: Some(HXE_CRC.digest()),
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.buf.len()
    }

    /// Appends a chunk, enforcing the session bound. On overflow nothing is
    /// appended and the session stays abortable.
    pub fn write(&mut self, chunk: &[u8], max_bytes: usize) -> Result<usize, Code> {
        let new_total = self
            .buf
            .len()
            .checked_add(chunk.len())
            .ok_or(Code::SessionOverflow)?;
        if new_total > max_bytes {
            return Err(Code::SessionOverflow);
        }
        if let Some(expected) = self.expected {
            if new_total > expected as usize {
                return Err(Code::SessionOverflow);
            }
        }
        if let Some(d) = self.digest.as_mut() {
            d.update(chunk);
        }
        self.buf.extend_from_slice(chunk);
        Ok(self.buf.len())
    }

    /// Consumes the session, yielding the assembled buffer and the running
    /// CRC over every byte written (a transfer-integrity diagnostic; the
    /// image's own CRC is validated separately by [`validate`]).
    pub fn finish(mut self) -> (Vec<u8>, u32) {
        let stream_crc = self.digest.take().map(|d| d.finalize()).unwrap_or(0);
        (self.buf, stream_crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ImageLimits {
        ImageLimits {
            max_image_bytes: 64 * 1024,
            max_bss_bytes: 64 * 1024,
        }
    }

    fn sample_image() -> Vec<u8> {
        build_image(
            4,
            &[0x51, 0, 0, 0, 0x51, 0, 0, 0],
            b"ro",
            16,
            CapFlags::MAILBOX,
            None,
        )
    }

    #[test]
    fn valid_image_loads() {
        let img = validate(sample_image(), CapFlags::MAILBOX, limits()).unwrap();
        assert_eq!(img.header().entry, 4);
        assert_eq!(img.code().len(), 8);
        assert_eq!(img.rodata(), b"ro");
        assert!(img.manifest().is_none());
    }

    #[test]
    fn missing_capability_is_rejected() {
        assert_eq!(
            validate(sample_image(), CapFlags::empty(), limits()),
            Err(Code::CapsUnsupported)
        );
    }

    #[test]
    fn any_flipped_byte_fails_crc() {
        let bytes = sample_image();
        // Flip one bit in each covered range: header prefix, code, rodata.
        for &pos in &[0x08usize, HXE_HEADER_LEN + 2, HXE_HEADER_LEN + 8] {
            let mut bad = bytes.clone();
            bad[pos] ^= 0x40;
            assert_eq!(
                validate(bad, CapFlags::MAILBOX, limits()),
                Err(Code::BadCrc),
                "flip at {pos}"
            );
        }
    }

    #[test]
    fn truncation_is_detected_before_crc() {
        let bytes = sample_image();
        let short = bytes[..bytes.len() - 3].to_vec();
        assert_eq!(
            validate(short, CapFlags::MAILBOX, limits()),
            Err(Code::Truncated)
        );
    }

    #[test]
    fn manifest_length_must_be_exact() {
        let manifest = Manifest::default();
        let mut bytes = build_image(0, &[0x51, 0, 0, 0], &[], 0, CapFlags::empty(), Some(&manifest));
        // Trailing junk after the declared manifest length.
        bytes.push(0xAA);
        assert_eq!(
            validate(bytes, CapFlags::empty(), limits()),
            Err(Code::ManifestInvalid)
        );

        let mut bytes = build_image(0, &[0x51, 0, 0, 0], &[], 0, CapFlags::empty(), Some(&manifest));
        bytes.pop();
        assert_eq!(
            validate(bytes, CapFlags::empty(), limits()),
            Err(Code::Truncated)
        );
    }

    #[test]
    fn entry_must_be_inside_code() {
        let bytes = build_image(8, &[0x51, 0, 0, 0], &[], 0, CapFlags::empty(), None);
        assert_eq!(
            validate(bytes, CapFlags::empty(), limits()),
            Err(Code::Truncated)
        );
    }

    #[test]
    fn oversized_requests_are_refused() {
        let bytes = build_image(0, &[0x51, 0, 0, 0], &[], 1 << 20, CapFlags::empty(), None);
        assert_eq!(
            validate(bytes, CapFlags::empty(), limits()),
            Err(Code::NoSpace)
        );
    }

    #[test]
    fn session_enforces_bound_and_survives_overflow() {
        let mut s = StreamSession::new(None, Timestamp::from(100));
        assert_eq!(s.write(&[0; 30], 64), Ok(30));
        assert_eq!(s.write(&[0; 30], 64), Ok(60));
        assert_eq!(s.write(&[0; 5], 64), Err(Code::SessionOverflow));
        // The failed write appended nothing; the session is still usable.
        assert_eq!(s.bytes_written(), 60);
        assert_eq!(s.write(&[0; 4], 64), Ok(64));
    }

    #[test]
    fn session_expected_size_caps_writes() {
        let mut s = StreamSession::new(Some(8), Timestamp::from(100));
        assert_eq!(s.write(&[1; 8], 1024), Ok(8));
        let mut s = StreamSession::new(Some(8), Timestamp::from(100));
        assert_eq!(s.write(&[1; 9], 1024), Err(Code::SessionOverflow));
    }

    #[test]
    fn fetch_word_bounds_and_alignment() {
        let img = validate(sample_image(), CapFlags::MAILBOX, limits()).unwrap();
        assert_eq!(img.fetch_word(0).unwrap(), 0x51);
        assert!(img.fetch_word(2).is_err());
        assert!(img.fetch_word(8).is_err());
        assert!(img.fetch_word(u32::MAX - 3).is_err());
    }
}
