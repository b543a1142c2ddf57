// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streamed loading: chunk-size independence, session bounds, aborts, and
//! stall reaping.

mod common;

use common::*;
use hsx_abi::{Code, EventKind, StateKind};
use hsx_kern::events::EventFilter;
use hsx_kern::exec::{ExecConfig, Executive};

/// Streams `bytes` in `chunk`-sized pieces and returns the final pid.
fn stream_in(ex: &mut Executive, bytes: &[u8], chunk: usize) -> hsx_abi::Pid {
    let pid = ex.load_stream_begin(Some(bytes.len() as u32)).unwrap();
    for piece in bytes.chunks(chunk.max(1)) {
        ex.load_stream_write(pid, piece).unwrap();
    }
    ex.load_stream_end(pid).unwrap();
    pid
}

#[test]
fn chunk_size_does_not_change_the_result() {
    let bytes = image_with(&[ldi(1, 42), brk()], b"rodata-payload", 64, None);
    let mut mono = exec();
    let mono_pid = mono.load(bytes.clone()).unwrap();
    let mono_info = mono.ps().into_iter().find(|i| i.pid == mono_pid).unwrap();

    for chunk in [1usize, 7, 256, bytes.len()] {
        let mut ex = exec();
        let pid = stream_in(&mut ex, &bytes, chunk);
        assert_eq!(ex.task_state(pid), Some(StateKind::Ready), "chunk {chunk}");
        let info = ex.ps().into_iter().find(|i| i.pid == pid).unwrap();
        assert_eq!(info.image, mono_info.image, "identity for chunk {chunk}");

        // Streamed and monolithic tasks behave identically from the first
        // instruction.
        run_until_state(&mut ex, pid, StateKind::Paused, 8);
        assert_eq!(ex.reg_get(pid, 1).unwrap(), 42);
    }
}

#[test]
fn two_kib_image_streams_in_13_byte_chunks() {
    // Pad rodata so the image is exactly 2048 bytes: 32 header + 8 code.
    let rodata = vec![0xA5u8; 2048 - 32 - 8];
    let bytes = image_with(&[ldi(1, 7), brk()], &rodata, 0, None);
    assert_eq!(bytes.len(), 2048);

    let mut ex = exec();
    let pid = stream_in(&mut ex, &bytes, 13);
    assert_eq!(ex.task_state(pid), Some(StateKind::Ready));

    let mut mono = exec();
    let mono_pid = mono.load(bytes).unwrap();
    assert_eq!(
        ex.ps().into_iter().find(|i| i.pid == pid).unwrap().image,
        mono.ps().into_iter().find(|i| i.pid == mono_pid).unwrap().image,
    );
}

#[test]
fn session_overflow_is_sticky_bounded_and_abortable() {
    let mut ex = exec_with(ExecConfig {
        max_image_bytes: 128,
        ..ExecConfig::default()
    });
    let pid = ex.load_stream_begin(None).unwrap();
    ex.load_stream_write(pid, &[0u8; 100]).unwrap();
    assert_eq!(
        ex.load_stream_write(pid, &[0u8; 100]),
        Err(Code::SessionOverflow)
    );
    // The refused bytes were not appended; the session survives and aborts
    // cleanly.
    ex.load_stream_write(pid, &[0u8; 28]).unwrap();
    ex.load_stream_abort(pid).unwrap();
    assert!(ex.ps().is_empty());
    assert_eq!(ex.load_stream_write(pid, &[0]), Err(Code::NotFound));
}

#[test]
fn begin_rejects_oversized_expectation() {
    let mut ex = exec_with(ExecConfig {
        max_image_bytes: 1024,
        ..ExecConfig::default()
    });
    assert_eq!(ex.load_stream_begin(Some(4096)), Err(Code::NoSpace));
}

#[test]
fn end_validates_like_monolithic() {
    let mut ex = exec();
    let sub = ex.events_subscribe(EventFilter::default(), None);
    let mut bytes = image_of(&[brk()]);
    let pos = bytes.len() - 1;
    bytes[pos] ^= 0x80;

    let pid = ex.load_stream_begin(None).unwrap();
    ex.load_stream_write(pid, &bytes).unwrap();
    assert_eq!(ex.load_stream_end(pid), Err(Code::BadCrc));
    assert!(ex.ps().is_empty());

    let events = ex.events_poll(sub, 256);
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::ProvisioningError {
            status: Code::BadCrc
        }
    )));
}

#[test]
fn sessions_appear_in_ps_as_loading() {
    let mut ex = exec();
    let pid = ex.load_stream_begin(None).unwrap();
    let ps = ex.ps();
    assert_eq!(ps.len(), 1);
    assert_eq!(ps[0].state, StateKind::Loading);
    assert_eq!(ex.task_state(pid), Some(StateKind::Loading));
    ex.load_stream_abort(pid).unwrap();
}

#[test]
fn stalled_sessions_are_reaped() {
    let mut ex = exec_with(ExecConfig {
        stall_timeout: 50,
        ..ExecConfig::default()
    });
    let sub = ex.events_subscribe(EventFilter::default(), None);
    let pid = ex.load_stream_begin(None).unwrap();
    ex.load_stream_write(pid, &[1, 2, 3]).unwrap();

    // Writes keep the session alive.
    ex.clock_step(40);
    ex.load_stream_write(pid, &[4]).unwrap();
    ex.clock_step(40);
    assert_eq!(ex.task_state(pid), Some(StateKind::Loading));

    // Silence past the stall deadline kills it.
    ex.clock_step(20);
    assert_eq!(ex.task_state(pid), None);
    assert_eq!(ex.load_stream_end(pid), Err(Code::NotFound));

    let events = ex.events_poll(sub, 256);
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::ProvisioningAborted {
            status: Code::Timeout
        }
    )));
}

#[test]
fn kill_aborts_an_open_session() {
    let mut ex = exec();
    let pid = ex.load_stream_begin(None).unwrap();
    ex.load_stream_write(pid, &[0; 16]).unwrap();
    ex.kill(pid).unwrap();
    assert!(ex.ps().is_empty());
}
