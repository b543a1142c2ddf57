// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event-bus behavior through the executive: monotonic sequencing, filter
//! narrowing, and back-pressure that coalesces progress events while never
//! losing state events.

mod common;

use common::*;
use hsx_abi::{EventKind, EventTag, StateKind};
use hsx_kern::events::EventFilter;
use hsx_kern::exec::ExecConfig;

#[test]
fn sequences_are_strictly_monotonic_across_subsystems() {
    let mut ex = exec();
    let sub = ex.events_subscribe(EventFilter::default(), None);

    // Mix loader, scheduler, mailbox, and debug activity.
    let pid = load(&mut ex, &[ldi(1, 1), brk()]);
    let h = ex
        .mailbox_bind("shared:q", Some(2), hsx_abi::MailboxMode::empty())
        .unwrap();
    ex.mailbox_send(h, vec![1]);
    ex.clock_step(4);
    ex.kill(pid).unwrap();

    let events = ex.events_poll(sub, 1024);
    assert!(events.len() >= 4);
    for pair in events.windows(2) {
        assert!(
            pair[0].seq < pair[1].seq,
            "non-monotonic: {:?} then {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn pid_filters_narrow_but_pass_global_events() {
    let mut ex = exec();
    let a = load(&mut ex, &[brk()]);
    let sub = ex.events_subscribe(
        EventFilter {
            tags: None,
            pids: Some([a].into_iter().collect()),
        },
        None,
    );
    let b = load(&mut ex, &[brk()]);
    ex.clock_step(4);

    let events = ex.events_poll(sub, 256);
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.pid.is_none() || e.pid == Some(a)));
    let _ = b;
}

#[test]
fn trace_flood_coalesces_but_state_events_survive() {
    let mut ex = exec_with(ExecConfig {
        event_backlog: 4,
        ..ExecConfig::default()
    });
    let sub = ex.events_subscribe(EventFilter::default(), Some(4));

    // A tight loop with tracing on floods trace_step; the task then exits,
    // which must come through regardless of the flood.
    let mut words = vec![ldi(2, 1)];
    for _ in 0..40 {
        words.push(alu(hsx_abi::isa::Opcode::Add, 1, 1, 2));
    }
    words.extend(exit_seq(0));
    let pid = ex.load(image_of(&words)).unwrap();
    ex.trace_enable(pid, true).unwrap();
    run_until_state(&mut ex, pid, StateKind::Stopped, 128);

    let events = ex.events_poll(sub, 4096);
    let traces = events
        .iter()
        .filter(|e| e.kind.tag() == EventTag::TraceStep)
        .count();
    let overruns: Vec<u64> = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Overrun { lost } => Some(lost),
            _ => None,
        })
        .collect();
    assert!(traces <= 8, "flood was not coalesced: {traces} trace events");
    assert_eq!(overruns.len(), 1, "exactly one overrun marker");
    assert!(overruns[0] > 0);

    // Both lifecycle transitions (load -> Ready, exit -> Stopped) made it.
    let states: Vec<StateKind> = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::TaskState { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert!(states.contains(&StateKind::Ready));
    assert!(states.contains(&StateKind::Stopped));

    // The newest trace event survived the coalescing.
    let last_trace = events
        .iter()
        .rev()
        .find(|e| e.kind.tag() == EventTag::TraceStep)
        .expect("newest trace retained");
    match &last_trace.kind {
        EventKind::TraceStep { regs, .. } => assert_eq!(regs.regs[1], 40),
        _ => unreachable!(),
    }
}

#[test]
fn ack_and_unsubscribe_bookkeeping() {
    let mut ex = exec();
    let sub = ex.events_subscribe(EventFilter::default(), None);
    load(&mut ex, &[brk()]);
    let events = ex.events_poll(sub, 16);
    assert!(!events.is_empty());
    ex.events_ack(sub, events.last().unwrap().seq);
    assert!(ex.events_unsubscribe(sub));
    assert!(!ex.events_unsubscribe(sub));
    assert!(ex.events_poll(sub, 16).is_empty());
}
