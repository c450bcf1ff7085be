//! Integration tests: command timers, abort by tag and escalation.

mod common;

use std::thread;
use std::time::Duration;

use common::*;
use protocol_ciss::CommandStatus;
use raidline::ControllerState;
use raidline::sim::SimConfig;

fn timed() -> raidline::ConfigBuilder {
    fast_config().abort_timeout(Duration::from_millis(100))
}

#[test]
fn expired_command_is_aborted_without_reset() {
    let f = running(SimConfig::default(), timed());
    f.sim.hold_completions(true);
    let done = sink();
    let tag = f
        .adapter
        .submit(tur().timeout(Duration::from_millis(20)), record(&done))
        .unwrap();

    assert!(wait_until(|| done.lock().len() == 1));
    let c = done.lock()[0].clone();
    assert_eq!(c.tag, tag);
    assert_eq!(c.status, CommandStatus::Aborted);

    assert!(wait_until(|| f.adapter.stats().aborted == 1));
    assert_eq!(f.adapter.stats().timeouts, 1);
    assert_eq!(f.sim.hard_resets(), 1);
    assert!(wait_until(|| f.adapter.commands_in_use() == 0));

    // Exactly once, even after the timer has had more ticks.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(done.lock().len(), 1);
}

#[test]
fn stalled_abort_escalates_to_reset() {
    let f = running(SimConfig::default(), timed());
    f.sim.hold_completions(true);
    f.sim.stall_aborts(true);
    let done = sink();
    f.adapter
        .submit(tur().timeout(Duration::from_millis(20)), record(&done))
        .unwrap();

    assert!(wait_until(|| done.lock().len() == 1));
    assert_eq!(done.lock()[0].status, CommandStatus::AdapterWasReset);
    assert!(wait_until(|| {
        f.adapter.state() == ControllerState::Operational && !f.adapter.reset_pending()
    }));
    assert_eq!(f.sim.hard_resets(), 2);
    assert_eq!(f.adapter.stats().aborted, 0);
}

#[test]
fn prompt_completion_never_times_out() {
    let f = running(SimConfig::default(), timed());
    let done = sink();
    for _ in 0..8 {
        submit_when_free(&f.adapter, tur().timeout(Duration::from_millis(50)), &done);
    }
    assert!(wait_until(|| done.lock().len() == 8));
    thread::sleep(Duration::from_millis(120));
    assert_eq!(f.adapter.stats().timeouts, 0);
    assert!(done.lock().iter().all(|c| c.is_success()));
}

#[test]
fn reset_while_abort_is_outstanding_does_not_escalate() {
    let f = running(
        SimConfig::default(),
        fast_config().abort_timeout(Duration::from_secs(5)),
    );
    f.sim.hold_completions(true);
    f.sim.stall_aborts(true);
    let done = sink();
    f.adapter
        .submit(tur().timeout(Duration::from_millis(20)), record(&done))
        .unwrap();
    let posted = f.sim.submissions();

    // The abort is on the wire and its reply never comes.
    assert!(wait_until(|| f.sim.submissions() == posted + 1));
    assert_eq!(f.adapter.stats().timeouts, 1);
    f.adapter.reset().unwrap();

    assert!(wait_until(|| done.lock().len() == 1));
    assert_eq!(done.lock()[0].status, CommandStatus::AdapterWasReset);
    assert!(wait_until(|| f.adapter.in_flight() == 0));
    assert_eq!(f.adapter.commands_in_use(), 0);

    // The drained abort is not mistaken for a stall.
    thread::sleep(Duration::from_millis(100));
    assert!(!f.adapter.reset_pending());
    assert_eq!(f.sim.hard_resets(), 2);
    assert_eq!(f.adapter.state(), ControllerState::Operational);
    assert_eq!(f.adapter.stats().aborted, 0);
}
