//! Integration tests: start, I/O, shutdown and the registry.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::*;
use protocol_ciss::{CommandStatus, LunAddress, SgEntry};
use raidline::sim::SimConfig;
use raidline::{
    AdapterRegistry, ControllerState, InterruptMode, IrqReturn, Operation, SubmitError,
    TransportMode,
};

#[test]
fn start_reaches_operational() {
    let f = running(SimConfig::default(), fast_config());
    assert_eq!(f.adapter.state(), ControllerState::Operational);
    assert_eq!(f.adapter.transport_mode(), TransportMode::Performant);
    assert_eq!(f.sim.hard_resets(), 1);
    assert!(f.sim.host_time() > 0);
    assert_eq!(f.adapter.stats().resets, 1);
}

#[test]
fn submit_before_start_is_busy() {
    let f = attach(SimConfig::default(), fast_config());
    let done = sink();
    assert_eq!(
        f.adapter.submit(tur(), record(&done)).unwrap_err(),
        SubmitError::Busy
    );
    assert_eq!(f.adapter.stats().rejected_busy, 1);
    assert_eq!(f.sim.submissions(), 0);
}

#[test]
fn commands_complete_once_each() {
    let f = running(SimConfig::default(), fast_config());
    let done = sink();
    let mut tags = HashSet::new();
    for _ in 0..40 {
        tags.insert(submit_when_free(&f.adapter, tur(), &done));
    }
    assert!(wait_until(|| done.lock().len() == 40));
    assert!(done.lock().iter().all(|c| c.status == CommandStatus::Success));
    assert!(wait_until(|| f.adapter.in_flight() == 0));
    assert_eq!(f.adapter.commands_in_use(), 0);
    // Slots are reused; the generation keeps every tag distinct.
    assert_eq!(tags.len(), 40);
}

#[test]
fn in_flight_tags_are_distinct_and_pool_is_bounded() {
    let f = running(SimConfig::default(), fast_config());
    f.sim.hold_completions(true);
    let done = sink();

    let tags: HashSet<_> = (0..16)
        .map(|_| f.adapter.submit(tur(), record(&done)).unwrap())
        .collect();
    assert_eq!(tags.len(), 16);
    assert_eq!(
        f.adapter.submit(tur(), record(&done)).unwrap_err(),
        SubmitError::PoolExhausted
    );
    assert_eq!(f.adapter.stats().pool_exhausted, 1);
    assert_eq!(f.sim.held(), 16);

    assert_eq!(f.sim.release_held(), 16);
    assert!(wait_until(|| done.lock().len() == 16));
    assert!(wait_until(|| f.adapter.commands_in_use() == 0));
    assert!(f.adapter.submit(tur(), record(&done)).is_ok());
}

#[test]
fn simple_transport_when_performant_declined() {
    let f = running(
        SimConfig::default(),
        fast_config().prefer_performant(false),
    );
    assert_eq!(f.adapter.transport_mode(), TransportMode::Simple);
    let done = sink();
    for _ in 0..5 {
        f.adapter.submit(read(2), record(&done)).unwrap();
    }
    assert!(wait_until(|| done.lock().len() == 5));
    assert!(done.lock().iter().all(|c| c.is_success()));
    assert_eq!(f.sim.last_bucket(), None);
}

#[test]
fn firmware_without_performant_falls_back() {
    let sim = SimConfig {
        performant: false,
        ..SimConfig::default()
    };
    let f = running(sim, fast_config());
    assert_eq!(f.adapter.transport_mode(), TransportMode::Simple);
}

#[test]
fn submission_carries_smallest_fitting_bucket() {
    let f = running(SimConfig::default(), fast_config());
    let done = sink();
    f.adapter.submit(read(3), record(&done)).unwrap();
    assert!(wait_until(|| done.lock().len() == 1));
    assert!(done.lock()[0].is_success());
    // 3 entries + 4 header blocks fits the 8-block bucket.
    assert_eq!(f.sim.last_bucket(), Some(2));
}

#[test]
fn scatter_list_beyond_limit_is_rejected_locally() {
    let f = running(SimConfig::default(), fast_config().max_sg_entries(4));
    let done = sink();
    let before = f.sim.submissions();
    assert!(matches!(
        f.adapter.submit(read(5), record(&done)),
        Err(SubmitError::InvalidRequest(_))
    ));
    assert_eq!(f.sim.submissions(), before);
    assert_eq!(f.adapter.commands_in_use(), 0);
}

#[test]
fn oversized_transfer_is_rejected_without_leaking_a_block() {
    let f = running(SimConfig::default(), fast_config());
    let done = sink();
    let before = f.sim.submissions();
    let huge = Operation::new(LunAddress::logical(0), &[0x28]).read(vec![
        SgEntry::new(0x1000, u32::MAX),
        SgEntry::new(0x2000, 4096),
    ]);
    assert_eq!(
        f.adapter.submit(huge, record(&done)).unwrap_err(),
        SubmitError::InvalidRequest("total transfer length exceeds u32")
    );
    assert_eq!(f.sim.submissions(), before);
    assert_eq!(f.adapter.commands_in_use(), 0);

    f.adapter.submit(read(2), record(&done)).unwrap();
    assert!(wait_until(|| done.lock().len() == 1));
    assert!(done.lock()[0].is_success());
}

#[test]
fn transient_status_is_retried_with_same_tag() {
    let f = running(SimConfig::default(), fast_config().busy_retries(3));
    f.sim.script_status(CommandStatus::TargetBusy);
    f.sim.script_status(CommandStatus::UnitAttention);
    let done = sink();
    let tag = f.adapter.submit(tur(), record(&done)).unwrap();

    assert!(wait_until(|| done.lock().len() == 1));
    let c = done.lock()[0].clone();
    assert_eq!(c.status, CommandStatus::Success);
    assert_eq!(c.tag, tag);
    assert_eq!(f.adapter.stats().transient_retries, 2);
}

#[test]
fn transient_retries_are_bounded() {
    let f = running(SimConfig::default(), fast_config().busy_retries(2));
    for _ in 0..3 {
        f.sim.script_status(CommandStatus::TargetBusy);
    }
    let done = sink();
    f.adapter.submit(tur(), record(&done)).unwrap();
    assert!(wait_until(|| done.lock().len() == 1));
    assert_eq!(done.lock()[0].status, CommandStatus::TargetBusy);
    assert_eq!(f.adapter.stats().transient_retries, 2);
}

#[test]
fn hardware_error_is_delivered() {
    let f = running(SimConfig::default(), fast_config());
    f.sim.script_status(CommandStatus::HardwareError);
    let done = sink();
    f.adapter.submit(tur(), record(&done)).unwrap();
    assert!(wait_until(|| done.lock().len() == 1));
    assert_eq!(done.lock()[0].status, CommandStatus::HardwareError);
    assert_eq!(f.adapter.stats().transient_retries, 0);
}

#[test]
fn msix_queues_complete() {
    let f = running(
        SimConfig::default(),
        fast_config()
            .interrupt_mode(InterruptMode::MsiX)
            .reply_queues(4),
    );
    let done = sink();
    for _ in 0..32 {
        submit_when_free(&f.adapter, tur(), &done);
    }
    assert!(wait_until(|| done.lock().len() == 32));
}

#[test]
fn spurious_shared_interrupt_is_not_claimed() {
    let f = running(
        SimConfig::default(),
        fast_config().interrupt_mode(InterruptMode::Intx),
    );
    assert!(wait_until(|| f.adapter.in_flight() == 0));
    assert_eq!(f.adapter.interrupt(0), IrqReturn::None);
    assert_eq!(f.adapter.state(), ControllerState::Operational);
}

#[test]
fn shutdown_quiesces_to_unknown() {
    let f = running(SimConfig::default(), fast_config());
    let done = sink();
    f.adapter.submit(tur(), record(&done)).unwrap();
    assert!(wait_until(|| done.lock().len() == 1));

    f.adapter.shutdown().unwrap();
    assert_eq!(f.adapter.state(), ControllerState::Unknown);
    assert_eq!(
        f.adapter.submit(tur(), record(&done)).unwrap_err(),
        SubmitError::Busy
    );
    // A second shutdown is a no-op and the adapter can start again.
    f.adapter.shutdown().unwrap();
    f.adapter.start().unwrap();
    assert_eq!(f.adapter.state(), ControllerState::Operational);
}

#[test]
fn shutdown_fails_commands_that_never_finish() {
    let f = running(SimConfig::default(), {
        let mut b = fast_config();
        b.config_mut().reset.shutdown_timeout = std::time::Duration::from_millis(20);
        b
    });
    f.sim.hold_completions(true);
    let done = sink();
    f.adapter.submit(tur(), record(&done)).unwrap();
    f.adapter.shutdown().unwrap();
    assert_eq!(done.lock().len(), 1);
    assert_eq!(done.lock()[0].status, CommandStatus::NoConnection);
}

#[test]
fn registry_reuses_lowest_free_id() {
    let registry = AdapterRegistry::new(4);
    let host = Arc::new(RecordingHost::default());
    let attach = || {
        registry
            .attach(
                raidline::sim::SimAdapter::new(SimConfig::default()),
                fast_config().build().unwrap(),
                host.clone(),
            )
            .unwrap()
    };

    let a = attach();
    let b = attach();
    assert_eq!((a.id().0, b.id().0), (0, 1));
    a.start().unwrap();

    registry.detach(a.id()).unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.get(a.id()).is_none());
    assert_eq!(attach().id().0, 0);
    assert!(registry.detach(raidline::AdapterId(3)).is_err());
}
