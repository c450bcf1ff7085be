//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use protocol_ciss::{LunAddress, LunEntry, SgEntry, Tag};
use raidline::sim::{SimAdapter, SimConfig};
use raidline::{
    Adapter, AdapterId, Completion, ConfigBuilder, DeviceInfo, Operation, UnitHandle, UnitHost,
};

// ── Config ──────────────────────────────────────────────────────────

/// Small pool, millisecond polling, watchdog off.
pub fn fast_config() -> ConfigBuilder {
    ConfigBuilder::new()
        .commands(16)
        .internal_commands(4)
        .reply_queues(2)
        .reset_polls(Duration::from_millis(1), 50, 500)
        .reset_backoff(Duration::from_millis(1))
        .alert_timeout(Duration::from_millis(20))
        .internal_timeout(Duration::from_millis(500))
        .watchdog(false)
        .event_poll_interval(Duration::from_millis(5))
        .timer_tick(Duration::from_millis(5))
}

// ── Host ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Attach(LunAddress),
    Changed(LunAddress),
    Detach(LunAddress),
}

/// Unit host that accepts every device and logs what it was asked to do.
#[derive(Default)]
pub struct RecordingHost {
    next: AtomicU64,
    units: Mutex<BTreeMap<u64, LunAddress>>,
    log: Mutex<Vec<Record>>,
}

impl RecordingHost {
    pub fn live(&self) -> BTreeSet<LunAddress> {
        self.units.lock().values().copied().collect()
    }

    pub fn log(&self) -> Vec<Record> {
        self.log.lock().clone()
    }

    pub fn count(&self, record: &Record) -> usize {
        self.log.lock().iter().filter(|r| *r == record).count()
    }
}

impl UnitHost for RecordingHost {
    fn attach(&self, _adapter: AdapterId, device: &DeviceInfo) -> Option<UnitHandle> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.units.lock().insert(id, device.address);
        self.log.lock().push(Record::Attach(device.address));
        Some(UnitHandle(id))
    }

    fn changed(&self, _unit: UnitHandle, device: &DeviceInfo) {
        self.log.lock().push(Record::Changed(device.address));
    }

    fn detach(&self, unit: UnitHandle) {
        if let Some(address) = self.units.lock().remove(&unit.0) {
            self.log.lock().push(Record::Detach(address));
        }
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

pub struct Fixture {
    pub sim: Arc<SimAdapter>,
    pub host: Arc<RecordingHost>,
    pub adapter: Arc<Adapter>,
}

/// Build an adapter over a fresh simulator without starting it.
pub fn attach(sim_config: SimConfig, config: ConfigBuilder) -> Fixture {
    let sim = SimAdapter::new(sim_config);
    let host = Arc::new(RecordingHost::default());
    let adapter = Adapter::new(
        AdapterId(0),
        sim.clone(),
        config.build().unwrap(),
        host.clone(),
    )
    .unwrap();
    Fixture {
        sim,
        host,
        adapter: Arc::new(adapter),
    }
}

/// Build and start.
pub fn running(sim_config: SimConfig, config: ConfigBuilder) -> Fixture {
    let f = attach(sim_config, config);
    f.adapter.start().unwrap();
    f
}

// ── Commands ────────────────────────────────────────────────────────

pub type Sink = Arc<Mutex<Vec<Completion>>>;

pub fn sink() -> Sink {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn record(sink: &Sink) -> impl FnOnce(Completion) + Send + 'static {
    let sink = sink.clone();
    move |c| sink.lock().push(c)
}

/// TEST UNIT READY to logical volume 0.
pub fn tur() -> Operation {
    Operation::new(LunAddress::logical(0), &[0x00])
}

/// READ(10) with `segments` scatter entries.
pub fn read(segments: usize) -> Operation {
    let sg = (0..segments)
        .map(|i| SgEntry::new(0x8000_0000 + (i as u64) * 4096, 4096))
        .collect();
    Operation::new(LunAddress::logical(0), &[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0]).read(sg)
}

/// Submit `op`, waiting for a free block if completions are still being
/// retired.
pub fn submit_when_free(adapter: &Adapter, op: Operation, sink: &Sink) -> Tag {
    let capacity = adapter.config().pool.commands as usize;
    assert!(wait_until(|| adapter.commands_in_use() < capacity));
    adapter.submit(op, record(sink)).unwrap()
}

pub fn volume(id: u16) -> LunEntry {
    LunEntry::new(LunAddress::logical(id), 0x00).with_raid_level(1)
}

pub fn disk(target: u8) -> LunEntry {
    LunEntry::new(LunAddress::physical(0, target, 0), 0x00)
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Poll `cond` every millisecond for up to five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
