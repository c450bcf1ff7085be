//! Heartbeat lockup detection and firmware event polling.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use protocol_ciss::table::event;
use protocol_ciss::{Register, doorbell_in};
use tracing::{error, info, warn};

use crate::adapter::Shared;
use crate::state::{ControllerState, ResetReason};

/// Declares a lockup when the heartbeat register holds still across two
/// consecutive samples and no interrupt arrived in between.
///
/// Fires at most once until [`rearm`](Self::rearm).
#[derive(Debug)]
pub struct LockupDetector {
    interval: Duration,
    last: Option<u32>,
    armed: bool,
}

impl LockupDetector {
    pub fn new(interval: Duration) -> Self {
        LockupDetector {
            interval,
            last: None,
            armed: true,
        }
    }

    /// Feed one heartbeat sample. Returns true when a lockup is detected.
    pub fn sample(&mut self, heartbeat: u32, since_interrupt: Duration) -> bool {
        let stalled = self.armed
            && self.last == Some(heartbeat)
            && since_interrupt > self.interval;
        self.last = Some(heartbeat);
        if stalled {
            self.armed = false;
        }
        stalled
    }

    pub fn rearm(&mut self) {
        self.armed = true;
        self.last = None;
    }

    /// Forget the previous sample without re-arming.
    pub fn forget(&mut self) {
        self.last = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

pub(crate) fn run_monitor(shared: Arc<Shared>) {
    let cfg = &shared.config.watchdog;
    let mut detector = LockupDetector::new(cfg.interval);
    let mut epoch = shared.operational_epoch();
    let mut next_sample = Instant::now() + cfg.interval;

    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(cfg.event_poll.min(cfg.interval));
        if shared.state() != ControllerState::Operational {
            detector.forget();
            continue;
        }
        let current = shared.operational_epoch();
        if current != epoch {
            epoch = current;
            detector.rearm();
            next_sample = Instant::now() + cfg.interval;
        }

        poll_events(&shared);

        if !cfg.enabled || Instant::now() < next_sample {
            continue;
        }
        next_sample = Instant::now() + cfg.interval;

        let heartbeat = shared.hw.read(Register::Heartbeat);
        let idle_ms = shared
            .clock
            .now_ms()
            .saturating_sub(shared.dispatcher.last_interrupt_ms());
        if detector.sample(heartbeat, Duration::from_millis(idle_ms)) {
            shared.stats.lockup();
            error!(adapter = %shared.id, heartbeat, idle_ms, "adapter lockup detected, forcing reset");
            shared.requests.reset(ResetReason::Lockup);
        }
    }
}

fn poll_events(shared: &Shared) {
    let events = {
        let table = shared.memory.table();
        table.event_notify & table.event_notify_mask
    };
    if events == 0 {
        return;
    }
    shared.hw.write(Register::DoorbellIn, doorbell_in::EVENT_ACK);
    if events & event::ERROR_LOG != 0 {
        warn!(adapter = %shared.id, "firmware logged an error");
    }
    if events & event::RESCAN != 0 {
        info!(adapter = %shared.id, events = format_args!("{events:#x}"), "device change notification");
        shared.requests.rescan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[test]
    fn advancing_heartbeat_is_healthy() {
        let mut d = LockupDetector::new(INTERVAL);
        for hb in 0..10 {
            assert!(!d.sample(hb, Duration::from_secs(5)));
        }
    }

    #[test]
    fn recent_interrupt_masks_stalled_heartbeat() {
        let mut d = LockupDetector::new(INTERVAL);
        assert!(!d.sample(7, Duration::ZERO));
        assert!(!d.sample(7, Duration::from_millis(10)));
    }

    #[test]
    fn fires_once_until_rearmed() {
        let mut d = LockupDetector::new(INTERVAL);
        let idle = Duration::from_millis(250);
        assert!(!d.sample(7, idle));
        assert!(d.sample(7, idle));
        assert!(!d.is_armed());
        assert!(!d.sample(7, idle));
        assert!(!d.sample(7, idle));

        d.rearm();
        // Needs two fresh samples again.
        assert!(!d.sample(7, idle));
        assert!(d.sample(7, idle));
    }

    #[test]
    fn forget_requires_two_new_samples() {
        let mut d = LockupDetector::new(INTERVAL);
        let idle = Duration::from_millis(250);
        d.sample(3, idle);
        d.forget();
        assert!(!d.sample(3, idle));
        assert!(d.sample(3, idle));
    }
}
