//! The controller thread.
//!
//! Every lifecycle change (start, reset, rescan, shutdown) is a
//! [`ControlRequest`] processed serially on one thread per adapter. A reset
//! sequence walks the state machine stage by stage until it settles in
//! `Operational` or `Dead`; each stage reports the event that drives the
//! next transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use protocol_ciss::table::{event, transport};
use protocol_ciss::{
    CommandStatus, FirmwareState, Register, RequestKind, doorbell_in, doorbell_out, interrupt,
};
use tracing::{debug, error, info, warn};

use crate::adapter::Shared;
use crate::command::Completion;
use crate::error::Error;
use crate::fetch::BucketTable;
use crate::metrics::ADAPTERS_DEAD;
use crate::reconcile::{self, ReconcileReport};
use crate::state::{ControllerState, Event, ResetReason, transition};
use crate::transport::TransportMode;

const CONTROL_POLL: Duration = Duration::from_millis(100);

pub(crate) type Reply<T> = Option<Sender<Result<T, Error>>>;

pub(crate) enum ControlRequest {
    Start(Reply<()>),
    Reset {
        reason: ResetReason,
        reply: Reply<()>,
    },
    Rescan(Reply<ReconcileReport>),
    Shutdown(Reply<()>),
}

/// Sending side of the control channel, with coalescing for requests
/// raised from interrupt and monitor context.
pub(crate) struct Requests {
    tx: Sender<ControlRequest>,
    reset_pending: AtomicBool,
    rescan_pending: AtomicBool,
}

impl Requests {
    pub fn new(tx: Sender<ControlRequest>) -> Self {
        Requests {
            tx,
            reset_pending: AtomicBool::new(false),
            rescan_pending: AtomicBool::new(false),
        }
    }

    pub fn send(&self, request: ControlRequest) -> Result<(), Error> {
        self.tx.send(request).map_err(|_| Error::Disconnected)
    }

    /// Queue a reset unless one is already queued or running.
    pub fn reset(&self, reason: ResetReason) {
        if self.reset_pending.swap(true, Ordering::AcqRel) {
            debug!(?reason, "reset already pending");
            return;
        }
        if self.send(ControlRequest::Reset { reason, reply: None }).is_err() {
            self.reset_pending.store(false, Ordering::Release);
        }
    }

    /// Queue a rescan unless one is already queued.
    pub fn rescan(&self) {
        if self.rescan_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.send(ControlRequest::Rescan(None)).is_err() {
            self.rescan_pending.store(false, Ordering::Release);
        }
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    fn reset_settled(&self) {
        self.reset_pending.store(false, Ordering::Release);
    }

    fn rescan_started(&self) {
        self.rescan_pending.store(false, Ordering::Release);
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, Error>) {
    match reply {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            if let Err(e) = result {
                debug!(error = %e, "unsolicited control request failed");
            }
        }
    }
}

pub(crate) struct Controller {
    shared: Arc<Shared>,
    requests: Receiver<ControlRequest>,
    ready: Receiver<()>,
    /// Hard and soft reset attempts in the current sequence.
    attempts: u32,
    soft_failed: bool,
}

impl Controller {
    pub fn new(
        shared: Arc<Shared>,
        requests: Receiver<ControlRequest>,
        ready: Receiver<()>,
    ) -> Self {
        Controller {
            shared,
            requests,
            ready,
            attempts: 0,
            soft_failed: false,
        }
    }

    pub fn run(mut self) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            match self.requests.recv_timeout(CONTROL_POLL) {
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Start(reply) => {
                let result = self.start();
                respond(reply, result);
            }
            ControlRequest::Reset { reason, reply } => {
                let result = self.reset(reason);
                self.shared.requests.reset_settled();
                respond(reply, result);
            }
            ControlRequest::Rescan(reply) => {
                self.shared.requests.rescan_started();
                let result = self.rescan();
                respond(reply, result);
            }
            ControlRequest::Shutdown(reply) => {
                let result = self.shutdown();
                respond(reply, result);
            }
        }
    }

    fn state(&self) -> ControllerState {
        self.shared.state()
    }

    fn fire(&self, event: Event) -> Result<ControllerState, Error> {
        let mut state = self.shared.state.write();
        let next = transition(*state, event)?;
        debug!(adapter = %self.shared.id, from = ?*state, to = ?next, ?event, "state transition");
        *state = next;
        Ok(next)
    }

    fn start(&mut self) -> Result<(), Error> {
        match self.state() {
            ControllerState::Unknown => {
                self.fire(Event::Start)?;
                self.run_sequence(ResetReason::Start)
            }
            ControllerState::Operational => Ok(()),
            ControllerState::Dead => Err(Error::Dead),
            state => Err(Error::NotOperational(state)),
        }
    }

    fn reset(&mut self, reason: ResetReason) -> Result<(), Error> {
        match self.state() {
            ControllerState::Operational => {
                self.fire(reason.event())?;
            }
            ControllerState::Unknown if reason == ResetReason::Requested => {
                self.fire(Event::ResetRequested)?;
            }
            ControllerState::Dead => return Err(Error::Dead),
            state => {
                debug!(adapter = %self.shared.id, ?reason, ?state, "reset request ignored");
                return Err(Error::NotOperational(state));
            }
        }
        self.run_sequence(reason)
    }

    fn run_sequence(&mut self, reason: ResetReason) -> Result<(), Error> {
        info!(adapter = %self.shared.id, ?reason, "reset sequence started");
        self.shared.stats.reset_started();
        self.attempts = 0;
        self.soft_failed = false;

        loop {
            let event = match self.state() {
                ControllerState::ResetAlert => self.reset_alert(),
                ControllerState::HardReset => self.hard_reset(),
                ControllerState::SoftReset => self.soft_reset(),
                ControllerState::BringUp => self.bring_up(),
                ControllerState::Operational => {
                    self.on_operational();
                    return Ok(());
                }
                ControllerState::Dead => {
                    self.on_dead();
                    return Err(Error::Dead);
                }
                state @ (ControllerState::Unknown | ControllerState::BringDown) => {
                    return Err(Error::NotOperational(state));
                }
            };
            self.fire(event)?;
        }
    }

    // ── Reset stages ─────────────────────────────────────────────────

    fn reset_alert(&mut self) -> Event {
        let hw = &self.shared.hw;
        hw.write(Register::InterruptMask, interrupt::ALL);
        hw.write(Register::DoorbellIn, doorbell_in::RESET_ALERT);

        let deadline = Instant::now() + self.shared.config.reset.alert_timeout;
        loop {
            if hw.read(Register::DoorbellOut) & doorbell_out::ALERT_ACK != 0 {
                return Event::AlertCleared;
            }
            if Instant::now() >= deadline {
                warn!(adapter = %self.shared.id, "reset alert not acknowledged");
                return Event::AlertTimedOut;
            }
            thread::sleep(self.shared.config.reset.poll_interval);
        }
    }

    fn hard_reset(&mut self) -> Event {
        let cfg = &self.shared.config.reset;
        if self.attempts >= cfg.max_attempts {
            return Event::RetriesExhausted;
        }
        if self.attempts > 0 {
            thread::sleep(cfg.backoff * self.attempts);
        }
        if cfg.prefer_soft_reset
            && !self.soft_failed
            && self.shared.memory.table().supports(transport::SOFT_RESET)
        {
            return Event::SoftResetSelected;
        }

        self.attempts += 1;
        info!(adapter = %self.shared.id, attempt = self.attempts, "hard reset");
        self.shared
            .hw
            .write(Register::DoorbellIn, doorbell_in::HARD_RESET);
        match self.await_restart() {
            Ok(()) => {
                self.drain_after_reset();
                Event::ResetSucceeded
            }
            Err(e) => {
                warn!(adapter = %self.shared.id, attempt = self.attempts, error = %e, "hard reset failed");
                self.shared.stats.reset_failed();
                Event::ResetFailed
            }
        }
    }

    fn soft_reset(&mut self) -> Event {
        self.attempts += 1;
        info!(adapter = %self.shared.id, attempt = self.attempts, "soft reset");
        self.shared
            .hw
            .write(Register::DoorbellIn, doorbell_in::SOFT_RESET);
        match self.await_restart() {
            Ok(()) => {
                self.drain_after_reset();
                Event::ResetSucceeded
            }
            Err(e) => {
                warn!(adapter = %self.shared.id, error = %e, "soft reset failed, falling back to hard reset");
                self.shared.stats.reset_failed();
                self.soft_failed = true;
                Event::ResetFailed
            }
        }
    }

    /// Wait for the firmware to leave ready and come back.
    fn await_restart(&self) -> Result<(), Error> {
        let cfg = &self.shared.config.reset;
        let hw = &self.shared.hw;
        while self.ready.try_recv().is_ok() {}

        let mut restarted = false;
        for _ in 0..cfg.not_ready_polls {
            match FirmwareState::from_raw(hw.read(Register::ScratchPad)) {
                FirmwareState::Ready => thread::sleep(cfg.poll_interval),
                FirmwareState::Faulted(code) => {
                    return Err(Error::Reset(format!("firmware fault {code:#06x}")));
                }
                _ => {
                    restarted = true;
                    break;
                }
            }
        }
        if !restarted {
            return Err(Error::Reset("firmware never left ready".into()));
        }

        for _ in 0..cfg.ready_polls {
            match FirmwareState::from_raw(hw.read(Register::ScratchPad)) {
                FirmwareState::Ready => return Ok(()),
                FirmwareState::Faulted(code) => {
                    return Err(Error::Reset(format!("firmware fault {code:#06x}")));
                }
                _ => {
                    let _ = self.ready.recv_timeout(cfg.poll_interval);
                }
            }
        }
        Err(Error::Reset("firmware did not become ready".into()))
    }

    fn drain_after_reset(&self) {
        let drained = drain(&self.shared, CommandStatus::AdapterWasReset);
        if drained > 0 {
            info!(adapter = %self.shared.id, drained, "in-flight commands completed after reset");
        }
    }

    fn bring_up(&mut self) -> Event {
        match self.negotiate() {
            Ok(()) => Event::BringUpComplete,
            Err(e) => {
                warn!(adapter = %self.shared.id, error = %e, "bring-up failed");
                self.shared
                    .hw
                    .write(Register::InterruptMask, interrupt::ALL);
                Event::BringUpFailed
            }
        }
    }

    fn negotiate(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let cfg = &shared.config;
        let table = shared.memory.table().clone();
        table.validate()?;

        let max_sg = cfg.transport.max_sg_entries.min(table.max_sg_entries as usize);
        if max_sg == 0 {
            return Err(Error::BringUp("firmware reports no scatter-gather entries".into()));
        }
        if (table.max_queue_depth as usize) < shared.pool.capacity() {
            warn!(
                adapter = %shared.id,
                queue_depth = table.max_queue_depth,
                commands = shared.pool.capacity(),
                "firmware queue depth below configured command count"
            );
        }

        let mode = if cfg.transport.prefer_performant && table.supports(transport::PERFORMANT) {
            TransportMode::Performant
        } else {
            TransportMode::Simple
        };
        let queues = match mode {
            TransportMode::Simple => 1,
            TransportMode::Performant => shared
                .memory
                .queues()
                .min(table.reply_queue_count as usize)
                .max(1),
        };
        let buckets = BucketTable::build(&cfg.transport.fetch_thresholds, max_sg as u16)?;
        let request = match mode {
            TransportMode::Simple => transport::SIMPLE,
            TransportMode::Performant => transport::PERFORMANT,
        };

        shared.transport.reset_rings();
        {
            let mut t = shared.memory.table();
            t.transport_request = request;
            t.reply_ring_len = shared.memory.ring(0).len() as u32;
            t.fetch_buckets = buckets.sizes();
            t.event_notify_mask = 0;
        }
        shared.transport.configure(mode, queues, buckets);
        self.change_config()?;
        if shared.memory.table().transport_active & request == 0 {
            return Err(Error::BringUp(format!("firmware refused {mode:?} transport")));
        }
        shared.set_max_sg(max_sg);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        shared.hw.write(Register::HostTimeLow, now as u32);
        shared.hw.write(Register::HostTimeHigh, (now >> 32) as u32);

        shared.hw.write(Register::InterruptMask, 0);
        shared.issue_internal(RequestKind::NoOp, None, cfg.reset.internal_timeout)?;

        shared.memory.table().event_notify_mask = event::ALL;
        self.change_config()?;

        info!(
            adapter = %shared.id,
            firmware = %table.firmware_version_string(),
            ?mode,
            queues,
            max_sg,
            "bring-up complete"
        );
        Ok(())
    }

    fn change_config(&self) -> Result<(), Error> {
        let hw = &self.shared.hw;
        let cfg = &self.shared.config.reset;
        hw.write(Register::DoorbellIn, doorbell_in::CHANGE_CONFIG);
        for _ in 0..cfg.config_ack_polls {
            if hw.read(Register::DoorbellIn) & doorbell_in::CHANGE_CONFIG == 0 {
                return Ok(());
            }
            thread::sleep(cfg.poll_interval);
        }
        Err(Error::BringUp("configuration change not acknowledged".into()))
    }

    fn on_operational(&mut self) {
        self.attempts = 0;
        self.shared.rearm_watchdog();
        info!(adapter = %self.shared.id, "adapter operational");
        if let Err(e) = self.rescan() {
            warn!(adapter = %self.shared.id, error = %e, "device discovery failed");
        }
    }

    fn on_dead(&mut self) {
        error!(adapter = %self.shared.id, attempts = self.attempts, "reset attempts exhausted, adapter offline");
        ADAPTERS_DEAD.increment();
        self.shared
            .hw
            .write(Register::InterruptMask, interrupt::ALL);
        let drained = drain(&self.shared, CommandStatus::NoConnection);
        if drained > 0 {
            warn!(adapter = %self.shared.id, drained, "commands failed with no connection");
        }
        self.shared.notify_offline();
    }

    // ── Rescan and shutdown ──────────────────────────────────────────

    fn rescan(&mut self) -> Result<ReconcileReport, Error> {
        match self.state() {
            ControllerState::Operational => reconcile::rescan(&self.shared),
            ControllerState::Dead => Err(Error::Dead),
            state => Err(Error::NotOperational(state)),
        }
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        match self.state() {
            ControllerState::Operational => {}
            ControllerState::Unknown | ControllerState::Dead => return Ok(()),
            state => return Err(Error::NotOperational(state)),
        }
        self.fire(Event::ShutdownRequested)?;
        self.bring_down();
        self.fire(Event::Quiesced)?;
        info!(adapter = %self.shared.id, "adapter quiesced");
        Ok(())
    }

    fn bring_down(&mut self) {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.reset.shutdown_timeout;
        while shared.pool.in_use() > 0 && Instant::now() < deadline {
            thread::sleep(shared.config.reset.poll_interval);
        }
        if let Err(e) = shared.issue_internal(
            RequestKind::FlushCache,
            None,
            shared.config.reset.internal_timeout,
        ) {
            warn!(adapter = %shared.id, error = %e, "cache flush failed");
        }
        shared.hw.write(Register::InterruptMask, interrupt::ALL);
        let drained = drain(shared, CommandStatus::NoConnection);
        if drained > 0 {
            warn!(adapter = %shared.id, drained, "commands abandoned at shutdown");
        }
    }
}

/// Complete every pending block with `status` and return it to the pool.
///
/// Blocks already claimed by another path are skipped, so a second drain
/// with nothing in flight does nothing.
pub(crate) fn drain(shared: &Shared, status: CommandStatus) -> usize {
    let mut drained = 0;
    for block in shared.pool.pending() {
        let generation = block.generation();
        if !shared.pool.claim(block, generation) {
            continue;
        }
        let tag = block.tag();
        shared.finish(block, Completion::new(tag, status));
        drained += 1;
    }
    shared.stats.drained(drained as u64);
    drained
}
