//! One attached adapter and the state its threads share.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use protocol_ciss::{CommandStatus, Direction, RequestFrame, RequestKind, SgEntry, Tag};
use tracing::{error, info, warn};

use crate::command::{Completer, Completion, InternalReply, Operation};
use crate::config::Config;
use crate::controller::{ControlRequest, Controller, Requests};
use crate::error::{Error, SubmitError};
use crate::hw::{DATA_LEN, Hardware, HostMemory};
use crate::interrupt::{self, Dispatcher, IrqReturn};
use crate::metrics::{AdapterStats, INTERNAL_POOL_EXHAUSTED, StatsSnapshot};
use crate::pool::{CommandBlock, CommandPool, PoolExhausted};
use crate::reconcile::{self, DeviceEvent, DeviceInfo, DeviceTable, ReconcileReport, UnitHost};
use crate::state::{ControllerState, ResetReason};
use crate::timeout::{self, Clock};
use crate::transport::{Transport, TransportMode};
use crate::watchdog;

/// Registry-assigned adapter number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(pub u32);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

type OfflineHook = Box<dyn Fn(AdapterId) + Send + Sync>;

/// Everything the controller, workers, timer and monitor threads share.
pub(crate) struct Shared {
    pub id: AdapterId,
    pub config: Config,
    pub hw: Arc<dyn Hardware>,
    pub memory: Arc<HostMemory>,
    pub pool: CommandPool,
    pub transport: Transport,
    pub dispatcher: Arc<Dispatcher>,
    pub requests: Arc<Requests>,
    /// Top-level controller lock. Submitters hold it shared; transitions
    /// take it exclusively.
    pub state: RwLock<ControllerState>,
    pub devices: Mutex<DeviceTable>,
    pub units: Sender<Vec<DeviceEvent>>,
    pub stats: AdapterStats,
    pub clock: Clock,
    pub shutdown: AtomicBool,
    max_sg: AtomicUsize,
    operational_epoch: AtomicU64,
    offline_hooks: Mutex<Vec<OfflineHook>>,
}

impl Shared {
    pub fn state(&self) -> ControllerState {
        *self.state.read()
    }

    /// Scatter-gather limit negotiated at the last bring-up.
    pub fn max_sg(&self) -> usize {
        self.max_sg.load(Ordering::Acquire)
    }

    pub fn set_max_sg(&self, max_sg: usize) {
        self.max_sg.store(max_sg, Ordering::Release);
    }

    /// Bumped each time the adapter reaches `Operational`; the monitor
    /// re-arms lockup detection when it changes.
    pub fn operational_epoch(&self) -> u64 {
        self.operational_epoch.load(Ordering::Acquire)
    }

    pub fn rearm_watchdog(&self) {
        self.operational_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn notify_offline(&self) {
        for hook in self.offline_hooks.lock().iter() {
            hook(self.id);
        }
    }

    /// Deliver a claimed block's completion and return it to the pool.
    pub fn finish(&self, block: &CommandBlock, completion: Completion) {
        block.cancel_timer();
        self.transport.retire();
        let completer = block.take_completer();
        let data = match &completer {
            Some(Completer::Internal(_)) => self
                .memory
                .data(block.index() as usize)
                .map(|d| d.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        if let Err(e) = self.pool.release(block) {
            error!(adapter = %self.id, error = %e, "completion for a free block");
            return;
        }
        self.stats.completed();
        match completer {
            Some(Completer::Caller(callback)) => callback(completion),
            Some(Completer::Internal(tx)) => {
                let _ = tx.send((completion, data));
            }
            None => warn!(adapter = %self.id, tag = %completion.tag, "block had no completer"),
        }
    }

    /// Run one internally generated command and wait for its reply.
    ///
    /// Controller-thread only: the caller owns the lifecycle, so no state
    /// guard is taken. On timeout the block stays pending; the next reset
    /// drain returns it.
    pub fn issue_internal(
        &self,
        kind: RequestKind,
        abort_target: Option<Tag>,
        timeout: Duration,
    ) -> Result<InternalReply, Error> {
        let posted = self.post_internal(kind, abort_target)?;
        self.await_internal(posted, timeout)
    }

    /// Abort `target` by tag from outside the controller thread.
    ///
    /// The abort is posted under the shared state lock, so it never races a
    /// reset drain and is never sent while a reset stage is active.
    pub fn issue_abort(&self, target: Tag, timeout: Duration) -> Result<InternalReply, Error> {
        let posted = {
            let state = self.state.read();
            if !state.accepts_submissions() {
                return Err(Error::NotOperational(*state));
            }
            self.post_internal(RequestKind::Abort, Some(target))?
        };
        self.await_internal(posted, timeout)
    }

    fn post_internal(
        &self,
        kind: RequestKind,
        abort_target: Option<Tag>,
    ) -> Result<PostedInternal, Error> {
        let block = self.pool.allocate_internal().map_err(|e: PoolExhausted| {
            INTERNAL_POOL_EXHAUSTED.increment();
            Error::from(e)
        })?;
        let index = block.index() as usize;

        let mut frame = RequestFrame::control(kind);
        frame.tag = block.tag().encode();
        frame.reply_queue = self.transport.queue_for(block);
        if let Some(target) = abort_target {
            frame.abort_target = target.encode();
        }
        if matches!(
            kind,
            RequestKind::ReportPhysicalLuns | RequestKind::ReportLogicalLuns
        ) && let Some(address) = self.memory.data_address(index)
        {
            frame.direction = Direction::FromDevice;
            if let Err(e) = frame.set_sg(&[SgEntry::new(address as u64, DATA_LEN as u32)]) {
                let _ = self.pool.release(block);
                return Err(e.into());
            }
        }
        if let Some(mut data) = self.memory.data(index) {
            data.clear();
        }

        let (tx, rx) = bounded(1);
        block.arm(Completer::Internal(tx), 0, frame.sg_count);
        self.stats.submitted();
        self.transport.submit(block, &frame);
        Ok(PostedInternal {
            kind,
            direction: frame.direction,
            reply: rx,
        })
    }

    fn await_internal(
        &self,
        posted: PostedInternal,
        timeout: Duration,
    ) -> Result<InternalReply, Error> {
        let kind = posted.kind;
        match posted.reply.recv_timeout(timeout) {
            Ok((completion, data)) => match completion.status {
                CommandStatus::Success => Ok((completion, data)),
                CommandStatus::DataUnderrun if posted.direction != Direction::None => {
                    Ok((completion, data))
                }
                status => Err(Error::InternalFailed { kind, status }),
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!(adapter = %self.id, ?kind, "internal command timed out");
                Err(Error::InternalTimeout(kind))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::InternalFailed {
                kind,
                status: CommandStatus::NoConnection,
            }),
        }
    }
}

/// An internal command on the wire, waiting for its reply.
struct PostedInternal {
    kind: RequestKind,
    direction: Direction,
    reply: Receiver<InternalReply>,
}

/// A running adapter.
///
/// Dropping the adapter stops its threads without a graceful shutdown;
/// call [`shutdown`](Self::shutdown) first to flush and quiesce.
pub struct Adapter {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Adapter {
    /// Allocate host memory, connect interrupts and spawn the adapter's
    /// threads. The adapter stays in `Unknown` until [`start`](Self::start).
    pub fn new(
        id: AdapterId,
        hw: Arc<dyn Hardware>,
        config: Config,
        host: Arc<dyn UnitHost>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let commands = config.pool.commands;
        let internal = config.pool.internal;
        let blocks = commands as usize + internal as usize;
        let queues = config.transport.reply_queues as usize;
        let memory = Arc::new(HostMemory::new(blocks, internal as usize, queues, blocks));
        let pool = CommandPool::new(&memory, commands, internal);
        let transport = Transport::new(hw.clone(), memory.clone());

        let (control_tx, control_rx) = unbounded();
        let requests = Arc::new(Requests::new(control_tx));
        let (ready_tx, ready_rx) = bounded(1);
        let (wake_txs, wake_rxs): (Vec<_>, Vec<_>) = (0..queues).map(|_| bounded(1)).unzip();
        let clock = Clock::new();
        let dispatcher = Arc::new(Dispatcher::new(
            config.interrupts.mode,
            hw.clone(),
            clock,
            wake_txs,
            ready_tx,
            requests.clone(),
        ));
        let (units_tx, units_rx) = unbounded();

        let shared = Arc::new(Shared {
            id,
            max_sg: AtomicUsize::new(config.transport.max_sg_entries),
            devices: Mutex::new(DeviceTable::new(config.reconcile.max_devices)),
            config,
            hw: hw.clone(),
            memory: memory.clone(),
            pool,
            transport,
            dispatcher: dispatcher.clone(),
            requests,
            state: RwLock::new(ControllerState::Unknown),
            units: units_tx,
            stats: AdapterStats::default(),
            clock,
            shutdown: AtomicBool::new(false),
            operational_epoch: AtomicU64::new(0),
            offline_hooks: Mutex::new(Vec::new()),
        });

        hw.map_host_memory(memory);
        let line: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        hw.connect_interrupts(line);

        let adapter = Adapter {
            shared: shared.clone(),
            threads: Mutex::new(Vec::new()),
        };

        let controller = Controller::new(shared.clone(), control_rx, ready_rx);
        adapter.spawn("ctl", move || controller.run())?;
        for (queue, wake) in wake_rxs.into_iter().enumerate() {
            let shared = shared.clone();
            adapter.spawn(&format!("cq{queue}"), move || {
                interrupt::run_worker(shared, queue, wake)
            })?;
        }
        {
            let shared = shared.clone();
            adapter.spawn("timer", move || timeout::run_timer(shared))?;
        }
        {
            let shared = shared.clone();
            adapter.spawn("monitor", move || watchdog::run_monitor(shared))?;
        }
        adapter.spawn("units", move || reconcile::run_apply(shared, host, units_rx))?;

        info!(adapter = %id, commands, internal, queues, "adapter attached");
        Ok(adapter)
    }

    fn spawn<F>(&self, role: &str, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("raidline-{}-{role}", self.shared.id))
            .spawn(f)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    pub fn id(&self) -> AdapterId {
        self.shared.id
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    // ── Control operations ───────────────────────────────────────────

    fn request<T>(
        &self,
        make: impl FnOnce(Sender<Result<T, Error>>) -> ControlRequest,
    ) -> Result<T, Error> {
        let (tx, rx) = bounded(1);
        self.shared.requests.send(make(tx))?;
        match rx.recv_timeout(self.shared.config.reset.control_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::ControlTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Run the initial reset and bring-up, then discover devices. Returns
    /// once the adapter is operational or dead.
    pub fn start(&self) -> Result<(), Error> {
        self.request(|tx| ControlRequest::Start(Some(tx)))
    }

    /// Force a full reset sequence and wait for it to settle.
    pub fn reset(&self) -> Result<(), Error> {
        self.request(|tx| ControlRequest::Reset {
            reason: ResetReason::Requested,
            reply: Some(tx),
        })
    }

    /// Re-read the device lists and reconcile the device table.
    pub fn rescan(&self) -> Result<ReconcileReport, Error> {
        self.request(|tx| ControlRequest::Rescan(Some(tx)))
    }

    /// Drain caller commands, flush the cache and quiesce to `Unknown`.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.request(|tx| ControlRequest::Shutdown(Some(tx)))
    }

    /// Register a hook invoked once if the adapter goes offline for good.
    pub fn on_offline<F>(&self, hook: F)
    where
        F: Fn(AdapterId) + Send + Sync + 'static,
    {
        self.shared.offline_hooks.lock().push(Box::new(hook));
    }

    // ── I/O ──────────────────────────────────────────────────────────

    /// Submit `op`; `callback` runs exactly once with its completion.
    ///
    /// Never blocks. Rejections leave no trace on the adapter.
    pub fn submit<F>(&self, op: Operation, callback: F) -> Result<Tag, SubmitError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let shared = &self.shared;
        let state = shared.state.read();
        match *state {
            ControllerState::Operational => {}
            ControllerState::Dead => return Err(SubmitError::NoConnection),
            _ => {
                shared.stats.rejected_busy();
                return Err(SubmitError::Busy);
            }
        }
        op.check(shared.max_sg())
            .map_err(SubmitError::InvalidRequest)?;

        let block = shared.pool.allocate().map_err(|PoolExhausted| {
            shared.stats.pool_exhausted();
            SubmitError::PoolExhausted
        })?;
        let tag = block.tag();

        let mut frame = RequestFrame::default();
        frame.tag = tag.encode();
        frame.reply_queue = shared.transport.queue_for(block);
        frame.direction = op.direction;
        frame.address = op.target;
        let timeout = op.timeout.unwrap_or(shared.config.timeouts.default_timeout);
        frame.timeout_secs = timeout.as_secs().min(u16::MAX as u64) as u16;
        if frame.set_cdb(&op.cdb).is_err() || frame.set_sg(&op.buffers).is_err() {
            let _ = shared.pool.release(block);
            return Err(SubmitError::InvalidRequest("frame encoding failed"));
        }

        block.arm(
            Completer::Caller(Box::new(callback)),
            shared.clock.deadline(timeout),
            frame.sg_count,
        );
        shared.stats.submitted();
        shared.transport.submit(block, &frame);
        drop(state);
        Ok(tag)
    }

    /// Entry point for platform interrupt glue.
    pub fn interrupt(&self, vector: u16) -> IrqReturn {
        self.shared.dispatcher.handle(vector)
    }

    /// Whether a reset is queued or running.
    pub fn reset_pending(&self) -> bool {
        self.shared.requests.reset_pending() || self.shared.state().is_resetting()
    }

    /// Commands currently owned by the adapter.
    pub fn in_flight(&self) -> usize {
        self.shared.transport.outstanding()
    }

    /// Caller blocks currently allocated.
    pub fn commands_in_use(&self) -> usize {
        self.shared.pool.in_use()
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.shared.transport.mode()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared.devices.lock().devices()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Stop every adapter thread. Does not talk to the firmware.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.dispatcher.wake_all();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(adapter = %self.shared.id, "adapter thread panicked");
            }
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
