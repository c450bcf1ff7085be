//! Interrupt dispatch and deferred completion processing.
//!
//! [`Dispatcher::handle`] is the top half: it reads and acknowledges the
//! interrupt status, routes fatal and ready-transition events, and wakes
//! the completion worker for the affected reply queue. Reply entries are
//! drained on the worker threads, never in the top half.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use protocol_ciss::{CommandStatus, ErrorInfo, Register, ReplyEntry, interrupt};
use tracing::{debug, trace, warn};

use crate::adapter::Shared;
use crate::command::Completion;
use crate::controller::Requests;
use crate::hw::{Hardware, InterruptLine};
use crate::metrics::{INTERRUPTS_HANDLED, INTERRUPTS_SPURIOUS};
use crate::state::ResetReason;
use crate::timeout::Clock;

/// Bound on how long a worker sleeps without a wakeup.
const WORKER_POLL: Duration = Duration::from_millis(50);

/// How interrupts are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// Shared legacy line. The status register tells us whether the
    /// interrupt is ours.
    Intx,
    /// Single message-signalled vector.
    #[default]
    Msi,
    /// One vector per reply queue. Reply interrupts are acknowledged
    /// implicitly by the message.
    MsiX,
}

/// Whether an interrupt belonged to this adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

pub(crate) struct Dispatcher {
    mode: InterruptMode,
    hw: Arc<dyn Hardware>,
    clock: Clock,
    last_interrupt: AtomicU64,
    wakers: Box<[Sender<()>]>,
    ready: Sender<()>,
    requests: Arc<Requests>,
}

impl Dispatcher {
    pub fn new(
        mode: InterruptMode,
        hw: Arc<dyn Hardware>,
        clock: Clock,
        wakers: Vec<Sender<()>>,
        ready: Sender<()>,
        requests: Arc<Requests>,
    ) -> Self {
        Dispatcher {
            mode,
            hw,
            clock,
            last_interrupt: AtomicU64::new(clock.now_ms()),
            wakers: wakers.into_boxed_slice(),
            ready,
            requests,
        }
    }

    pub fn handle(&self, vector: u16) -> IrqReturn {
        let status = self.hw.read(Register::InterruptStatus);
        match self.mode {
            InterruptMode::Intx | InterruptMode::Msi => {
                if status == 0 {
                    INTERRUPTS_SPURIOUS.increment();
                    return IrqReturn::None;
                }
                self.hw.write(Register::InterruptClear, status);
            }
            InterruptMode::MsiX => {
                let events = status & !interrupt::REPLY_PENDING;
                if events != 0 {
                    self.hw.write(Register::InterruptClear, events);
                }
            }
        }
        self.last_interrupt
            .store(self.clock.now_ms(), Ordering::Release);
        INTERRUPTS_HANDLED.increment();

        if status & interrupt::FATAL != 0 {
            warn!(status = format_args!("{status:#x}"), "fatal adapter interrupt");
            self.requests.reset(ResetReason::Fatal);
            return IrqReturn::Handled;
        }
        if status & interrupt::READY_TRANSITION != 0 {
            let _ = self.ready.try_send(());
        }
        match self.mode {
            InterruptMode::MsiX => self.wake(vector as usize),
            _ if status & interrupt::REPLY_PENDING != 0 => self.wake_all(),
            _ => {}
        }
        IrqReturn::Handled
    }

    /// Clock reading of the most recent interrupt that carried a status.
    pub fn last_interrupt_ms(&self) -> u64 {
        self.last_interrupt.load(Ordering::Acquire)
    }

    pub fn wake(&self, queue: usize) {
        if let Some(waker) = self.wakers.get(queue) {
            let _ = waker.try_send(());
        }
    }

    pub fn wake_all(&self) {
        for waker in self.wakers.iter() {
            let _ = waker.try_send(());
        }
    }
}

impl InterruptLine for Dispatcher {
    fn raise(&self, vector: u16) {
        self.handle(vector);
    }
}

// ── Completion workers ───────────────────────────────────────────────

pub(crate) fn run_worker(shared: Arc<Shared>, queue: usize, wake: Receiver<()>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match wake.recv_timeout(WORKER_POLL) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        drain_queue(&shared, queue);
    }
}

/// Process every ready entry on `queue`. Returns the number consumed.
pub(crate) fn drain_queue(shared: &Shared, queue: usize) -> usize {
    let mut consumed = 0;
    while let Some(entry) = shared.transport.next_completion(queue) {
        consumed += 1;
        complete_entry(shared, entry);
    }
    consumed
}

fn complete_entry(shared: &Shared, entry: ReplyEntry) {
    let tag = entry.tag();
    let Some((block, generation)) = shared.pool.resolve(tag) else {
        trace!(adapter = %shared.id, %tag, "stale completion");
        shared.stats.stale_completion();
        return;
    };

    let info = if entry.has_error() {
        shared
            .memory
            .read_result(block.index() as usize)
            .unwrap_or_else(|e| {
                warn!(adapter = %shared.id, %tag, error = %e, "unreadable result buffer");
                ErrorInfo::new(CommandStatus::ProtocolError)
            })
    } else {
        ErrorInfo::default()
    };

    if info.status.is_transient() && !block.is_internal() {
        let state = shared.state.read();
        if state.accepts_submissions() && block.retries() < shared.config.timeouts.busy_retries {
            let attempt = block.bump_retries();
            shared.stats.transient_retry();
            debug!(adapter = %shared.id, %tag, status = ?info.status, attempt, "re-posting");
            shared.transport.resubmit(block);
            return;
        }
    }

    if !shared.pool.claim(block, generation) {
        // Lost to the timer or a reset drain.
        return;
    }
    shared.finish(block, Completion::from_info(tag, &info));
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::sync::atomic::AtomicU32;

    use crossbeam_channel::bounded;
    use parking_lot::Mutex;

    use super::*;
    use crate::hw::HostMemory;

    #[derive(Default)]
    struct StatusRegister {
        status: AtomicU32,
        cleared: Mutex<Vec<u32>>,
    }

    impl Hardware for StatusRegister {
        fn read(&self, reg: Register) -> u32 {
            match reg {
                Register::InterruptStatus => self.status.load(Ordering::Acquire),
                _ => 0,
            }
        }

        fn write(&self, reg: Register, value: u32) {
            if reg == Register::InterruptClear {
                self.status.fetch_and(!value, Ordering::AcqRel);
                self.cleared.lock().push(value);
            }
        }

        fn map_host_memory(&self, _memory: Arc<HostMemory>) {}

        fn connect_interrupts(&self, _line: Weak<dyn InterruptLine>) {}
    }

    struct Fixture {
        regs: Arc<StatusRegister>,
        dispatcher: Dispatcher,
        wakes: Vec<Receiver<()>>,
        ready: Receiver<()>,
        control: Receiver<crate::controller::ControlRequest>,
    }

    fn fixture(mode: InterruptMode, queues: usize) -> Fixture {
        let regs = Arc::new(StatusRegister::default());
        let (wake_txs, wakes): (Vec<_>, Vec<_>) = (0..queues).map(|_| bounded(1)).unzip();
        let (ready_tx, ready) = bounded(1);
        let (control_tx, control) = crossbeam_channel::unbounded();
        let dispatcher = Dispatcher::new(
            mode,
            regs.clone(),
            Clock::new(),
            wake_txs,
            ready_tx,
            Arc::new(Requests::new(control_tx)),
        );
        Fixture {
            regs,
            dispatcher,
            wakes,
            ready,
            control,
        }
    }

    #[test]
    fn empty_status_on_shared_line_is_not_ours() {
        let f = fixture(InterruptMode::Intx, 1);
        let before = f.dispatcher.last_interrupt_ms();
        assert_eq!(f.dispatcher.handle(0), IrqReturn::None);
        assert!(f.regs.cleared.lock().is_empty());
        assert!(f.wakes[0].try_recv().is_err());
        assert_eq!(f.dispatcher.last_interrupt_ms(), before);
    }

    #[test]
    fn reply_interrupt_is_cleared_and_wakes_all_queues() {
        let f = fixture(InterruptMode::Msi, 2);
        f.regs
            .status
            .store(interrupt::REPLY_PENDING, Ordering::Release);
        assert_eq!(f.dispatcher.handle(0), IrqReturn::Handled);
        assert_eq!(*f.regs.cleared.lock(), vec![interrupt::REPLY_PENDING]);
        assert!(f.wakes[0].try_recv().is_ok());
        assert!(f.wakes[1].try_recv().is_ok());
    }

    #[test]
    fn msix_wakes_only_its_queue() {
        let f = fixture(InterruptMode::MsiX, 3);
        f.regs
            .status
            .store(interrupt::REPLY_PENDING, Ordering::Release);
        assert_eq!(f.dispatcher.handle(2), IrqReturn::Handled);
        // Reply acknowledgement is implicit.
        assert!(f.regs.cleared.lock().is_empty());
        assert!(f.wakes[0].try_recv().is_err());
        assert!(f.wakes[1].try_recv().is_err());
        assert!(f.wakes[2].try_recv().is_ok());
    }

    #[test]
    fn fatal_status_requests_one_reset() {
        let f = fixture(InterruptMode::Msi, 1);
        for _ in 0..3 {
            f.regs.status.store(interrupt::ERROR, Ordering::Release);
            assert_eq!(f.dispatcher.handle(0), IrqReturn::Handled);
        }
        assert!(matches!(
            f.control.try_recv(),
            Ok(crate::controller::ControlRequest::Reset {
                reason: ResetReason::Fatal,
                ..
            })
        ));
        assert!(f.control.try_recv().is_err());
        assert!(f.wakes[0].try_recv().is_err());
    }

    #[test]
    fn ready_transition_notifies_waiter() {
        let f = fixture(InterruptMode::Intx, 1);
        f.regs
            .status
            .store(interrupt::READY_TRANSITION, Ordering::Release);
        f.dispatcher.handle(0);
        assert!(f.ready.try_recv().is_ok());
        assert!(f.wakes[0].try_recv().is_err());
    }
}
