//! Command timers and abort escalation.
//!
//! Deadlines live on the command blocks themselves. One timer thread per
//! adapter scans the caller range every tick; an expired block is aborted
//! by tag through an internal command, and an abort that does not complete
//! escalates to a full reset.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use protocol_ciss::CommandStatus;
use tracing::{debug, error, warn};

use crate::adapter::Shared;
use crate::command::Completion;
use crate::error::Error;
use crate::pool::CommandBlock;
use crate::state::ResetReason;

/// Monotonic millisecond clock private to one adapter.
///
/// Readings start at 1 so 0 can mean "no deadline".
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Absolute deadline `after` from now.
    pub fn deadline(&self, after: Duration) -> u64 {
        let after = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        self.now_ms().saturating_add(after)
    }
}

pub(crate) fn run_timer(shared: Arc<Shared>) {
    let tick = shared.config.timeouts.tick;
    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(tick);
        if !shared.state().accepts_submissions() {
            continue;
        }
        let now = shared.clock.now_ms();
        for block in shared.pool.caller_blocks() {
            let deadline = block.deadline();
            if deadline == 0 || now < deadline || !block.is_pending() {
                continue;
            }
            if !block.take_timer(deadline) {
                continue;
            }
            expire(&shared, block);
            if !shared.state().accepts_submissions() {
                break;
            }
        }
    }
}

fn expire(shared: &Shared, block: &CommandBlock) {
    let tag = block.tag();
    let generation = block.generation();
    shared.stats.timed_out();
    warn!(adapter = %shared.id, %tag, "command timed out, aborting");

    match shared.issue_abort(tag, shared.config.timeouts.abort_timeout) {
        Ok(_) => {
            shared.stats.aborted();
            // The aborted command normally completes on its own reply; this
            // covers firmware that only acknowledges the abort.
            if shared.pool.claim(block, generation) {
                shared.finish(block, Completion::new(tag, CommandStatus::Aborted));
            }
        }
        // A reset got there first and owns the command now.
        Err(Error::NotOperational(state)) => {
            debug!(adapter = %shared.id, %tag, ?state, "abort skipped, adapter not operational");
        }
        Err(Error::InternalFailed {
            status: CommandStatus::AdapterWasReset | CommandStatus::NoConnection,
            ..
        }) => {
            debug!(adapter = %shared.id, %tag, "abort drained by reset");
        }
        Err(e) => {
            error!(adapter = %shared.id, %tag, error = %e, "abort failed, escalating to reset");
            shared.requests.reset(ResetReason::AbortTimeout);
        }
    }
}
