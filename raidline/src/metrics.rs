//! raidline runtime metrics.
//!
//! Process-wide counters for command traffic, pool exhaustion, recovery
//! events and device-table churn, plus [`AdapterStats`] for per-adapter
//! accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use metriken::{Counter, Gauge, metric};

// ── Command traffic ──────────────────────────────────────────────

#[metric(
    name = "raidline/commands/submitted",
    description = "Commands posted to the submit port"
)]
pub static COMMANDS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "raidline/commands/completed",
    description = "Command callbacks invoked"
)]
pub static COMMANDS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "raidline/commands/rejected_busy",
    description = "Submissions rejected while a reset stage was active"
)]
pub static COMMANDS_REJECTED_BUSY: Counter = Counter::new();

#[metric(
    name = "raidline/commands/outstanding",
    description = "Commands currently owned by the adapter"
)]
pub static COMMANDS_OUTSTANDING: Gauge = Gauge::new();

#[metric(
    name = "raidline/commands/transient_retries",
    description = "Busy/attention completions re-posted with the same tag"
)]
pub static TRANSIENT_RETRIES: Counter = Counter::new();

#[metric(
    name = "raidline/commands/timed_out",
    description = "Command timers that expired"
)]
pub static COMMANDS_TIMED_OUT: Counter = Counter::new();

#[metric(
    name = "raidline/commands/aborted",
    description = "Commands completed by abort-by-tag"
)]
pub static COMMANDS_ABORTED: Counter = Counter::new();

// ── Completion path ──────────────────────────────────────────────

#[metric(
    name = "raidline/completions/stale",
    description = "Completions whose tag matched no pending block"
)]
pub static STALE_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "raidline/interrupts/handled",
    description = "Interrupts that carried a status"
)]
pub static INTERRUPTS_HANDLED: Counter = Counter::new();

#[metric(
    name = "raidline/interrupts/spurious",
    description = "Shared-line interrupts with an empty status"
)]
pub static INTERRUPTS_SPURIOUS: Counter = Counter::new();

// ── Pool exhaustion ──────────────────────────────────────────────

#[metric(
    name = "raidline/pool/exhausted",
    description = "Caller submissions rejected for lack of a command block"
)]
pub static POOL_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "raidline/pool/internal_exhausted",
    description = "Internal commands that found no reserved block"
)]
pub static INTERNAL_POOL_EXHAUSTED: Counter = Counter::new();

// ── Recovery ─────────────────────────────────────────────────────

#[metric(name = "raidline/reset/started", description = "Reset sequences started")]
pub static RESETS_STARTED: Counter = Counter::new();

#[metric(
    name = "raidline/reset/failed_attempts",
    description = "Hard or soft reset attempts that did not reach ready"
)]
pub static RESET_FAILURES: Counter = Counter::new();

#[metric(
    name = "raidline/reset/drained",
    description = "Pending commands synthetically completed by a drain"
)]
pub static COMMANDS_DRAINED: Counter = Counter::new();

#[metric(
    name = "raidline/watchdog/lockups",
    description = "Lockups detected by the heartbeat watchdog"
)]
pub static LOCKUPS: Counter = Counter::new();

#[metric(
    name = "raidline/adapters/dead",
    description = "Adapters that exhausted their reset budget"
)]
pub static ADAPTERS_DEAD: Counter = Counter::new();

// ── Device table ─────────────────────────────────────────────────

#[metric(name = "raidline/devices/added", description = "Device add events")]
pub static DEVICES_ADDED: Counter = Counter::new();

#[metric(name = "raidline/devices/changed", description = "Device change events")]
pub static DEVICES_CHANGED: Counter = Counter::new();

#[metric(name = "raidline/devices/removed", description = "Device delete events")]
pub static DEVICES_REMOVED: Counter = Counter::new();

#[metric(
    name = "raidline/devices/dropped",
    description = "Reported devices dropped because the table was full"
)]
pub static DEVICES_DROPPED: Counter = Counter::new();

/// Per-adapter counters mirroring the process-wide metrics.
#[derive(Debug, Default)]
pub struct AdapterStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected_busy: AtomicU64,
    pool_exhausted: AtomicU64,
    stale_completions: AtomicU64,
    transient_retries: AtomicU64,
    timeouts: AtomicU64,
    aborted: AtomicU64,
    drained: AtomicU64,
    resets: AtomicU64,
    reset_failures: AtomicU64,
    lockups: AtomicU64,
    devices_added: AtomicU64,
    devices_changed: AtomicU64,
    devices_removed: AtomicU64,
    devices_dropped: AtomicU64,
}

/// Point-in-time copy of [`AdapterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub rejected_busy: u64,
    pub pool_exhausted: u64,
    pub stale_completions: u64,
    pub transient_retries: u64,
    pub timeouts: u64,
    pub aborted: u64,
    pub drained: u64,
    pub resets: u64,
    pub reset_failures: u64,
    pub lockups: u64,
    pub devices_added: u64,
    pub devices_changed: u64,
    pub devices_removed: u64,
    pub devices_dropped: u64,
}

#[inline]
fn bump(local: &AtomicU64, global: &Counter, n: u64) {
    local.fetch_add(n, Ordering::Relaxed);
    global.add(n);
}

impl AdapterStats {
    pub(crate) fn submitted(&self) {
        bump(&self.submitted, &COMMANDS_SUBMITTED, 1);
        COMMANDS_OUTSTANDING.increment();
    }

    pub(crate) fn completed(&self) {
        bump(&self.completed, &COMMANDS_COMPLETED, 1);
        COMMANDS_OUTSTANDING.decrement();
    }

    pub(crate) fn rejected_busy(&self) {
        bump(&self.rejected_busy, &COMMANDS_REJECTED_BUSY, 1);
    }

    pub(crate) fn pool_exhausted(&self) {
        bump(&self.pool_exhausted, &POOL_EXHAUSTED, 1);
    }

    pub(crate) fn stale_completion(&self) {
        bump(&self.stale_completions, &STALE_COMPLETIONS, 1);
    }

    pub(crate) fn transient_retry(&self) {
        bump(&self.transient_retries, &TRANSIENT_RETRIES, 1);
    }

    pub(crate) fn timed_out(&self) {
        bump(&self.timeouts, &COMMANDS_TIMED_OUT, 1);
    }

    pub(crate) fn aborted(&self) {
        bump(&self.aborted, &COMMANDS_ABORTED, 1);
    }

    pub(crate) fn drained(&self, n: u64) {
        bump(&self.drained, &COMMANDS_DRAINED, n);
    }

    pub(crate) fn reset_started(&self) {
        bump(&self.resets, &RESETS_STARTED, 1);
    }

    pub(crate) fn reset_failed(&self) {
        bump(&self.reset_failures, &RESET_FAILURES, 1);
    }

    pub(crate) fn lockup(&self) {
        bump(&self.lockups, &LOCKUPS, 1);
    }

    pub(crate) fn device_added(&self) {
        bump(&self.devices_added, &DEVICES_ADDED, 1);
    }

    pub(crate) fn device_changed(&self) {
        bump(&self.devices_changed, &DEVICES_CHANGED, 1);
    }

    pub(crate) fn device_removed(&self) {
        bump(&self.devices_removed, &DEVICES_REMOVED, 1);
    }

    pub(crate) fn device_dropped(&self) {
        bump(&self.devices_dropped, &DEVICES_DROPPED, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            submitted: get(&self.submitted),
            completed: get(&self.completed),
            rejected_busy: get(&self.rejected_busy),
            pool_exhausted: get(&self.pool_exhausted),
            stale_completions: get(&self.stale_completions),
            transient_retries: get(&self.transient_retries),
            timeouts: get(&self.timeouts),
            aborted: get(&self.aborted),
            drained: get(&self.drained),
            resets: get(&self.resets),
            reset_failures: get(&self.reset_failures),
            lockups: get(&self.lockups),
            devices_added: get(&self.devices_added),
            devices_changed: get(&self.devices_changed),
            devices_removed: get(&self.devices_removed),
            devices_dropped: get(&self.devices_dropped),
        }
    }
}
