use std::time::Duration;

use protocol_ciss::{BUCKET_COUNT, MAX_SG_ENTRIES, Tag};

use crate::error::Error;
use crate::interrupt::InterruptMode;

/// Configuration for one adapter instance.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Command block arena sizing.
    pub pool: PoolConfig,
    /// Transport negotiation preferences.
    pub transport: TransportConfig,
    /// Interrupt delivery.
    pub interrupts: InterruptConfig,
    /// Reset protocol budgets and intervals.
    pub reset: ResetConfig,
    /// Lockup watchdog.
    pub watchdog: WatchdogConfig,
    /// Per-command timers and transient retries.
    pub timeouts: TimeoutConfig,
    /// Device table sizing.
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        let total = self.pool.commands as usize + self.pool.internal as usize;
        if self.pool.commands == 0 {
            return Err(Error::Config("pool.commands must be > 0".into()));
        }
        if total > Tag::MAX_DIRECT_INDEX as usize + 1 {
            return Err(Error::Config(format!(
                "pool.commands + pool.internal must be <= {}",
                Tag::MAX_DIRECT_INDEX as usize + 1
            )));
        }
        if self.pool.internal < 2 {
            return Err(Error::Config("pool.internal must be >= 2".into()));
        }
        if self.transport.reply_queues == 0 || self.transport.reply_queues > 16 {
            return Err(Error::Config(
                "transport.reply_queues must be in 1..=16".into(),
            ));
        }
        if self.transport.fetch_thresholds.len() > BUCKET_COUNT - 1 {
            return Err(Error::Config(format!(
                "transport.fetch_thresholds may hold at most {} entries",
                BUCKET_COUNT - 1
            )));
        }
        if self
            .transport
            .fetch_thresholds
            .windows(2)
            .any(|w| w[0] >= w[1])
            || self.transport.fetch_thresholds.first() == Some(&0)
        {
            return Err(Error::Config(
                "transport.fetch_thresholds must be non-zero and strictly ascending".into(),
            ));
        }
        if self.transport.max_sg_entries == 0 || self.transport.max_sg_entries > MAX_SG_ENTRIES {
            return Err(Error::Config(format!(
                "transport.max_sg_entries must be in 1..={MAX_SG_ENTRIES}"
            )));
        }
        if self.reset.max_attempts == 0 {
            return Err(Error::Config("reset.max_attempts must be > 0".into()));
        }
        if self.reset.ready_polls == 0 || self.reset.not_ready_polls == 0 {
            return Err(Error::Config(
                "reset.ready_polls and reset.not_ready_polls must be > 0".into(),
            ));
        }
        if self.reset.poll_interval.is_zero() {
            return Err(Error::Config("reset.poll_interval must be > 0".into()));
        }
        if self.watchdog.interval.is_zero() || self.watchdog.event_poll.is_zero() {
            return Err(Error::Config(
                "watchdog.interval and watchdog.event_poll must be > 0".into(),
            ));
        }
        if self.timeouts.tick.is_zero() {
            return Err(Error::Config("timeouts.tick must be > 0".into()));
        }
        if self.reconcile.max_devices < 2 {
            return Err(Error::Config("reconcile.max_devices must be >= 2".into()));
        }
        Ok(())
    }
}

/// Command pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Caller-visible command blocks. Submissions beyond this are rejected
    /// with `PoolExhausted`.
    pub commands: u16,
    /// Blocks reserved for internally generated commands (abort, report
    /// LUNs, no-op probe, cache flush).
    pub internal: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            commands: 64,
            internal: 8,
        }
    }
}

/// Transport negotiation.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Use the reply-ring transport when the firmware advertises it.
    pub prefer_performant: bool,
    /// Reply queues requested. The firmware may grant fewer.
    pub reply_queues: u16,
    /// Fetch-bucket sizes in 16-byte blocks, ascending. A final bucket sized
    /// for the largest scatter list is always appended.
    pub fetch_thresholds: Vec<u16>,
    /// Host-side limit on scatter-gather entries per command.
    pub max_sg_entries: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefer_performant: true,
            reply_queues: 1,
            fetch_thresholds: vec![5, 6, 8, 10, 12, 20, 28],
            max_sg_entries: MAX_SG_ENTRIES,
        }
    }
}

/// Interrupt delivery.
#[derive(Debug, Clone, Default)]
pub struct InterruptConfig {
    pub mode: InterruptMode,
}

/// Reset protocol. Every retry count and interval is adapter-model specific.
#[derive(Debug, Clone)]
pub struct ResetConfig {
    /// Hard/soft reset attempts before the adapter is declared dead.
    pub max_attempts: u32,
    /// Delay before retrying a failed reset, multiplied by the attempt number.
    pub backoff: Duration,
    /// Upper bound on waiting for the firmware to acknowledge a reset alert.
    pub alert_timeout: Duration,
    /// Interval between register polls.
    pub poll_interval: Duration,
    /// Polls allowed for the scratch-pad to leave the ready state.
    pub not_ready_polls: u32,
    /// Polls allowed for the scratch-pad to return to ready.
    pub ready_polls: u32,
    /// Polls allowed for a configuration-change doorbell to be acknowledged.
    pub config_ack_polls: u32,
    /// Use the soft reset when the firmware supports it.
    pub prefer_soft_reset: bool,
    /// Timeout for internally generated commands (probe, report LUNs, flush).
    pub internal_timeout: Duration,
    /// Upper bound on waiting for outstanding commands during shutdown.
    pub shutdown_timeout: Duration,
    /// Upper bound on a caller waiting for a start/reset/shutdown to finish.
    pub control_timeout: Duration,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            alert_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            not_ready_polls: 100,
            ready_polls: 600,
            config_ack_polls: 100,
            prefer_soft_reset: false,
            internal_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(120),
        }
    }
}

/// Lockup watchdog and event-notify polling.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Heartbeat sampling interval.
    pub interval: Duration,
    /// How often the capability table's event word is checked.
    pub event_poll: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            event_poll: Duration::from_secs(1),
        }
    }
}

/// Per-command timers.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout applied when an operation does not carry one.
    pub default_timeout: Duration,
    /// Deadline scan interval.
    pub tick: Duration,
    /// Upper bound on waiting for an abort-by-tag to complete.
    pub abort_timeout: Duration,
    /// Re-posts of a busy/attention completion before it is surfaced.
    pub busy_retries: u8,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            tick: Duration::from_millis(100),
            abort_timeout: Duration::from_secs(5),
            busy_retries: 3,
        }
    }
}

/// Device table sizing.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Slots in the device table, including the reserved controller slot.
    pub max_devices: u16,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { max_devices: 256 }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use raidline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .commands(128)
///     .reply_queues(4)
///     .max_reset_attempts(5)
///     .watchdog_interval(Duration::from_secs(5))
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.pool.commands, 128);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Pool settings ────────────────────────────────────────────────

    /// Set the number of caller-visible command blocks.
    pub fn commands(mut self, n: u16) -> Self {
        self.config.pool.commands = n;
        self
    }

    /// Set the number of blocks reserved for internal commands.
    pub fn internal_commands(mut self, n: u16) -> Self {
        self.config.pool.internal = n;
        self
    }

    // ── Transport settings ───────────────────────────────────────────

    /// Prefer the reply-ring transport when available.
    pub fn prefer_performant(mut self, enable: bool) -> Self {
        self.config.transport.prefer_performant = enable;
        self
    }

    /// Set the number of reply queues to request.
    pub fn reply_queues(mut self, n: u16) -> Self {
        self.config.transport.reply_queues = n;
        self
    }

    /// Set the fetch-bucket thresholds (16-byte blocks, ascending).
    pub fn fetch_thresholds(mut self, thresholds: &[u16]) -> Self {
        self.config.transport.fetch_thresholds = thresholds.to_vec();
        self
    }

    /// Set the host-side scatter-gather limit.
    pub fn max_sg_entries(mut self, n: usize) -> Self {
        self.config.transport.max_sg_entries = n;
        self
    }

    // ── Interrupt settings ───────────────────────────────────────────

    /// Set the interrupt delivery mode.
    pub fn interrupt_mode(mut self, mode: InterruptMode) -> Self {
        self.config.interrupts.mode = mode;
        self
    }

    // ── Reset settings ───────────────────────────────────────────────

    /// Set the reset attempt budget.
    pub fn max_reset_attempts(mut self, n: u32) -> Self {
        self.config.reset.max_attempts = n;
        self
    }

    /// Set the base backoff between reset attempts.
    pub fn reset_backoff(mut self, backoff: Duration) -> Self {
        self.config.reset.backoff = backoff;
        self
    }

    /// Set the register poll interval and poll budgets.
    pub fn reset_polls(mut self, interval: Duration, not_ready: u32, ready: u32) -> Self {
        self.config.reset.poll_interval = interval;
        self.config.reset.not_ready_polls = not_ready;
        self.config.reset.ready_polls = ready;
        self
    }

    /// Set the reset-alert acknowledgement bound.
    pub fn alert_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset.alert_timeout = timeout;
        self
    }

    /// Prefer a soft reset when the firmware supports it.
    pub fn prefer_soft_reset(mut self, enable: bool) -> Self {
        self.config.reset.prefer_soft_reset = enable;
        self
    }

    /// Set the timeout for internally generated commands.
    pub fn internal_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset.internal_timeout = timeout;
        self
    }

    // ── Watchdog settings ────────────────────────────────────────────

    /// Enable or disable lockup detection.
    pub fn watchdog(mut self, enable: bool) -> Self {
        self.config.watchdog.enabled = enable;
        self
    }

    /// Set the heartbeat sampling interval.
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.config.watchdog.interval = interval;
        self
    }

    /// Set how often device-change notifications are polled.
    pub fn event_poll_interval(mut self, interval: Duration) -> Self {
        self.config.watchdog.event_poll = interval;
        self
    }

    // ── Timer settings ───────────────────────────────────────────────

    /// Set the default per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.default_timeout = timeout;
        self
    }

    /// Set the deadline scan interval.
    pub fn timer_tick(mut self, tick: Duration) -> Self {
        self.config.timeouts.tick = tick;
        self
    }

    /// Set the abort-by-tag timeout.
    pub fn abort_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.abort_timeout = timeout;
        self
    }

    /// Set how many times a busy/attention completion is re-posted.
    pub fn busy_retries(mut self, n: u8) -> Self {
        self.config.timeouts.busy_retries = n;
        self
    }

    // ── Device table settings ────────────────────────────────────────

    /// Set the device table capacity, including the controller slot.
    pub fn max_devices(mut self, n: u16) -> Self {
        self.config.reconcile.max_devices = n;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let err = ConfigBuilder::new()
            .fetch_thresholds(&[5, 5, 8])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_oversized_pool() {
        assert!(ConfigBuilder::new().commands(8190).build().is_err());
        assert!(ConfigBuilder::new().commands(8184).build().is_ok());
    }

    #[test]
    fn rejects_zero_budgets() {
        assert!(ConfigBuilder::new().max_reset_attempts(0).build().is_err());
        assert!(ConfigBuilder::new().commands(0).build().is_err());
        assert!(ConfigBuilder::new().reply_queues(0).build().is_err());
        assert!(ConfigBuilder::new().internal_commands(1).build().is_err());
    }
}
