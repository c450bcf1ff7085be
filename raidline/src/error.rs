use std::io;

use protocol_ciss::{CommandStatus, ParseError, RequestKind};
use thiserror::Error;

use crate::adapter::AdapterId;
use crate::state::{ControllerState, IllegalTransition};

/// Errors returned by adapter control operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Thread spawn or other OS-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    Config(String),
    /// No free block in the requested pool range.
    #[error("command pool exhausted")]
    PoolExhausted,
    /// A block was released while already free.
    #[error("double release of command block {0}")]
    DoubleRelease(u16),
    /// State machine rejected an event.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    /// Hardware structure failed to decode.
    #[error("protocol: {0}")]
    Protocol(#[from] ParseError),
    /// Reset retry budget exhausted; the adapter is offline.
    #[error("adapter is offline")]
    Dead,
    /// Operation requires the adapter to be operational.
    #[error("adapter not operational ({0:?})")]
    NotOperational(ControllerState),
    /// An internally generated command did not complete in time.
    #[error("{0:?} command timed out")]
    InternalTimeout(RequestKind),
    /// An internally generated command completed with an error status.
    #[error("{kind:?} command failed: {status:?}")]
    InternalFailed {
        kind: RequestKind,
        status: CommandStatus,
    },
    /// Hard or soft reset did not bring the firmware back to ready.
    #[error("reset: {0}")]
    Reset(String),
    /// Bring-up could not negotiate with the firmware.
    #[error("bring-up: {0}")]
    BringUp(String),
    /// A control request was not answered within its bound.
    #[error("control request timed out")]
    ControlTimeout,
    /// The controller thread is gone.
    #[error("controller thread exited")]
    Disconnected,
    /// Every adapter id is taken.
    #[error("adapter registry full")]
    RegistryFull,
    /// No adapter registered under this id.
    #[error("unknown adapter {0}")]
    UnknownAdapter(AdapterId),
}

/// Outcome of a rejected [`Adapter::submit`](crate::Adapter::submit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// A reset stage is active or the adapter is not started.
    #[error("adapter busy")]
    Busy,
    /// Every caller command block is in flight.
    #[error("command pool exhausted")]
    PoolExhausted,
    /// The adapter is offline and will not come back.
    #[error("no connection to adapter")]
    NoConnection,
    /// The operation cannot be encoded into a request frame.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl SubmitError {
    /// Whether the caller should retry through the normal submit path.
    pub fn is_retryable(self) -> bool {
        matches!(self, SubmitError::Busy | SubmitError::PoolExhausted)
    }
}
