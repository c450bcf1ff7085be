//! Caller-facing command types.

use std::time::Duration;

use protocol_ciss::{
    CommandStatus, Direction, ErrorInfo, LunAddress, MAX_CDB_LEN, SgEntry, Tag, total_len,
};

/// One SCSI operation to run on a device behind the adapter.
#[derive(Debug, Clone)]
pub struct Operation {
    pub target: LunAddress,
    /// Command descriptor block; byte 0 is the operation code.
    pub cdb: Vec<u8>,
    pub direction: Direction,
    pub buffers: Vec<SgEntry>,
    /// `None` uses the adapter's default timeout.
    pub timeout: Option<Duration>,
}

impl Operation {
    pub fn new(target: LunAddress, cdb: &[u8]) -> Self {
        Operation {
            target,
            cdb: cdb.to_vec(),
            direction: Direction::None,
            buffers: Vec::new(),
            timeout: None,
        }
    }

    pub fn read(mut self, buffers: Vec<SgEntry>) -> Self {
        self.direction = Direction::FromDevice;
        self.buffers = buffers;
        self
    }

    pub fn write(mut self, buffers: Vec<SgEntry>) -> Self {
        self.direction = Direction::ToDevice;
        self.buffers = buffers;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn check(&self, max_sg: usize) -> Result<(), &'static str> {
        if self.cdb.is_empty() {
            return Err("empty cdb");
        }
        if self.cdb.len() > MAX_CDB_LEN {
            return Err("cdb longer than 16 bytes");
        }
        if self.buffers.len() > max_sg {
            return Err("too many scatter-gather entries");
        }
        if self.direction == Direction::None && !self.buffers.is_empty() {
            return Err("buffers supplied without a data direction");
        }
        if total_len(&self.buffers).is_none() {
            return Err("total transfer length exceeds u32");
        }
        Ok(())
    }
}

/// Result delivered to a command's callback, exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tag: Tag,
    pub status: CommandStatus,
    pub scsi_status: u8,
    /// Bytes not transferred.
    pub residual: u32,
    pub sense: Vec<u8>,
}

impl Completion {
    pub(crate) fn new(tag: Tag, status: CommandStatus) -> Self {
        Completion {
            tag,
            status,
            scsi_status: 0,
            residual: 0,
            sense: Vec::new(),
        }
    }

    pub(crate) fn from_info(tag: Tag, info: &ErrorInfo) -> Self {
        Completion {
            tag,
            status: info.status,
            scsi_status: info.scsi_status,
            residual: info.residual,
            sense: info.sense[..info.sense_len as usize].to_vec(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Completion callback. Runs on a completion worker, the timer thread or
/// the controller thread; it must not block for long.
pub type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Reply of an internally generated command: its completion plus a copy of
/// the block's data buffer.
pub(crate) type InternalReply = (Completion, Vec<u8>);

/// Who receives a block's completion.
pub(crate) enum Completer {
    Caller(Callback),
    Internal(crossbeam_channel::Sender<InternalReply>),
}
