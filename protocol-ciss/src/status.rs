use crate::error::ParseError;

/// Per-command completion status, as found in the result buffer.
///
/// Codes below `0x80` are written by firmware. `AdapterWasReset` and
/// `NoConnection` are synthesized by the host during reset drain and while
/// the controller is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandStatus {
    Success = 0x00,
    TargetBusy = 0x01,
    DataUnderrun = 0x02,
    DataOverrun = 0x03,
    InvalidRequest = 0x04,
    ProtocolError = 0x05,
    HardwareError = 0x06,
    Aborted = 0x08,
    AbortFailed = 0x09,
    TimedOut = 0x0B,
    UnitAttention = 0x0C,
    AdapterWasReset = 0x80,
    NoConnection = 0x81,
}

impl CommandStatus {
    pub fn from_u16(v: u16) -> Result<Self, ParseError> {
        Ok(match v {
            0x00 => CommandStatus::Success,
            0x01 => CommandStatus::TargetBusy,
            0x02 => CommandStatus::DataUnderrun,
            0x03 => CommandStatus::DataOverrun,
            0x04 => CommandStatus::InvalidRequest,
            0x05 => CommandStatus::ProtocolError,
            0x06 => CommandStatus::HardwareError,
            0x08 => CommandStatus::Aborted,
            0x09 => CommandStatus::AbortFailed,
            0x0B => CommandStatus::TimedOut,
            0x0C => CommandStatus::UnitAttention,
            0x80 => CommandStatus::AdapterWasReset,
            0x81 => CommandStatus::NoConnection,
            other => return Err(ParseError::UnknownStatus(other)),
        })
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == CommandStatus::Success
    }

    /// Busy/attention conditions worth re-posting before surfacing.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, CommandStatus::TargetBusy | CommandStatus::UnitAttention)
    }
}
