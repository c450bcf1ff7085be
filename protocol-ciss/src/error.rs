//! Error types for adapter encoding and decoding.

/// Error type for decoding hardware-visible structures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Buffer is shorter than the structure being decoded.
    #[error("incomplete data: need {need} bytes, have {have}")]
    Incomplete { need: usize, have: usize },

    /// Bus address does not satisfy the request-buffer alignment.
    #[error("misaligned bus address: {0:#010x}")]
    Misaligned(u32),

    /// Unknown request kind byte.
    #[error("unknown request kind: {0:#04x}")]
    UnknownKind(u8),

    /// Unknown data direction byte.
    #[error("unknown direction: {0:#04x}")]
    UnknownDirection(u8),

    /// Unknown command status code.
    #[error("unknown command status: {0:#06x}")]
    UnknownStatus(u16),

    /// Scatter list longer than a request frame can hold.
    #[error("too many scatter-gather entries: {0}")]
    TooManySegments(usize),

    /// CDB longer than a request frame can hold.
    #[error("cdb too long: {0} bytes")]
    CdbTooLong(usize),

    /// Capability table does not carry the expected signature.
    #[error("bad capability table signature: {0:?}")]
    BadSignature([u8; 4]),

    /// Scatter-gather lengths add up to more than a frame's `u32` transfer
    /// length.
    #[error("transfer length overflows u32")]
    TransferTooLong,

    /// Report-LUNs list length is not a multiple of the entry size.
    #[error("invalid lun list length: {0}")]
    InvalidLength(usize),
}
