//! Hardware-facing encodings for CISS-style RAID host-bus adapters.
//!
//! This crate is pure data layout: no I/O, no locking. It describes what the
//! host writes to and reads from the adapter.
//!
//! - **Registers**: the fixed register set, doorbell and interrupt bits,
//!   scratch-pad firmware states and the submission word.
//! - **Tags**: the 32-bit command identifier (direct pool index with
//!   generation, or request-buffer bus address) and reply-ring entries with
//!   their toggle bit.
//! - **Frames**: the fixed-size request buffer and the result/error buffer.
//! - **Config table**: the capability/configuration table used to negotiate
//!   the transport mode and block-fetch buckets.
//! - **LUNs**: device addresses and the extended report-LUNs payload.
//!
//! # Example
//!
//! ```
//! use protocol_ciss::{ReplyEntry, Tag};
//!
//! let tag = Tag::direct(12, 1);
//! let entry = ReplyEntry::new(tag, false, true);
//! assert!(entry.toggle());
//! assert_eq!(entry.tag(), tag);
//! ```

mod error;
mod frame;
mod luns;
mod register;
mod status;
pub mod table;
mod tag;

pub use error::ParseError;
pub use frame::{
    Direction, ERROR_INFO_LEN, ErrorInfo, FRAME_LEN, MAX_CDB_LEN, MAX_SG_ENTRIES, RequestFrame,
    RequestKind, SENSE_LEN, SgEntry, total_len,
};
pub use luns::{LunAddress, LunEntry, ReportLuns};
pub use register::{
    BUS_ALIGN, FIRMWARE_FAULT, FIRMWARE_NOT_READY, FIRMWARE_READY, FirmwareState,
    PERFORMANT_SUBMIT, REPLY_EMPTY, Register, doorbell_in, doorbell_out, interrupt,
    parse_submit_word, submit_word,
};
pub use status::CommandStatus;
pub use table::{BUCKET_COUNT, ConfigTable};
pub use tag::{ReplyEntry, Tag};
