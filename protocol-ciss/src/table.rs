//! Capability / configuration table shared between host and adapter.

use crate::error::ParseError;

pub const SIGNATURE: [u8; 4] = *b"CISS";

/// Number of block-fetch buckets the adapter accepts.
pub const BUCKET_COUNT: usize = 8;

/// Transport method and capability bits (`transport_support`,
/// `transport_request`, `transport_active`).
pub mod transport {
    pub const SIMPLE: u32 = 1 << 1;
    pub const PERFORMANT: u32 = 1 << 2;
    /// Adapter supports a soft reset that skips the power-cycle step.
    pub const SOFT_RESET: u32 = 1 << 8;
    /// Adapter can deliver one interrupt vector per reply queue.
    pub const MULTI_VECTOR: u32 = 1 << 9;
}

/// Asynchronous event bits (`event_notify_mask`, `event_notify`).
pub mod event {
    pub const PHYSICAL_CHANGE: u32 = 1 << 0;
    pub const LOGICAL_CHANGE: u32 = 1 << 1;
    pub const ERROR_LOG: u32 = 1 << 2;

    /// Events that require a device-table rescan.
    pub const RESCAN: u32 = PHYSICAL_CHANGE | LOGICAL_CHANGE;
    pub const ALL: u32 = PHYSICAL_CHANGE | LOGICAL_CHANGE | ERROR_LOG;
}

/// Capability/configuration table.
///
/// Fields are split by writer: the adapter fills in identity and limits,
/// the host fills in the `*_request` / bucket / ring fields and rings
/// `CHANGE_CONFIG`, after which the adapter publishes `transport_active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTable {
    pub signature: [u8; 4],
    pub firmware_version: u32,
    pub transport_support: u32,
    pub max_queue_depth: u32,
    pub max_sg_entries: u32,
    pub reply_queue_count: u32,

    pub transport_request: u32,
    pub reply_ring_len: u32,
    pub fetch_buckets: [u16; BUCKET_COUNT],
    pub event_notify_mask: u32,

    pub transport_active: u32,
    pub event_notify: u32,
}

impl Default for ConfigTable {
    fn default() -> Self {
        ConfigTable {
            signature: SIGNATURE,
            firmware_version: 0,
            transport_support: transport::SIMPLE,
            max_queue_depth: 0,
            max_sg_entries: 0,
            reply_queue_count: 1,
            transport_request: 0,
            reply_ring_len: 0,
            fetch_buckets: [0; BUCKET_COUNT],
            event_notify_mask: 0,
            transport_active: 0,
            event_notify: 0,
        }
    }
}

impl ConfigTable {
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.signature != SIGNATURE {
            return Err(ParseError::BadSignature(self.signature));
        }
        Ok(())
    }

    #[inline]
    pub fn supports(&self, bits: u32) -> bool {
        self.transport_support & bits == bits
    }

    /// Firmware version as `major.minor`.
    pub fn firmware_version_string(&self) -> String {
        format!(
            "{}.{}",
            self.firmware_version >> 16,
            self.firmware_version & 0xFFFF
        )
    }
}
