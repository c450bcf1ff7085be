//! Adapter register map and the bit layouts carried by each register.

/// Fixed adapter registers, addressed by BAR offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Register {
    /// Host → adapter doorbell.
    DoorbellIn = 0x20,
    /// Interrupt status (read) for single/shared-vector modes.
    InterruptStatus = 0x30,
    /// Interrupt mask; a set bit masks that source.
    InterruptMask = 0x34,
    /// Request submission port: takes a request-buffer bus address.
    SubmitPort = 0x40,
    /// Simple-mode completion port: yields one finished tag per read.
    ReplyPort = 0x44,
    /// Adapter → host doorbell.
    DoorbellOut = 0x9c,
    /// Interrupt clear (write 1 to clear) for single/shared-vector modes.
    InterruptClear = 0xa0,
    /// Firmware readiness.
    ScratchPad = 0xb0,
    /// Firmware heartbeat counter; advances while firmware is alive.
    Heartbeat = 0xb4,
    /// Host wall-clock, seconds, low word.
    HostTimeLow = 0xb8,
    /// Host wall-clock, seconds, high word.
    HostTimeHigh = 0xbc,
}

impl Register {
    /// BAR offset of this register.
    #[inline]
    pub const fn offset(self) -> u32 {
        self as u32
    }

    pub fn from_offset(offset: u32) -> Option<Self> {
        match offset {
            0x20 => Some(Register::DoorbellIn),
            0x30 => Some(Register::InterruptStatus),
            0x34 => Some(Register::InterruptMask),
            0x40 => Some(Register::SubmitPort),
            0x44 => Some(Register::ReplyPort),
            0x9c => Some(Register::DoorbellOut),
            0xa0 => Some(Register::InterruptClear),
            0xb0 => Some(Register::ScratchPad),
            0xb4 => Some(Register::Heartbeat),
            0xb8 => Some(Register::HostTimeLow),
            0xbc => Some(Register::HostTimeHigh),
            _ => None,
        }
    }
}

/// Sentinel read from [`Register::ReplyPort`] when no completion is queued.
pub const REPLY_EMPTY: u32 = 0xFFFF_FFFF;

/// Bits written by the host to [`Register::DoorbellIn`].
///
/// `CHANGE_CONFIG` and `EVENT_ACK` are cleared by the adapter once it has
/// acted on them; the host polls for the clear.
pub mod doorbell_in {
    pub const CHANGE_CONFIG: u32 = 1 << 0;
    pub const EVENT_ACK: u32 = 1 << 1;
    pub const RESET_ALERT: u32 = 1 << 4;
    pub const SOFT_RESET: u32 = 1 << 5;
    pub const HARD_RESET: u32 = 1 << 6;
}

/// Bits written by the adapter to [`Register::DoorbellOut`].
pub mod doorbell_out {
    /// Firmware has no critical operation in flight and accepts the reset.
    pub const ALERT_ACK: u32 = 1 << 0;
}

/// Interrupt status and mask bits.
pub mod interrupt {
    /// Firmware reported an unrecoverable error.
    pub const ERROR: u32 = 1 << 0;
    /// Unit-check condition; never attributable to a single command.
    pub const UNIT_CHECK: u32 = 1 << 1;
    /// Firmware went from not-ready to ready.
    pub const READY_TRANSITION: u32 = 1 << 2;
    /// One or more completions are waiting.
    pub const REPLY_PENDING: u32 = 1 << 3;

    pub const FATAL: u32 = ERROR | UNIT_CHECK;
    pub const ALL: u32 = ERROR | UNIT_CHECK | READY_TRANSITION | REPLY_PENDING;
}

/// Scratch-pad value once firmware is ready for commands.
pub const FIRMWARE_READY: u32 = 0xFFFF_0000;
/// Scratch-pad value while firmware is resetting.
pub const FIRMWARE_NOT_READY: u32 = 0x0000_0000;
/// Scratch-pad high half reported when firmware has faulted; the low half
/// carries the fault code.
pub const FIRMWARE_FAULT: u32 = 0xDEAD_0000;

/// Decoded [`Register::ScratchPad`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    NotReady,
    Ready,
    Faulted(u16),
    /// Anything else: firmware is mid-transition.
    Booting(u32),
}

impl FirmwareState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            FIRMWARE_READY => FirmwareState::Ready,
            FIRMWARE_NOT_READY => FirmwareState::NotReady,
            v if v & 0xFFFF_0000 == FIRMWARE_FAULT => FirmwareState::Faulted(v as u16),
            v => FirmwareState::Booting(v),
        }
    }

    pub fn is_ready(self) -> bool {
        self == FirmwareState::Ready
    }
}

/// Request buffers are aligned so the low bits of their bus address can
/// carry submission hints and reply flags.
pub const BUS_ALIGN: u32 = 32;

/// Low bit of a performant-mode submission word.
pub const PERFORMANT_SUBMIT: u32 = 1 << 0;
const BUCKET_SHIFT: u32 = 1;
const BUCKET_MASK: u32 = 0x7;

/// Build the word written to [`Register::SubmitPort`].
///
/// Simple mode writes the bare bus address. Performant mode ORs in the
/// fetch-bucket hint and the performant flag.
#[inline]
pub fn submit_word(bus_address: u32, bucket: Option<u8>) -> u32 {
    debug_assert_eq!(bus_address % BUS_ALIGN, 0, "unaligned request buffer");
    match bucket {
        None => bus_address,
        Some(b) => {
            bus_address | ((b as u32 & BUCKET_MASK) << BUCKET_SHIFT) | PERFORMANT_SUBMIT
        }
    }
}

/// Split a submission word into `(bus_address, bucket)`.
#[inline]
pub fn parse_submit_word(word: u32) -> (u32, Option<u8>) {
    let address = word & !(BUS_ALIGN - 1);
    if word & PERFORMANT_SUBMIT != 0 {
        (address, Some(((word >> BUCKET_SHIFT) & BUCKET_MASK) as u8))
    } else {
        (address, None)
    }
}
