use crate::error::ParseError;
use crate::register::BUS_ALIGN;

/// Command identifier handed to the adapter and echoed back on completion.
///
/// Layout (32-bit):
/// ```text
/// Direct:   bits 31..16 generation | bits 15..3 pool index | bit 2 = 1 | bits 1..0 reserved
/// Address:  bits 31..5 request-buffer bus address          | bit 2 = 0 | bits 1..0 reserved
/// ```
///
/// Bits 1..0 are owned by the reply entry (error flag and toggle bit).
/// Direct tags resolve to a pool slot in O(1); the generation guards
/// against completions for a slot that has since been reused. Address tags
/// are used by internally generated commands and resolve by matching the
/// request-buffer bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Direct { index: u16, generation: u16 },
    Address(u32),
}

impl Tag {
    pub const DIRECT_LOOKUP: u32 = 1 << 2;
    const INDEX_SHIFT: u32 = 3;
    const INDEX_MASK: u32 = 0x1FFF;
    const GENERATION_SHIFT: u32 = 16;
    /// Bits that never belong to the tag itself.
    pub const FLAG_MASK: u32 = 0b11;
    /// Largest pool index a direct tag can address.
    pub const MAX_DIRECT_INDEX: u16 = Self::INDEX_MASK as u16;

    /// Build a direct-lookup tag.
    #[inline]
    pub fn direct(index: u16, generation: u16) -> Self {
        debug_assert!(index <= Self::MAX_DIRECT_INDEX, "pool index exceeds 13 bits");
        Tag::Direct { index, generation }
    }

    /// Build an address tag for a request buffer.
    pub fn address(bus_address: u32) -> Result<Self, ParseError> {
        if bus_address % BUS_ALIGN != 0 {
            return Err(ParseError::Misaligned(bus_address));
        }
        Ok(Tag::Address(bus_address))
    }

    /// Encode to the 32-bit hardware word.
    #[inline]
    pub fn encode(self) -> u32 {
        match self {
            Tag::Direct { index, generation } => {
                ((generation as u32) << Self::GENERATION_SHIFT)
                    | (((index as u32) & Self::INDEX_MASK) << Self::INDEX_SHIFT)
                    | Self::DIRECT_LOOKUP
            }
            Tag::Address(addr) => addr,
        }
    }

    /// Decode a hardware word. Reply flag bits are ignored.
    #[inline]
    pub fn decode(raw: u32) -> Self {
        let raw = raw & !Self::FLAG_MASK;
        if raw & Self::DIRECT_LOOKUP != 0 {
            Tag::Direct {
                index: ((raw >> Self::INDEX_SHIFT) & Self::INDEX_MASK) as u16,
                generation: (raw >> Self::GENERATION_SHIFT) as u16,
            }
        } else {
            Tag::Address(raw & !(BUS_ALIGN - 1))
        }
    }

    pub fn is_direct(self) -> bool {
        matches!(self, Tag::Direct { .. })
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tag::Direct { index, generation } => write!(f, "#{index}.{generation}"),
            Tag::Address(addr) => write!(f, "@{addr:#010x}"),
        }
    }
}

/// One reply-ring slot as written by the adapter.
///
/// ```text
/// bits 31..2: tag word (see [`Tag`])
/// bit 1:      error info present in the command's result buffer
/// bit 0:      toggle, flipped by the adapter on every ring wrap
/// ```
///
/// Ring memory starts zeroed and the host initially expects toggle `1`, so
/// an untouched slot never looks valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyEntry(pub u32);

impl ReplyEntry {
    pub const TOGGLE: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;

    #[inline]
    pub fn new(tag: Tag, error: bool, toggle: bool) -> Self {
        let mut raw = tag.encode() & !Tag::FLAG_MASK;
        if error {
            raw |= Self::ERROR;
        }
        if toggle {
            raw |= Self::TOGGLE;
        }
        ReplyEntry(raw)
    }

    #[inline]
    pub fn toggle(self) -> bool {
        self.0 & Self::TOGGLE != 0
    }

    #[inline]
    pub fn has_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    #[inline]
    pub fn tag(self) -> Tag {
        Tag::decode(self.0)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}
