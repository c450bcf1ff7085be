//! Device addressing and the extended report-LUNs payload.

use crate::error::ParseError;

/// Eight-byte device address as used in request frames and LUN reports.
///
/// Byte 3 carries the addressing mode:
///
/// - `0x00`: the controller itself (all other bytes zero)
/// - `0x40`: logical volume, bytes 0..2 = volume id (little endian)
/// - `0xC0`: physical device, bytes 0..3 = lun, target, bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LunAddress(pub [u8; 8]);

impl LunAddress {
    const MODE_LOGICAL: u8 = 0x40;
    const MODE_PHYSICAL: u8 = 0xC0;

    /// The controller's own logical identity.
    pub const CONTROLLER: LunAddress = LunAddress([0; 8]);

    pub fn logical(volume: u16) -> Self {
        let [lo, hi] = volume.to_le_bytes();
        LunAddress([lo, hi, 0, Self::MODE_LOGICAL, 0, 0, 0, 0])
    }

    pub fn physical(bus: u8, target: u8, lun: u8) -> Self {
        LunAddress([lun, target, bus, Self::MODE_PHYSICAL, 0, 0, 0, 0])
    }

    pub fn is_controller(&self) -> bool {
        *self == Self::CONTROLLER
    }

    pub fn is_logical(&self) -> bool {
        self.0[3] == Self::MODE_LOGICAL
    }

    pub fn is_physical(&self) -> bool {
        self.0[3] == Self::MODE_PHYSICAL
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Display for LunAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        if self.is_controller() {
            write!(f, "controller")
        } else if self.is_logical() {
            write!(f, "volume:{}", u16::from_le_bytes([b[0], b[1]]))
        } else if self.is_physical() {
            write!(f, "{}:{}:{}", b[2], b[1], b[0])
        } else {
            write!(f, "{:02x?}", b)
        }
    }
}

/// One entry of an extended report-LUNs response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LunEntry {
    pub address: LunAddress,
    /// SCSI peripheral device type (0x00 disk, 0x0C storage array, ...).
    pub device_type: u8,
    /// RAID level for logical volumes; `None` for physical devices.
    pub raid_level: Option<u8>,
    pub offline: bool,
}

impl LunEntry {
    pub fn new(address: LunAddress, device_type: u8) -> Self {
        LunEntry {
            address,
            device_type,
            raid_level: None,
            offline: false,
        }
    }

    pub fn with_raid_level(mut self, level: u8) -> Self {
        self.raid_level = Some(level);
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }
}

/// Extended report-LUNs payload.
///
/// ```text
/// header (8 bytes): list length in bytes (u32 BE) | extended flag | 3 reserved
/// entry (16 bytes): address[8] | device type | raid level (0xFF = none) | flags | 5 reserved
/// ```
pub struct ReportLuns;

impl ReportLuns {
    pub const HEADER_LEN: usize = 8;
    pub const ENTRY_LEN: usize = 16;
    const EXTENDED: u8 = 0x02;
    const NO_RAID: u8 = 0xFF;
    const FLAG_OFFLINE: u8 = 1 << 0;

    /// Bytes needed to encode `count` entries.
    pub fn encoded_len(count: usize) -> usize {
        Self::HEADER_LEN + count * Self::ENTRY_LEN
    }

    /// Encode `entries` into `buf`, replacing its contents.
    pub fn encode(entries: &[LunEntry], buf: &mut Vec<u8>) {
        buf.clear();
        let list_len = (entries.len() * Self::ENTRY_LEN) as u32;
        buf.extend_from_slice(&list_len.to_be_bytes());
        buf.extend_from_slice(&[Self::EXTENDED, 0, 0, 0]);
        for entry in entries {
            buf.extend_from_slice(entry.address.as_bytes());
            buf.push(entry.device_type);
            buf.push(entry.raid_level.unwrap_or(Self::NO_RAID));
            buf.push(if entry.offline { Self::FLAG_OFFLINE } else { 0 });
            buf.extend_from_slice(&[0; 5]);
        }
    }

    /// Parse a response, in firmware reporting order.
    pub fn parse(data: &[u8]) -> Result<Vec<LunEntry>, ParseError> {
        if data.len() < Self::HEADER_LEN {
            return Err(ParseError::Incomplete {
                need: Self::HEADER_LEN,
                have: data.len(),
            });
        }
        let list_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if list_len % Self::ENTRY_LEN != 0 {
            return Err(ParseError::InvalidLength(list_len));
        }
        let need = Self::HEADER_LEN + list_len;
        if data.len() < need {
            return Err(ParseError::Incomplete {
                need,
                have: data.len(),
            });
        }

        let entries = data[Self::HEADER_LEN..need]
            .chunks_exact(Self::ENTRY_LEN)
            .map(|chunk| {
                let mut address = [0u8; 8];
                address.copy_from_slice(&chunk[..8]);
                LunEntry {
                    address: LunAddress(address),
                    device_type: chunk[8],
                    raid_level: (chunk[9] != Self::NO_RAID).then_some(chunk[9]),
                    offline: chunk[10] & Self::FLAG_OFFLINE != 0,
                }
            })
            .collect();
        Ok(entries)
    }
}
