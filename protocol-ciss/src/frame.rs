//! Request and result buffer layouts.
//!
//! Each command block owns one request frame and one error-info buffer in
//! host memory. The host fills the frame, posts its bus address, and the
//! adapter writes the error-info buffer before posting the reply.

use crate::error::ParseError;
use crate::luns::LunAddress;
use crate::status::CommandStatus;

pub const MAX_SG_ENTRIES: usize = 32;
pub const MAX_CDB_LEN: usize = 16;
pub const SENSE_LEN: usize = 32;

const HEADER_LEN: usize = 48;
const SG_ENTRY_LEN: usize = 16;

/// Encoded size of a [`RequestFrame`].
pub const FRAME_LEN: usize = HEADER_LEN + MAX_SG_ENTRIES * SG_ENTRY_LEN;
/// Encoded size of an [`ErrorInfo`].
pub const ERROR_INFO_LEN: usize = 8 + SENSE_LEN;

/// What the adapter is asked to do with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RequestKind {
    /// Caller I/O: a CDB addressed to a device.
    #[default]
    Scsi = 0,
    /// Abort the command whose tag is in `abort_target`.
    Abort = 1,
    /// No-op, used to probe firmware liveness after reset.
    NoOp = 2,
    ReportPhysicalLuns = 3,
    ReportLogicalLuns = 4,
    FlushCache = 5,
}

impl RequestKind {
    pub fn from_u8(v: u8) -> Result<Self, ParseError> {
        Ok(match v {
            0 => RequestKind::Scsi,
            1 => RequestKind::Abort,
            2 => RequestKind::NoOp,
            3 => RequestKind::ReportPhysicalLuns,
            4 => RequestKind::ReportLogicalLuns,
            5 => RequestKind::FlushCache,
            other => return Err(ParseError::UnknownKind(other)),
        })
    }
}

/// Data transfer direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Direction {
    #[default]
    None = 0,
    ToDevice = 1,
    FromDevice = 2,
    Bidirectional = 3,
}

impl Direction {
    pub fn from_u8(v: u8) -> Result<Self, ParseError> {
        Ok(match v {
            0 => Direction::None,
            1 => Direction::ToDevice,
            2 => Direction::FromDevice,
            3 => Direction::Bidirectional,
            other => return Err(ParseError::UnknownDirection(other)),
        })
    }
}

/// One scatter-gather descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SgEntry {
    pub address: u64,
    pub len: u32,
}

impl SgEntry {
    pub fn new(address: u64, len: u32) -> Self {
        SgEntry { address, len }
    }
}

/// Hardware request buffer.
///
/// # Layout (little endian)
///
/// ```text
///  0  kind            u8
///  1  reply queue     u8
///  2  direction       u8
///  3  sg count        u8
///  4  tag             u32
///  8  device address  [u8; 8]
/// 16  timeout (s)     u16
/// 18  cdb length      u8
/// 19  reserved        u8
/// 20  cdb             [u8; 16]
/// 36  abort target    u32
/// 40  data length     u32
/// 44  reserved        u32
/// 48  sg entries      { address u64, len u32, reserved u32 } x 32
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub kind: RequestKind,
    pub reply_queue: u8,
    pub direction: Direction,
    pub tag: u32,
    pub address: LunAddress,
    pub timeout_secs: u16,
    pub cdb_len: u8,
    pub cdb: [u8; MAX_CDB_LEN],
    pub abort_target: u32,
    pub data_len: u32,
    pub sg_count: u8,
    pub sg: [SgEntry; MAX_SG_ENTRIES],
}

impl Default for RequestFrame {
    fn default() -> Self {
        RequestFrame {
            kind: RequestKind::Scsi,
            reply_queue: 0,
            direction: Direction::None,
            tag: 0,
            address: LunAddress::CONTROLLER,
            timeout_secs: 0,
            cdb_len: 0,
            cdb: [0; MAX_CDB_LEN],
            abort_target: 0,
            data_len: 0,
            sg_count: 0,
            sg: [SgEntry::default(); MAX_SG_ENTRIES],
        }
    }
}

/// Sum of segment lengths, or `None` if it does not fit the frame's
/// transfer length field.
pub fn total_len(sg: &[SgEntry]) -> Option<u32> {
    sg.iter().try_fold(0u32, |acc, e| acc.checked_add(e.len))
}

impl RequestFrame {
    /// Frame for an internally generated command with no CDB.
    pub fn control(kind: RequestKind) -> Self {
        RequestFrame {
            kind,
            ..RequestFrame::default()
        }
    }

    pub fn set_cdb(&mut self, cdb: &[u8]) -> Result<(), ParseError> {
        if cdb.len() > MAX_CDB_LEN {
            return Err(ParseError::CdbTooLong(cdb.len()));
        }
        self.cdb = [0; MAX_CDB_LEN];
        self.cdb[..cdb.len()].copy_from_slice(cdb);
        self.cdb_len = cdb.len() as u8;
        Ok(())
    }

    pub fn set_sg(&mut self, sg: &[SgEntry]) -> Result<(), ParseError> {
        if sg.len() > MAX_SG_ENTRIES {
            return Err(ParseError::TooManySegments(sg.len()));
        }
        let data_len = total_len(sg).ok_or(ParseError::TransferTooLong)?;
        self.sg = [SgEntry::default(); MAX_SG_ENTRIES];
        self.sg[..sg.len()].copy_from_slice(sg);
        self.sg_count = sg.len() as u8;
        self.data_len = data_len;
        Ok(())
    }

    /// Populated scatter-gather entries.
    pub fn segments(&self) -> &[SgEntry] {
        &self.sg[..self.sg_count as usize]
    }

    pub fn encode(&self, buf: &mut [u8; FRAME_LEN]) {
        buf.fill(0);
        buf[0] = self.kind as u8;
        buf[1] = self.reply_queue;
        buf[2] = self.direction as u8;
        buf[3] = self.sg_count;
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..16].copy_from_slice(self.address.as_bytes());
        buf[16..18].copy_from_slice(&self.timeout_secs.to_le_bytes());
        buf[18] = self.cdb_len;
        buf[20..36].copy_from_slice(&self.cdb);
        buf[36..40].copy_from_slice(&self.abort_target.to_le_bytes());
        buf[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        for (i, entry) in self.segments().iter().enumerate() {
            let off = HEADER_LEN + i * SG_ENTRY_LEN;
            buf[off..off + 8].copy_from_slice(&entry.address.to_le_bytes());
            buf[off + 8..off + 12].copy_from_slice(&entry.len.to_le_bytes());
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < FRAME_LEN {
            return Err(ParseError::Incomplete {
                need: FRAME_LEN,
                have: buf.len(),
            });
        }
        let sg_count = buf[3] as usize;
        if sg_count > MAX_SG_ENTRIES {
            return Err(ParseError::TooManySegments(sg_count));
        }
        let cdb_len = buf[18] as usize;
        if cdb_len > MAX_CDB_LEN {
            return Err(ParseError::CdbTooLong(cdb_len));
        }

        let mut address = [0u8; 8];
        address.copy_from_slice(&buf[8..16]);
        let mut cdb = [0u8; MAX_CDB_LEN];
        cdb.copy_from_slice(&buf[20..36]);
        let mut sg = [SgEntry::default(); MAX_SG_ENTRIES];
        for (i, entry) in sg.iter_mut().take(sg_count).enumerate() {
            let off = HEADER_LEN + i * SG_ENTRY_LEN;
            entry.address = u64::from_le_bytes(le_array(&buf[off..off + 8]));
            entry.len = u32::from_le_bytes(le_array(&buf[off + 8..off + 12]));
        }

        Ok(RequestFrame {
            kind: RequestKind::from_u8(buf[0])?,
            reply_queue: buf[1],
            direction: Direction::from_u8(buf[2])?,
            tag: u32::from_le_bytes(le_array(&buf[4..8])),
            address: LunAddress(address),
            timeout_secs: u16::from_le_bytes(le_array(&buf[16..18])),
            cdb_len: cdb_len as u8,
            cdb,
            abort_target: u32::from_le_bytes(le_array(&buf[36..40])),
            data_len: u32::from_le_bytes(le_array(&buf[40..44])),
            sg_count: sg_count as u8,
            sg,
        })
    }
}

/// Hardware result buffer, written by the adapter when a reply carries the
/// error flag.
///
/// ```text
/// 0  scsi status     u8
/// 1  sense length    u8
/// 2  command status  u16
/// 4  residual        u32
/// 8  sense data      [u8; 32]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    pub status: CommandStatus,
    pub scsi_status: u8,
    pub residual: u32,
    pub sense_len: u8,
    pub sense: [u8; SENSE_LEN],
}

impl Default for ErrorInfo {
    fn default() -> Self {
        ErrorInfo::new(CommandStatus::Success)
    }
}

impl ErrorInfo {
    pub fn new(status: CommandStatus) -> Self {
        ErrorInfo {
            status,
            scsi_status: 0,
            residual: 0,
            sense_len: 0,
            sense: [0; SENSE_LEN],
        }
    }

    pub fn with_residual(mut self, residual: u32) -> Self {
        self.residual = residual;
        self
    }

    pub fn encode(&self, buf: &mut [u8; ERROR_INFO_LEN]) {
        buf[0] = self.scsi_status;
        buf[1] = self.sense_len;
        buf[2..4].copy_from_slice(&(self.status as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&self.residual.to_le_bytes());
        buf[8..].copy_from_slice(&self.sense);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < ERROR_INFO_LEN {
            return Err(ParseError::Incomplete {
                need: ERROR_INFO_LEN,
                have: buf.len(),
            });
        }
        let mut sense = [0u8; SENSE_LEN];
        sense.copy_from_slice(&buf[8..ERROR_INFO_LEN]);
        Ok(ErrorInfo {
            status: CommandStatus::from_u16(u16::from_le_bytes([buf[2], buf[3]]))?,
            scsi_status: buf[0],
            residual: u32::from_le_bytes(le_array(&buf[4..8])),
            sense_len: buf[1].min(SENSE_LEN as u8),
            sense,
        })
    }
}

#[inline]
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
