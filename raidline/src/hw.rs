//! The seam between the engine and an adapter.
//!
//! [`Hardware`] is the register set. [`HostMemory`] holds every region the
//! host allocates for the adapter to read or write: request frames, result
//! buffers, internal data buffers, reply rings and the capability table.
//! The engine and the adapter share one `Arc<HostMemory>`.

use std::sync::Weak;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use protocol_ciss::{
    BUS_ALIGN, ConfigTable, ERROR_INFO_LEN, ErrorInfo, FRAME_LEN, ParseError, Register,
    RequestFrame,
};

/// Register access to one adapter.
///
/// Implementations must tolerate concurrent calls from interrupt context,
/// completion workers, the controller thread and submitters.
pub trait Hardware: Send + Sync + 'static {
    fn read(&self, reg: Register) -> u32;

    fn write(&self, reg: Register, value: u32);

    /// Hand the adapter the host-allocated regions. Called once, before any
    /// register access.
    fn map_host_memory(&self, memory: std::sync::Arc<HostMemory>);

    /// Connect interrupt delivery. The adapter calls
    /// [`InterruptLine::raise`] with the vector number.
    fn connect_interrupts(&self, line: Weak<dyn InterruptLine>);
}

/// Receiver of adapter interrupts.
pub trait InterruptLine: Send + Sync {
    fn raise(&self, vector: u16);
}

/// Bus address of the first request frame.
pub const FRAME_BASE: u32 = 0x1000_0000;
/// Distance between request frames; keeps every frame on [`BUS_ALIGN`].
pub const FRAME_STRIDE: u32 = FRAME_LEN.div_ceil(BUS_ALIGN as usize) as u32 * BUS_ALIGN;
/// Bus address of the first internal data buffer.
pub const DATA_BASE: u32 = 0x4000_0000;
/// Size of each internal data buffer.
pub const DATA_LEN: usize = 4096;

const _: () = assert!(FRAME_STRIDE % BUS_ALIGN == 0);

/// Host-allocated regions shared with the adapter.
pub struct HostMemory {
    frames: Box<[Mutex<[u8; FRAME_LEN]>]>,
    results: Box<[Mutex<[u8; ERROR_INFO_LEN]>]>,
    /// Data buffers for the internal range only, indexed from `data_start`.
    data: Box<[Mutex<Vec<u8>>]>,
    data_start: usize,
    rings: Box<[Box<[AtomicU32]>]>,
    table: Mutex<ConfigTable>,
}

impl HostMemory {
    /// Allocate `blocks` frames and result buffers, data buffers for the
    /// last `internal` blocks, and `queues` reply rings of `ring_len` slots.
    pub fn new(blocks: usize, internal: usize, queues: usize, ring_len: usize) -> Self {
        debug_assert!(internal <= blocks);
        let frames = (0..blocks).map(|_| Mutex::new([0u8; FRAME_LEN])).collect();
        let results = (0..blocks)
            .map(|_| Mutex::new([0u8; ERROR_INFO_LEN]))
            .collect();
        let data = (0..internal)
            .map(|_| Mutex::new(Vec::with_capacity(DATA_LEN)))
            .collect();
        let rings = (0..queues)
            .map(|_| (0..ring_len).map(|_| AtomicU32::new(0)).collect())
            .collect();
        HostMemory {
            frames,
            results,
            data,
            data_start: blocks - internal,
            rings,
            table: Mutex::new(ConfigTable::default()),
        }
    }

    pub fn blocks(&self) -> usize {
        self.frames.len()
    }

    // ── Request frames ───────────────────────────────────────────────

    /// Bus address of block `index`'s request frame.
    #[inline]
    pub fn frame_address(&self, index: usize) -> u32 {
        FRAME_BASE + index as u32 * FRAME_STRIDE
    }

    /// Block index owning the frame at `bus_address`, if any.
    pub fn frame_index(&self, bus_address: u32) -> Option<usize> {
        let offset = bus_address.checked_sub(FRAME_BASE)?;
        if offset % FRAME_STRIDE != 0 {
            return None;
        }
        let index = (offset / FRAME_STRIDE) as usize;
        (index < self.frames.len()).then_some(index)
    }

    pub fn write_frame(&self, index: usize, frame: &RequestFrame) {
        frame.encode(&mut self.frames[index].lock());
    }

    pub fn read_frame(&self, index: usize) -> Result<RequestFrame, ParseError> {
        RequestFrame::decode(&self.frames[index].lock()[..])
    }

    // ── Result buffers ───────────────────────────────────────────────

    pub fn write_result(&self, index: usize, info: &ErrorInfo) {
        info.encode(&mut self.results[index].lock());
    }

    pub fn read_result(&self, index: usize) -> Result<ErrorInfo, ParseError> {
        ErrorInfo::decode(&self.results[index].lock()[..])
    }

    pub fn clear_result(&self, index: usize) {
        self.results[index].lock().fill(0);
    }

    // ── Internal data buffers ────────────────────────────────────────

    /// Bus address of block `index`'s data buffer.
    pub fn data_address(&self, index: usize) -> Option<u32> {
        let slot = index.checked_sub(self.data_start)?;
        (slot < self.data.len()).then(|| DATA_BASE + (slot * DATA_LEN) as u32)
    }

    /// Data buffer of an internal block.
    pub fn data(&self, index: usize) -> Option<MutexGuard<'_, Vec<u8>>> {
        let slot = index.checked_sub(self.data_start)?;
        self.data.get(slot).map(|m| m.lock())
    }

    /// Data buffer located by bus address.
    pub fn data_at(&self, bus_address: u32) -> Option<MutexGuard<'_, Vec<u8>>> {
        let offset = bus_address.checked_sub(DATA_BASE)? as usize;
        if offset % DATA_LEN != 0 {
            return None;
        }
        self.data.get(offset / DATA_LEN).map(|m| m.lock())
    }

    // ── Reply rings ──────────────────────────────────────────────────

    pub fn queues(&self) -> usize {
        self.rings.len()
    }

    pub fn ring(&self, queue: usize) -> &[AtomicU32] {
        &self.rings[queue]
    }

    /// Zero every ring slot.
    pub fn clear_rings(&self) {
        for ring in self.rings.iter() {
            for slot in ring.iter() {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }

    // ── Capability table ─────────────────────────────────────────────

    pub fn table(&self) -> MutexGuard<'_, ConfigTable> {
        self.table.lock()
    }
}
