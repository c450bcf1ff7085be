//! Command block arena.
//!
//! Blocks are created once, alongside their frame and result buffers in
//! [`HostMemory`], and reused for the lifetime of the adapter. Each block
//! carries one atomic state word packing a generation counter and a phase:
//!
//! ```text
//! bits 23..8  generation (bumped on every release)
//! bits  7..0  phase (Free / Pending / Completing)
//! ```
//!
//! Moving Pending → Completing is the single claim point shared by the
//! completion workers, the timer thread and the reset drain, so exactly one
//! of them delivers a block's completion.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use protocol_ciss::Tag;
use thiserror::Error;

use crate::command::Completer;
use crate::error::Error;
use crate::hw::HostMemory;

/// Error returned by [`CommandPool::allocate`] when no block is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command pool exhausted")]
pub struct PoolExhausted;

impl From<PoolExhausted> for Error {
    fn from(_: PoolExhausted) -> Self {
        Error::PoolExhausted
    }
}

/// Ownership phase of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Free = 0,
    Pending = 1,
    Completing = 2,
}

impl Phase {
    fn from_word(word: u32) -> Self {
        match word & PHASE_MASK {
            0 => Phase::Free,
            1 => Phase::Pending,
            _ => Phase::Completing,
        }
    }
}

const PHASE_MASK: u32 = 0xFF;
const GENERATION_SHIFT: u32 = 8;

#[inline]
fn pack(generation: u16, phase: Phase) -> u32 {
    ((generation as u32) << GENERATION_SHIFT) | phase as u32
}

#[inline]
fn generation_of(word: u32) -> u16 {
    (word >> GENERATION_SHIFT) as u16
}

/// One command slot.
pub struct CommandBlock {
    index: u16,
    internal: bool,
    bus_address: u32,
    state: AtomicU32,
    /// Milliseconds on the adapter clock; 0 = no timer.
    deadline: AtomicU64,
    retries: AtomicU8,
    sg_count: AtomicU8,
    completer: Mutex<Option<Completer>>,
}

impl CommandBlock {
    fn new(index: u16, internal: bool, bus_address: u32) -> Self {
        CommandBlock {
            index,
            internal,
            bus_address,
            state: AtomicU32::new(pack(0, Phase::Free)),
            deadline: AtomicU64::new(0),
            retries: AtomicU8::new(0),
            sg_count: AtomicU8::new(0),
            completer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Bus address of this block's request frame.
    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    #[inline]
    pub fn generation(&self) -> u16 {
        generation_of(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_word(self.state.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        self.phase() == Phase::Pending
    }

    /// Tag the adapter echoes back for this block's current use.
    ///
    /// Caller blocks use direct tags; internal blocks use their frame
    /// address so they resolve without the index encoding.
    pub fn tag(&self) -> Tag {
        if self.internal {
            Tag::Address(self.bus_address)
        } else {
            Tag::direct(self.index, self.generation())
        }
    }

    /// Install the completion target and timer for a fresh allocation.
    pub(crate) fn arm(&self, completer: Completer, deadline: u64, sg_count: u8) {
        *self.completer.lock() = Some(completer);
        self.deadline.store(deadline, Ordering::Release);
        self.retries.store(0, Ordering::Relaxed);
        self.sg_count.store(sg_count, Ordering::Relaxed);
    }

    pub(crate) fn take_completer(&self) -> Option<Completer> {
        self.completer.lock().take()
    }

    pub(crate) fn sg_count(&self) -> u8 {
        self.sg_count.load(Ordering::Relaxed)
    }

    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_timer(&self) {
        self.deadline.store(0, Ordering::Release);
    }

    /// Claim an expired timer. Returns false if the timer was cancelled or
    /// re-armed since `deadline` was read.
    pub(crate) fn take_timer(&self, deadline: u64) -> bool {
        deadline != 0
            && self
                .deadline
                .compare_exchange(deadline, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Count a transient re-post. Returns the new count.
    pub(crate) fn bump_retries(&self) -> u8 {
        self.retries.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub(crate) fn retries(&self) -> u8 {
        self.retries.load(Ordering::Relaxed)
    }
}

struct FreeLists {
    caller: Vec<u16>,
    internal: Vec<u16>,
}

/// Fixed arena of caller blocks followed by a reserved internal range.
pub struct CommandPool {
    blocks: Box<[CommandBlock]>,
    callers: u16,
    free: Mutex<FreeLists>,
}

impl CommandPool {
    /// Build a pool over `memory`, whose block count must equal
    /// `callers + internal`.
    pub fn new(memory: &HostMemory, callers: u16, internal: u16) -> Self {
        let total = callers as usize + internal as usize;
        debug_assert_eq!(memory.blocks(), total);
        let blocks = (0..total)
            .map(|i| CommandBlock::new(i as u16, i >= callers as usize, memory.frame_address(i)))
            .collect();
        // Reversed so the lowest index is handed out first.
        let caller = (0..callers).rev().collect();
        let internal = (callers..callers + internal).rev().collect();
        CommandPool {
            blocks,
            callers,
            free: Mutex::new(FreeLists { caller, internal }),
        }
    }

    /// Allocate a caller block. Never blocks; exhaustion is backpressure.
    pub fn allocate(&self) -> Result<&CommandBlock, PoolExhausted> {
        let index = self.free.lock().caller.pop().ok_or(PoolExhausted)?;
        Ok(self.activate(index))
    }

    /// Allocate from the reserved internal range.
    pub fn allocate_internal(&self) -> Result<&CommandBlock, PoolExhausted> {
        let index = self.free.lock().internal.pop().ok_or(PoolExhausted)?;
        Ok(self.activate(index))
    }

    fn activate(&self, index: u16) -> &CommandBlock {
        let block = &self.blocks[index as usize];
        let word = block.state.load(Ordering::Acquire);
        debug_assert_eq!(Phase::from_word(word), Phase::Free);
        block
            .state
            .store(pack(generation_of(word), Phase::Pending), Ordering::Release);
        block.cancel_timer();
        block
    }

    /// Return a block to its free list and bump its generation.
    ///
    /// Releasing a block that is already free is an error and leaves the
    /// pool untouched.
    pub fn release(&self, block: &CommandBlock) -> Result<(), Error> {
        let mut word = block.state.load(Ordering::Acquire);
        loop {
            if Phase::from_word(word) == Phase::Free {
                return Err(Error::DoubleRelease(block.index));
            }
            let next = pack(generation_of(word).wrapping_add(1), Phase::Free);
            match block
                .state
                .compare_exchange(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => word = actual,
            }
        }
        block.cancel_timer();
        block.completer.lock().take();

        let mut free = self.free.lock();
        if block.internal {
            free.internal.push(block.index);
        } else {
            free.caller.push(block.index);
        }
        Ok(())
    }

    /// Move a pending block to Completing. Exactly one caller wins for a
    /// given generation.
    pub fn claim(&self, block: &CommandBlock, generation: u16) -> bool {
        block
            .state
            .compare_exchange(
                pack(generation, Phase::Pending),
                pack(generation, Phase::Completing),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Find the pending block a completion refers to, with the generation
    /// to claim it under.
    ///
    /// Direct tags index the caller range and must match the current
    /// generation. Address tags fall back to a scan on frame address.
    pub fn resolve(&self, tag: Tag) -> Option<(&CommandBlock, u16)> {
        match tag {
            Tag::Direct { index, generation } => {
                if index >= self.callers {
                    return None;
                }
                let block = &self.blocks[index as usize];
                let word = block.state.load(Ordering::Acquire);
                (Phase::from_word(word) == Phase::Pending && generation_of(word) == generation)
                    .then_some((block, generation))
            }
            Tag::Address(address) => self.blocks.iter().find_map(|block| {
                if block.bus_address != address {
                    return None;
                }
                let word = block.state.load(Ordering::Acquire);
                (Phase::from_word(word) == Phase::Pending).then(|| (block, generation_of(word)))
            }),
        }
    }

    pub fn get(&self, index: u16) -> Option<&CommandBlock> {
        self.blocks.get(index as usize)
    }

    /// Caller range only.
    pub fn caller_blocks(&self) -> &[CommandBlock] {
        &self.blocks[..self.callers as usize]
    }

    /// Every block currently pending, caller and internal.
    pub fn pending(&self) -> impl Iterator<Item = &CommandBlock> {
        self.blocks.iter().filter(|b| b.is_pending())
    }

    /// Caller blocks currently allocated.
    pub fn in_use(&self) -> usize {
        self.callers as usize - self.free.lock().caller.len()
    }

    /// Internal blocks currently allocated.
    pub fn internal_in_use(&self) -> usize {
        self.blocks.len() - self.callers as usize - self.free.lock().internal.len()
    }

    /// Caller capacity.
    pub fn capacity(&self) -> usize {
        self.callers as usize
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn pool(callers: u16, internal: u16) -> (HostMemory, CommandPool) {
        let total = (callers + internal) as usize;
        let memory = HostMemory::new(total, internal as usize, 1, total);
        let pool = CommandPool::new(&memory, callers, internal);
        (memory, pool)
    }

    #[test]
    fn allocate_until_exhausted() {
        let (_memory, pool) = pool(4, 2);
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.in_use(), 4);
        assert_eq!(pool.allocate().err(), Some(PoolExhausted));
        // Internal range is unaffected.
        assert!(pool.allocate_internal().is_ok());

        pool.release(blocks[2]).unwrap();
        assert_eq!(pool.in_use(), 3);
        assert_eq!(pool.allocate().unwrap().index(), 2);
    }

    #[test]
    fn in_flight_tags_are_distinct() {
        let (_memory, pool) = pool(32, 2);
        let mut tags = HashSet::new();
        for _ in 0..32 {
            assert!(tags.insert(pool.allocate().unwrap().tag().encode()));
        }
        for _ in 0..2 {
            assert!(tags.insert(pool.allocate_internal().unwrap().tag().encode()));
        }
    }

    #[test]
    fn double_release_is_an_error() {
        let (_memory, pool) = pool(2, 2);
        let block = pool.allocate().unwrap();
        pool.release(block).unwrap();
        assert!(matches!(pool.release(block), Err(Error::DoubleRelease(0))));
        // The index went back exactly once.
        assert!(pool.allocate().is_ok());
        assert!(pool.allocate().is_ok());
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn release_bumps_generation() {
        let (_memory, pool) = pool(1, 2);
        let block = pool.allocate().unwrap();
        let old = block.tag();
        pool.release(block).unwrap();
        let block = pool.allocate().unwrap();
        assert_ne!(block.tag(), old);
        // A completion for the previous use is stale.
        assert!(pool.resolve(old).is_none());
        assert!(pool.resolve(block.tag()).is_some());
    }

    #[test]
    fn direct_lookup_round_trip() {
        let (_memory, pool) = pool(8, 2);
        let _ = pool.allocate().unwrap();
        let block = pool.allocate().unwrap();
        let raw = block.tag().encode() | 0b11;
        let (found, generation) = pool.resolve(Tag::decode(raw)).unwrap();
        assert_eq!(found.index(), block.index());
        assert_eq!(generation, block.generation());
    }

    #[test]
    fn fallback_matches_frame_address() {
        let (memory, pool) = pool(4, 2);
        let a = pool.allocate_internal().unwrap();
        let b = pool.allocate_internal().unwrap();
        assert!(!a.tag().is_direct());
        let (found, _) = pool.resolve(b.tag()).unwrap();
        assert_eq!(found.index(), b.index());
        assert_eq!(b.bus_address(), memory.frame_address(b.index() as usize));
        // Free blocks never match.
        pool.release(a).unwrap();
        assert!(pool.resolve(a.tag()).is_none());
    }

    #[test]
    fn claim_is_exclusive() {
        let (_memory, pool) = pool(2, 2);
        let block = pool.allocate().unwrap();
        let generation = block.generation();
        assert!(pool.claim(block, generation));
        assert!(!pool.claim(block, generation));
        assert_eq!(block.phase(), Phase::Completing);
        pool.release(block).unwrap();
        assert!(!pool.claim(block, generation));
    }

    #[test]
    fn claim_rejects_reused_slot() {
        let (_memory, pool) = pool(1, 2);
        let block = pool.allocate().unwrap();
        let stale = block.generation();
        pool.release(block).unwrap();
        let block = pool.allocate().unwrap();
        assert!(!pool.claim(block, stale));
        assert!(pool.claim(block, block.generation()));
    }

    #[test]
    fn timer_claim_once() {
        let (_memory, pool) = pool(1, 2);
        let block = pool.allocate().unwrap();
        block.deadline.store(42, Ordering::Release);
        assert!(block.take_timer(42));
        assert!(!block.take_timer(42));
        assert_eq!(block.deadline(), 0);
    }

    #[test]
    fn concurrent_alloc_release_respects_capacity() {
        use std::sync::Arc;
        use std::thread;

        let memory = HostMemory::new(10, 2, 1, 10);
        let pool = Arc::new(CommandPool::new(&memory, 8, 2));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(block) = pool.allocate() {
                            assert!(pool.in_use() <= pool.capacity());
                            pool.release(block).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
