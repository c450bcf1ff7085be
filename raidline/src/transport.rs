//! Submission and completion transport.
//!
//! Two modes are negotiated at bring-up:
//!
//! - **Simple**: completions are read one at a time from the reply port
//!   register; [`REPLY_EMPTY`] means nothing is queued.
//! - **Performant**: the adapter writes completions into host-resident
//!   reply rings (one per queue) and submissions carry a fetch-bucket hint.

use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use protocol_ciss::{REPLY_EMPTY, Register, ReplyEntry, RequestFrame, submit_word};

use crate::fetch::BucketTable;
use crate::hw::{Hardware, HostMemory};
use crate::pool::CommandBlock;
use crate::ring::ReplyCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransportMode {
    #[default]
    Simple = 0,
    Performant = 1,
}

impl TransportMode {
    fn from_u8(v: u8) -> Self {
        if v == TransportMode::Performant as u8 {
            TransportMode::Performant
        } else {
            TransportMode::Simple
        }
    }
}

pub struct Transport {
    hw: Arc<dyn Hardware>,
    memory: Arc<HostMemory>,
    mode: AtomicU8,
    buckets: RwLock<Option<BucketTable>>,
    /// Reply queues granted by the firmware; at most `cursors.len()`.
    active_queues: AtomicUsize,
    cursors: Box<[Mutex<ReplyCursor>]>,
    outstanding: AtomicUsize,
}

impl Transport {
    pub fn new(hw: Arc<dyn Hardware>, memory: Arc<HostMemory>) -> Self {
        let cursors = (0..memory.queues())
            .map(|_| Mutex::new(ReplyCursor::new()))
            .collect();
        Transport {
            hw,
            memory,
            mode: AtomicU8::new(TransportMode::Simple as u8),
            buckets: RwLock::new(None),
            active_queues: AtomicUsize::new(1),
            cursors,
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> TransportMode {
        TransportMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Reply queues currently in use.
    pub fn queues(&self) -> usize {
        self.active_queues.load(Ordering::Acquire)
    }

    /// Install the negotiated mode, queue count and bucket table.
    pub fn configure(&self, mode: TransportMode, queues: usize, buckets: BucketTable) {
        *self.buckets.write() = Some(buckets);
        self.active_queues
            .store(queues.clamp(1, self.cursors.len()), Ordering::Release);
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Zero ring memory and rewind every cursor.
    pub fn reset_rings(&self) {
        let mut cursors: Vec<_> = self.cursors.iter().map(|c| c.lock()).collect();
        self.memory.clear_rings();
        for cursor in cursors.iter_mut() {
            cursor.reset();
        }
    }

    /// Reply queue for a block.
    pub fn queue_for(&self, block: &CommandBlock) -> u8 {
        (block.index() as usize % self.queues()) as u8
    }

    /// Write `frame` into the block's request buffer and post it.
    pub fn submit(&self, block: &CommandBlock, frame: &RequestFrame) {
        self.memory.write_frame(block.index() as usize, frame);
        // Counted before posting; the completion may retire it at once.
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.post(block, frame.sg_count);
    }

    /// Post a block whose frame is already in host memory, keeping its tag.
    pub fn resubmit(&self, block: &CommandBlock) {
        self.memory.clear_result(block.index() as usize);
        self.post(block, block.sg_count());
    }

    fn post(&self, block: &CommandBlock, sg_count: u8) {
        let bucket = match self.mode() {
            TransportMode::Simple => None,
            TransportMode::Performant => self
                .buckets
                .read()
                .as_ref()
                .and_then(|b| b.bucket_for(sg_count as usize)),
        };
        // Frame contents must be visible before the adapter sees the address.
        atomic::fence(Ordering::SeqCst);
        self.hw
            .write(Register::SubmitPort, submit_word(block.bus_address(), bucket));
    }

    /// Next completion for `queue`, if one is ready.
    pub fn next_completion(&self, queue: usize) -> Option<ReplyEntry> {
        match self.mode() {
            TransportMode::Simple => {
                if queue != 0 {
                    return None;
                }
                match self.hw.read(Register::ReplyPort) {
                    REPLY_EMPTY => None,
                    raw => Some(ReplyEntry(raw)),
                }
            }
            TransportMode::Performant => {
                if queue >= self.queues() {
                    return None;
                }
                self.cursors[queue].lock().pop(self.memory.ring(queue))
            }
        }
    }

    /// Account for a completed command.
    pub fn retire(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::hw::InterruptLine;
    use crate::pool::CommandPool;
    use protocol_ciss::{PERFORMANT_SUBMIT, Tag, parse_submit_word};

    /// Records submit-port writes and serves a scripted reply port.
    #[derive(Default)]
    struct Registers {
        submitted: Mutex<Vec<u32>>,
        replies: Mutex<Vec<u32>>,
    }

    impl Hardware for Registers {
        fn read(&self, reg: Register) -> u32 {
            match reg {
                Register::ReplyPort => self.replies.lock().pop().unwrap_or(REPLY_EMPTY),
                _ => 0,
            }
        }

        fn write(&self, reg: Register, value: u32) {
            if reg == Register::SubmitPort {
                self.submitted.lock().push(value);
            }
        }

        fn map_host_memory(&self, _memory: Arc<HostMemory>) {}

        fn connect_interrupts(&self, _line: Weak<dyn InterruptLine>) {}
    }

    fn setup(queues: usize) -> (Arc<Registers>, Arc<HostMemory>, CommandPool, Transport) {
        let regs = Arc::new(Registers::default());
        let memory = Arc::new(HostMemory::new(10, 2, queues, 10));
        let pool = CommandPool::new(&memory, 8, 2);
        let transport = Transport::new(regs.clone(), memory.clone());
        (regs, memory, pool, transport)
    }

    fn post_reply(ring: &[AtomicU32], slot: usize, tag: Tag) {
        ring[slot].store(ReplyEntry::new(tag, false, true).raw(), Ordering::Release);
    }

    #[test]
    fn simple_submit_writes_bare_address() {
        let (regs, memory, pool, transport) = setup(1);
        let block = pool.allocate().unwrap();
        let mut frame = RequestFrame::default();
        frame.tag = block.tag().encode();
        transport.submit(block, &frame);

        assert_eq!(*regs.submitted.lock(), vec![block.bus_address()]);
        assert_eq!(transport.outstanding(), 1);
        assert_eq!(memory.read_frame(0).unwrap().tag, frame.tag);
    }

    #[test]
    fn performant_submit_carries_bucket_hint() {
        let (regs, _memory, pool, transport) = setup(1);
        transport.configure(
            TransportMode::Performant,
            1,
            BucketTable::build(&[5, 6, 8], 32).unwrap(),
        );
        let block = pool.allocate().unwrap();
        let mut frame = RequestFrame::default();
        frame.sg_count = 3;
        transport.submit(block, &frame);

        let word = regs.submitted.lock()[0];
        assert_eq!(word & PERFORMANT_SUBMIT, PERFORMANT_SUBMIT);
        assert_eq!(parse_submit_word(word), (block.bus_address(), Some(2)));
    }

    #[test]
    fn simple_completion_reads_reply_port() {
        let (regs, _memory, _pool, transport) = setup(1);
        let tag = Tag::direct(3, 1);
        regs.replies.lock().push(tag.encode());
        assert_eq!(transport.next_completion(0).unwrap().tag(), tag);
        assert!(transport.next_completion(0).is_none());
    }

    #[test]
    fn performant_queues_drain_independently() {
        let (_regs, memory, _pool, transport) = setup(2);
        transport.configure(
            TransportMode::Performant,
            2,
            BucketTable::build(&[], 32).unwrap(),
        );
        post_reply(memory.ring(1), 0, Tag::direct(5, 0));
        assert!(transport.next_completion(0).is_none());
        assert_eq!(transport.next_completion(1).unwrap().tag(), Tag::direct(5, 0));
        assert!(transport.next_completion(1).is_none());
    }

    #[test]
    fn reset_rings_discards_entries() {
        let (_regs, memory, _pool, transport) = setup(1);
        transport.configure(
            TransportMode::Performant,
            1,
            BucketTable::build(&[], 32).unwrap(),
        );
        post_reply(memory.ring(0), 0, Tag::direct(1, 0));
        transport.reset_rings();
        assert!(transport.next_completion(0).is_none());
    }

    #[test]
    fn retire_saturates() {
        let (_regs, _memory, _pool, transport) = setup(1);
        transport.retire();
        assert_eq!(transport.outstanding(), 0);
    }
}
