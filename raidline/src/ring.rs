//! Consumer side of a toggle-bit reply ring.

use std::sync::atomic::{AtomicU32, Ordering};

use protocol_ciss::ReplyEntry;

/// Read cursor for one reply queue.
///
/// A slot is valid when its toggle bit equals the expected toggle. Ring
/// memory starts zeroed and the first pass expects toggle `1`; the expected
/// value flips once each time the cursor wraps.
#[derive(Debug)]
pub struct ReplyCursor {
    head: usize,
    toggle: bool,
}

impl Default for ReplyCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyCursor {
    pub fn new() -> Self {
        ReplyCursor {
            head: 0,
            toggle: true,
        }
    }

    /// Back to slot 0, expecting toggle `1`. Ring memory must be zeroed at
    /// the same time.
    pub fn reset(&mut self) {
        self.head = 0;
        self.toggle = true;
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn expected_toggle(&self) -> bool {
        self.toggle
    }

    /// Take the next valid entry, if any.
    #[inline]
    pub fn pop(&mut self, ring: &[AtomicU32]) -> Option<ReplyEntry> {
        if ring.is_empty() {
            return None;
        }
        let entry = ReplyEntry(ring[self.head].load(Ordering::Acquire));
        if entry.toggle() != self.toggle {
            return None;
        }
        self.head += 1;
        if self.head == ring.len() {
            self.head = 0;
            self.toggle = !self.toggle;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_ciss::Tag;

    fn ring(len: usize) -> Vec<AtomicU32> {
        (0..len).map(|_| AtomicU32::new(0)).collect()
    }

    /// Minimal producer matching the adapter's side of the protocol.
    struct Producer {
        head: usize,
        toggle: bool,
    }

    impl Producer {
        fn post(&mut self, ring: &[AtomicU32], tag: Tag) {
            let entry = ReplyEntry::new(tag, false, self.toggle);
            ring[self.head].store(entry.raw(), Ordering::Release);
            self.head += 1;
            if self.head == ring.len() {
                self.head = 0;
                self.toggle = !self.toggle;
            }
        }
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let slots = ring(4);
        let mut cursor = ReplyCursor::new();
        assert!(cursor.pop(&slots).is_none());
        assert_eq!(cursor.head(), 0);
    }

    #[test]
    fn toggle_flips_once_per_wrap() {
        let slots = ring(4);
        let mut producer = Producer {
            head: 0,
            toggle: true,
        };
        let mut cursor = ReplyCursor::new();

        for round in 0..3u16 {
            for i in 0..4u16 {
                producer.post(&slots, Tag::direct(i, round));
            }
            for i in 0..4u16 {
                let entry = cursor.pop(&slots).unwrap();
                assert_eq!(entry.tag(), Tag::direct(i, round));
            }
            // Every slot now holds an entry from this pass, which must not
            // be read again.
            assert!(cursor.pop(&slots).is_none());
            assert_eq!(cursor.expected_toggle(), round % 2 == 1);
        }
    }

    #[test]
    fn partial_pass_stops_at_stale_slot() {
        let slots = ring(4);
        let mut producer = Producer {
            head: 0,
            toggle: true,
        };
        let mut cursor = ReplyCursor::new();
        for i in 0..4u16 {
            producer.post(&slots, Tag::direct(i, 0));
        }
        for _ in 0..4 {
            cursor.pop(&slots).unwrap();
        }
        producer.post(&slots, Tag::direct(9, 1));
        assert_eq!(cursor.pop(&slots).unwrap().tag(), Tag::direct(9, 1));
        // Slot 1 still carries the first pass's toggle.
        assert!(cursor.pop(&slots).is_none());
        assert_eq!(cursor.head(), 1);
    }

    #[test]
    fn reset_restarts_at_slot_zero() {
        let slots = ring(2);
        let mut cursor = ReplyCursor::new();
        slots[0].store(ReplyEntry::new(Tag::direct(0, 0), false, true).raw(), Ordering::Release);
        cursor.pop(&slots).unwrap();
        cursor.reset();
        for slot in &slots {
            slot.store(0, Ordering::Relaxed);
        }
        assert_eq!(cursor.head(), 0);
        assert!(cursor.expected_toggle());
        assert!(cursor.pop(&slots).is_none());
    }
}
