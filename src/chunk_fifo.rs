//! Bounded ring of fixed-size chunks with zero-copy open/close handoff
//! (`spec.md` §4.3), grounded in `chunk_fifo_lib.h`/`.c`.
//!
//! Unlike a normal queue's `push`/`pop`, a chunk FIFO hands the caller a
//! direct reference into the slot to be written or read — "open" it,
//! mutate or inspect in place, then "close" to commit. That lets an ISR
//! producer fill a chunk sample-by-sample without ever copying the whole
//! struct, and lets the consumer decode in place too.
//!
//! Capacity `CAP` is stored using `CAP + 1` slots (`SLOTS`) so a full ring
//! and an empty ring have distinguishable index states — the caller
//! supplies `SLOTS` explicitly (`SLOTS == CAP + 1`) because const-generic
//! arithmetic on array lengths isn't available on stable; [`ChunkFifo::new`]
//! asserts the relationship at construction.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Single-producer/single-consumer ring of `SLOTS - 1` chunks of `T`.
///
/// Safety argument: the producer only ever dereferences the slot at
/// `write_pos`, the consumer only ever dereferences the slot at
/// `read_pos`. `write_close`/`read_close` are the only places the indices
/// move, and they move by exactly one slot, so the two cursors can be
/// equal (empty, or "full and still pointing at the unclosed pending
/// write") but a live producer reference and a live consumer reference
/// never alias the same slot: `read_open` refuses to hand out a reference
/// when `read_pos == write_pos` (nothing closed yet to read).
pub struct ChunkFifo<T, const SLOTS: usize> {
    buf: UnsafeCell<[T; SLOTS]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// Safety: access is disciplined by read_pos/write_pos as described above;
// T itself need not be Sync since we never hand out overlapping references.
unsafe impl<T, const SLOTS: usize> Sync for ChunkFifo<T, SLOTS> {}

impl<T: Default, const SLOTS: usize> ChunkFifo<T, SLOTS> {
    pub fn new() -> Self {
        assert!(SLOTS >= 2, "chunk fifo needs at least 2 slots (capacity 1)");
        Self {
            buf: UnsafeCell::new(core::array::from_fn(|_| T::default())),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }
}

impl<T, const SLOTS: usize> ChunkFifo<T, SLOTS> {
    pub fn capacity(&self) -> usize {
        SLOTS - 1
    }

    fn advance(pos: usize) -> usize {
        (pos + 1) % SLOTS
    }

    /// Opens the write slot. Always succeeds — if the ring is full this
    /// returns the same not-yet-closed slot as the last call, so a
    /// producer that keeps writing without the consumer catching up just
    /// keeps overwriting its own pending chunk (`spec.md` §4.3: "nothing
    /// is lost that had been closed").
    #[allow(clippy::mut_from_ref)]
    pub fn write_open(&self) -> &mut T {
        let pos = self.write_pos.load(Ordering::Acquire);
        // Safety: see struct-level argument; `pos` is the producer's own
        // slot and no consumer reference can alias it.
        unsafe { &mut (*self.buf.get())[pos] }
    }

    /// Commits the open write slot, advancing the write cursor unless doing
    /// so would collide with the read cursor (silent drop-of-newest).
    pub fn write_close(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        let next = Self::advance(write);
        if next != read {
            self.write_pos.store(next, Ordering::Release);
        }
    }

    /// Opens the oldest unread, closed chunk. `Err(Error::InvalidState)` if
    /// the ring is empty (nothing closed since the last read).
    pub fn read_open(&self) -> Result<&T> {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        if read == write {
            return Err(Error::InvalidState);
        }
        // Safety: `read` is only ever touched by the consumer, and is
        // distinct from `write` (the producer's slot) by the check above.
        Ok(unsafe { &(*self.buf.get())[read] })
    }

    /// Commits the open read slot, advancing the read cursor. No-op if
    /// nothing was open (`read == write`).
    pub fn read_close(&self) {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        if read != write {
            self.read_pos.store(Self::advance(read), Ordering::Release);
        }
    }

    /// Number of closed-but-unread chunks.
    pub fn size(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        (write + SLOTS - read) % SLOTS
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Sample {
        tag: u32,
    }

    #[test]
    fn basic_write_read_round_trip() {
        let fifo: ChunkFifo<Sample, 3> = ChunkFifo::new();
        assert_eq!(fifo.capacity(), 2);
        assert!(fifo.is_empty());

        fifo.write_open().tag = 1;
        fifo.write_close();
        fifo.write_open().tag = 2;
        fifo.write_close();
        assert_eq!(fifo.size(), 2);

        assert_eq!(fifo.read_open().unwrap().tag, 1);
        fifo.read_close();
        assert_eq!(fifo.read_open().unwrap().tag, 2);
        fifo.read_close();
        assert!(fifo.read_open().is_err());
    }

    #[test]
    fn unclosed_write_is_not_visible_to_reader() {
        let fifo: ChunkFifo<Sample, 3> = ChunkFifo::new();
        fifo.write_open().tag = 99;
        // Never closed.
        assert!(fifo.read_open().is_err());
    }

    #[test]
    fn overflow_drops_newest_keeps_prior_closed_chunks() {
        // capacity 2 (SLOTS=3): a producer that never gets consumed fills
        // the ring with its first two successfully-closed chunks and then
        // every further write_close is a silent no-op (the ring stays
        // full), so later mutations to the still-open pending slot are
        // simply overwritten and lost — never observed as separate chunks.
        let fifo: ChunkFifo<Sample, 3> = ChunkFifo::new();
        for i in 0..200u32 {
            let slot = fifo.write_open();
            slot.tag = i;
            fifo.write_close();
        }
        assert_eq!(fifo.size(), 2);
        let first = fifo.read_open().unwrap().tag;
        fifo.read_close();
        let second = fifo.read_open().unwrap().tag;
        fifo.read_close();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert!(fifo.read_open().is_err());
    }

    #[test]
    fn write_open_repoints_to_same_pending_slot_when_full() {
        let fifo: ChunkFifo<Sample, 2> = ChunkFifo::new();
        assert_eq!(fifo.capacity(), 1);
        fifo.write_open().tag = 1;
        fifo.write_close();
        // Ring full (capacity 1): the write slot is the *other* of the two
        // underlying slots, distinct from the one already closed and
        // waiting to be read. Repeated opens without a close overwrite
        // that pending slot, but write_close is a no-op while full, so it
        // never becomes visible — the reader still observes the first
        // closed chunk (tag 1), and the overwritten pending one (tag 3) is
        // simply dropped.
        fifo.write_open().tag = 2;
        fifo.write_open().tag = 3;
        fifo.write_close();
        assert_eq!(fifo.size(), 1);
        assert_eq!(fifo.read_open().unwrap().tag, 1);
    }
}
