//! Generic bounded SPSC ring buffers (`spec.md` §4.3's byte-FIFO line item,
//! and the request engine's notification queue, §4.8).
//!
//! Unlike [`chunk_fifo`](crate::chunk_fifo), which hands out in-place
//! pointers for zero-copy sensor handoff, these rings move small `Copy`
//! values (bytes, or notification/stream records) by value. Index updates
//! are wrapped in [`critical_section::Mutex`] guards — the same "typed
//! enter-critical-section cell" `spec.md` §9 asks for in place of the
//! original's raw `volatile` globals, and the idiom `critical-section`
//! itself (already a teacher dependency) exists to provide.

use critical_section::Mutex;
use core::cell::RefCell;
use heapless::Deque;

use crate::error::{Error, Result};

/// A bounded SPSC queue of `T`, safe to push from ISR context and pop from
/// main context (or vice versa) without an explicit lock at call sites.
pub struct Ring<T, const N: usize> {
    inner: Mutex<RefCell<Deque<T, N>>>,
}

impl<T, const N: usize> Ring<T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Pushes a value. Fails with [`Error::NoMemory`] if the ring is full —
    /// callers decide whether that's a silent drop (sampling) or a
    /// retry/disconnect (transport), per `spec.md` §7.
    pub fn push(&self, value: T) -> Result<()> {
        critical_section::with(|cs| {
            self.inner
                .borrow(cs)
                .borrow_mut()
                .push_back(value)
                .map_err(|_| Error::NoMemory)
        })
    }

    pub fn pop(&self) -> Option<T> {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().pop_front())
    }

    /// Pushes a value back onto the front of the queue — used to requeue
    /// a partially-consumed record (`request::FrameAssembler`'s
    /// notification-byte accounting) rather than losing its place in
    /// line.
    pub fn push_front(&self, value: T) -> Result<()> {
        critical_section::with(|cs| {
            self.inner
                .borrow(cs)
                .borrow_mut()
                .push_front(value)
                .map_err(|_| Error::NoMemory)
        })
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().is_full())
    }

    pub fn clear(&self) {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().clear())
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded byte ring used for the BLE TX/RX byte streams
/// (`sender::Sender`). Bytes are pushed/popped individually but drained in
/// bulk via [`ByteRing::pop_into`].
pub struct ByteRing<const N: usize> {
    inner: Ring<u8, N>,
}

impl<const N: usize> ByteRing<N> {
    pub const fn new() -> Self {
        Self { inner: Ring::new() }
    }

    pub fn push_slice(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > N - self.inner.len() {
            return Err(Error::NoMemory);
        }
        for &b in bytes {
            // Capacity was checked above under the same lock-free snapshot;
            // single producer means this cannot race itself.
            self.inner.push(b)?;
        }
        Ok(())
    }

    pub fn pop(&self) -> Option<u8> {
        self.inner.pop()
    }

    /// Pops up to `dest.len()` bytes, returning the count actually popped.
    pub fn pop_into(&self, dest: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dest.len() {
            match self.inner.pop() {
                Some(b) => {
                    dest[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity_remaining(&self) -> usize {
        N - self.inner.len()
    }

    pub fn clear(&self) {
        self.inner.clear()
    }

    /// Copies up to `dest.len()` queued bytes without consuming them. Lets
    /// a caller retry a failed send (`sender::Sender::pump`'s `Busy` path)
    /// without needing to push unsent bytes back onto the front of a
    /// FIFO-only queue.
    pub fn peek_into(&self, dest: &mut [u8]) -> usize {
        critical_section::with(|cs| {
            let deque = self.inner.inner.borrow(cs).borrow();
            let mut n = 0;
            for b in deque.iter().take(dest.len()) {
                dest[n] = *b;
                n += 1;
            }
            n
        })
    }

    /// Pops and discards up to `n` bytes (the counterpart to
    /// [`Self::peek_into`] once a peeked send has actually landed).
    pub fn discard(&self, n: usize) {
        for _ in 0..n {
            if self.inner.pop().is_none() {
                break;
            }
        }
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let ring: Ring<u32, 4> = Ring::new();
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        ring.push(3).unwrap();
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        ring.push(4).unwrap();
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn full_ring_rejects_push() {
        let ring: Ring<u8, 2> = Ring::new();
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        assert_eq!(ring.push(3), Err(Error::NoMemory));
    }

    #[test]
    fn byte_ring_push_slice_and_drain() {
        let ring: ByteRing<8> = ByteRing::new();
        ring.push_slice(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 2];
        assert_eq!(ring.pop_into(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn byte_ring_rejects_slice_over_capacity() {
        let ring: ByteRing<4> = ByteRing::new();
        assert_eq!(ring.push_slice(&[1, 2, 3, 4, 5]), Err(Error::NoMemory));
        assert!(ring.is_empty());
    }

    #[test]
    fn byte_ring_peek_then_discard_round_trip() {
        let ring: ByteRing<8> = ByteRing::new();
        ring.push_slice(&[1, 2, 3]).unwrap();
        let mut peeked = [0u8; 2];
        assert_eq!(ring.peek_into(&mut peeked), 2);
        assert_eq!(peeked, [1, 2]);
        // Peeking doesn't consume.
        assert_eq!(ring.len(), 3);
        ring.discard(2);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop(), Some(3));
    }
}
