//! L2 BLE byte transport (`spec.md` §4.9), grounded in `sender_lib.c`.
//!
//! Wraps the notify characteristic with two byte FIFOs: an outbound queue
//! drained in `LINK_MTU_BYTES`-sized frames, and an inbound queue fed by
//! the radio's notify-received callback. `pump` is meant to be called once
//! per main-loop iteration; it is a no-op (not an error) when nothing is
//! queued or the notify path reports `Busy`, matching the original's
//! "try again next tick" behavior rather than blocking.

use crate::config::{LINK_MTU_BYTES, SENDER_RX_RING_BYTES, SENDER_TX_RING_BYTES};
use crate::error::{Error, Result};
use crate::hal::BleNotifier;
use crate::ring::ByteRing;

pub struct Sender<N: BleNotifier> {
    notifier: N,
    tx: ByteRing<SENDER_TX_RING_BYTES>,
    rx: ByteRing<SENDER_RX_RING_BYTES>,
}

impl<N: BleNotifier> Sender<N> {
    pub fn new(notifier: N) -> Self {
        Self {
            notifier,
            tx: ByteRing::new(),
            rx: ByteRing::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.notifier.is_connected()
    }

    /// Queues bytes for transmission (`spec.md` §4.9's `transmit`).
    /// `Err(Error::NoMemory)` if the TX ring can't hold them all — the
    /// caller (`request::RequestEngine`) treats this as a hard failure for
    /// the in-flight response.
    pub fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx.push_slice(bytes)
    }

    /// Feeds bytes received over the notify-write path into the RX queue
    /// (called from the BLE stack's receive callback).
    pub fn on_received(&mut self, bytes: &[u8]) -> Result<()> {
        self.rx.push_slice(bytes)
    }

    /// Pops up to `out.len()` received bytes (`spec.md` §4.9's
    /// `await_data`, minus the timeout itself — that's the request
    /// engine's job via `timeout::TimeoutRegistry`).
    pub fn read_received(&mut self, out: &mut [u8]) -> usize {
        self.rx.pop_into(out)
    }

    pub fn received_len(&self) -> usize {
        self.rx.len()
    }

    /// Copies up to `out.len()` queued received bytes without consuming
    /// them (`request::FrameAssembler`'s length-prefix peek).
    pub fn peek_received(&self, out: &mut [u8]) -> usize {
        self.rx.peek_into(out)
    }

    /// Discards `n` received bytes already accounted for elsewhere
    /// (`request::FrameAssembler`'s bogus-length recovery path).
    pub fn discard_received(&self, n: usize) {
        self.rx.discard(n)
    }

    pub fn pending_transmit_len(&self) -> usize {
        self.tx.len()
    }

    /// Drains one MTU-sized frame off the TX queue and ships it. Returns
    /// `Ok(true)` if a frame went out, `Ok(false)` if there was nothing to
    /// send or the stack reported `Busy` (retry next tick).
    pub fn pump(&mut self) -> Result<bool> {
        if self.tx.is_empty() {
            return Ok(false);
        }
        let mut frame = [0u8; LINK_MTU_BYTES];
        let n = self.tx.peek_into(&mut frame);
        match self.notifier.notify(&frame[..n]) {
            Ok(()) => {
                self.tx.discard(n);
                Ok(true)
            }
            Err(Error::Busy) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Disconnect handling (`spec.md` §5): both FIFOs are flushed so a
    /// stale partial frame never bleeds into the next connection.
    pub fn on_disconnected(&mut self) {
        self.tx.clear();
        self.rx.clear();
    }

    #[cfg(test)]
    pub(crate) fn notifier(&self) -> &N {
        &self.notifier
    }

    #[cfg(test)]
    pub(crate) fn notifier_mut(&mut self) -> &mut N {
        &mut self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::vec::Vec;

    struct FakeNotifier {
        connected: bool,
        busy_until_call: usize,
        calls: usize,
        sent: RefCell<Vec<Vec<u8>>>,
    }

    impl BleNotifier for FakeNotifier {
        fn notify(&mut self, frame: &[u8]) -> Result<()> {
            self.calls += 1;
            if self.calls <= self.busy_until_call {
                return Err(Error::Busy);
            }
            self.sent.borrow_mut().push(frame.to_vec());
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[test]
    fn pump_sends_one_mtu_frame_at_a_time() {
        let notifier = FakeNotifier {
            connected: true,
            busy_until_call: 0,
            calls: 0,
            sent: RefCell::new(Vec::new()),
        };
        let mut sender = Sender::new(notifier);
        let payload: [u8; 45] = core::array::from_fn(|i| i as u8);
        sender.transmit(&payload).unwrap();
        assert!(sender.pump().unwrap());
        assert!(sender.pump().unwrap());
        assert!(sender.pump().unwrap());
        assert!(!sender.pump().unwrap());
        assert_eq!(sender.pending_transmit_len(), 0);
        assert_eq!(sender.notifier.sent.borrow().len(), 3);
        assert_eq!(sender.notifier.sent.borrow()[0].len(), LINK_MTU_BYTES);
        assert_eq!(sender.notifier.sent.borrow()[2].len(), 5);
    }

    #[test]
    fn pump_retries_on_busy_without_losing_bytes() {
        let notifier = FakeNotifier {
            connected: true,
            busy_until_call: 1,
            calls: 0,
            sent: RefCell::new(Vec::new()),
        };
        let mut sender = Sender::new(notifier);
        sender.transmit(&[1, 2, 3]).unwrap();
        assert!(!sender.pump().unwrap());
        assert_eq!(sender.pending_transmit_len(), 3);
        assert!(sender.pump().unwrap());
        assert_eq!(sender.pending_transmit_len(), 0);
    }

    #[test]
    fn disconnect_flushes_both_fifos() {
        let notifier = FakeNotifier {
            connected: true,
            busy_until_call: 0,
            calls: 0,
            sent: RefCell::new(Vec::new()),
        };
        let mut sender = Sender::new(notifier);
        sender.transmit(&[1, 2, 3]).unwrap();
        sender.on_received(&[4, 5]).unwrap();
        sender.on_disconnected();
        assert_eq!(sender.pending_transmit_len(), 0);
        assert_eq!(sender.received_len(), 0);
    }
}
