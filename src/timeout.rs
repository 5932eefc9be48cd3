//! L0 timeout registry: N logical timeouts multiplexed over one hardware
//! alarm (`spec.md` §4.2), grounded in `timeout_lib.c`/`.h`.
//!
//! Every registered timeout tracks its own remaining-ms and original
//! duration. [`TimeoutRegistry::tick`] is the one entry point driven by the
//! alarm callback: it decrements every *active* timeout by the elapsed
//! continuous-ms, fires (and clears) any that reached zero, and reports the
//! new minimum so the caller can re-arm the alarm.

use heapless::Vec;

use crate::config::{MAX_ALARM_MS, MAX_TIMEOUTS};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    duration_ms: u32,
    remaining_ms: u32,
    active: bool,
}

/// An opaque handle returned by [`TimeoutRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutId(usize);

/// N (`<= MAX_TIMEOUTS`) independent timeouts driven by one alarm.
///
/// `tick()` is meant to be called from the alarm callback with the elapsed
/// continuous-ms since the last call; it returns the set of ids that fired
/// this tick (a caller-sized buffer, bounded by `MAX_TIMEOUTS`) and the
/// next alarm period to arm. A handler invoked because its id fired must
/// not mutate its own entry except via `start`/`stop`/`reset` (`spec.md`
/// §4.2's "Failure" note) — this module can't enforce that at the type
/// level since handlers live outside it, so callers are responsible.
pub struct TimeoutRegistry {
    entries: Vec<Entry, MAX_TIMEOUTS>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(&mut self) -> Result<TimeoutId> {
        let id = self.entries.len();
        self.entries
            .push(Entry {
                duration_ms: 0,
                remaining_ms: 0,
                active: false,
            })
            .map_err(|_| Error::NoMemory)?;
        Ok(TimeoutId(id))
    }

    fn entry_mut(&mut self, id: TimeoutId) -> Result<&mut Entry> {
        self.entries.get_mut(id.0).ok_or(Error::InvalidParameter)
    }

    /// Starts (or re-starts) a timeout for `duration_ms`. `duration_ms ==
    /// 0` means "no timeout" — the entry is left inactive, matching
    /// `timeout_lib.c`'s "Could also be 0, then no timeout will be
    /// started."
    pub fn start(&mut self, id: TimeoutId, duration_ms: u32) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if duration_ms == 0 {
            entry.active = false;
            entry.duration_ms = 0;
            return Ok(());
        }
        entry.duration_ms = duration_ms;
        entry.remaining_ms = duration_ms;
        entry.active = true;
        Ok(())
    }

    pub fn stop(&mut self, id: TimeoutId) -> Result<()> {
        self.entry_mut(id)?.active = false;
        Ok(())
    }

    /// Reloads the original duration without changing it (`timeout_reset`).
    /// A no-op on an inactive or zero-duration timeout.
    pub fn reset(&mut self, id: TimeoutId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.active && entry.duration_ms > 0 {
            entry.remaining_ms = entry.duration_ms;
        }
        Ok(())
    }

    /// Resets every active timeout — used by the request engine, where
    /// receiving any request implies continued hub liveness (`spec.md`
    /// §4.6/§4.8).
    pub fn reset_all(&mut self) {
        for entry in self.entries.iter_mut() {
            if entry.active && entry.duration_ms > 0 {
                entry.remaining_ms = entry.duration_ms;
            }
        }
    }

    /// Advances every active timeout by `elapsed_ms`, deactivating (and
    /// reporting) any that reached zero. Returns the ids that fired, in
    /// registration order.
    pub fn tick(&mut self, elapsed_ms: u32) -> Vec<TimeoutId, MAX_TIMEOUTS> {
        let mut fired = Vec::new();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if !entry.active {
                continue;
            }
            entry.remaining_ms = entry.remaining_ms.saturating_sub(elapsed_ms);
            if entry.remaining_ms == 0 {
                entry.active = false;
                // Registry capacity bounds `fired`'s capacity identically.
                let _ = fired.push(TimeoutId(i));
            }
        }
        fired
    }

    /// The next alarm period to arm: the minimum remaining-ms across all
    /// active timeouts, capped at `MAX_ALARM_MS`. `None` if nothing is
    /// active (caller should leave the alarm disarmed).
    pub fn next_alarm_ms(&self) -> Option<u32> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .map(|e| e.remaining_ms.min(MAX_ALARM_MS))
            .min()
    }

    pub fn is_active(&self, id: TimeoutId) -> bool {
        self.entries.get(id.0).map(|e| e.active).unwrap_or(false)
    }
}

impl Default for TimeoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_exactly_once_when_elapsed_reaches_duration() {
        let mut reg = TimeoutRegistry::new();
        let id = reg.register().unwrap();
        reg.start(id, 100).unwrap();
        assert!(reg.tick(50).is_empty());
        assert!(reg.is_active(id));
        let fired = reg.tick(50);
        assert_eq!(fired.as_slice(), &[id]);
        assert!(!reg.is_active(id));
        // Idempotent: stopping an already-fired (inactive) timeout is fine.
        reg.stop(id).unwrap();
    }

    #[test]
    fn reset_reloads_original_duration() {
        let mut reg = TimeoutRegistry::new();
        let id = reg.register().unwrap();
        reg.start(id, 100).unwrap();
        reg.tick(90);
        reg.reset(id).unwrap();
        // Should need another ~100ms, not just 10ms, to fire.
        assert!(reg.tick(90).is_empty());
        assert_eq!(reg.tick(10).as_slice(), &[id]);
    }

    #[test]
    fn next_alarm_is_minimum_of_active_remaining() {
        let mut reg = TimeoutRegistry::new();
        let a = reg.register().unwrap();
        let b = reg.register().unwrap();
        reg.start(a, 500).unwrap();
        reg.start(b, 200).unwrap();
        assert_eq!(reg.next_alarm_ms(), Some(200));
        reg.tick(200);
        assert_eq!(reg.next_alarm_ms(), Some(300));
    }

    #[test]
    fn zero_duration_start_means_inactive() {
        let mut reg = TimeoutRegistry::new();
        let id = reg.register().unwrap();
        reg.start(id, 0).unwrap();
        assert!(!reg.is_active(id));
        assert_eq!(reg.next_alarm_ms(), None);
    }

    #[test]
    fn reset_all_reloads_every_active_timeout() {
        let mut reg = TimeoutRegistry::new();
        let a = reg.register().unwrap();
        let b = reg.register().unwrap();
        reg.start(a, 100).unwrap();
        reg.start(b, 100).unwrap();
        reg.tick(90);
        reg.reset_all();
        assert!(reg.tick(90).is_empty());
    }

    #[test]
    fn register_beyond_capacity_fails() {
        let mut reg = TimeoutRegistry::new();
        for _ in 0..MAX_TIMEOUTS {
            reg.register().unwrap();
        }
        assert_eq!(reg.register().err(), Some(Error::NoMemory));
    }
}
