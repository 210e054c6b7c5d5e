// Replay and ordering defence for decrypted frames.
//
// Runs only after the AEAD tag verified. The timestamp is checked first, then
// the per-direction sequence. A frame is accepted iff
//   |now - ts| <= tolerance  and  seq > last_accepted[dir]
// Gaps are fine; equal or lower sequences are replays.

use crate::envelope::Direction;
use crate::error::{GateTrustError, Result};

/// Default clock-skew tolerance: five minutes either side.
pub const DEFAULT_TOLERANCE_MS: u64 = 300_000;

/// Per-direction sequence counters for one session.
///
/// For a given role one slot counts inbound frames (last accepted) and the
/// other counts outbound frames (last sent). Both start at 0, so the first
/// frame in each direction carries `seq = 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceWindow {
    c2s: u64,
    s2c: u64,
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a window from previously recorded counters.
    pub fn from_last(c2s: u64, s2c: u64) -> Self {
        Self { c2s, s2c }
    }

    /// Last sequence recorded for `direction`.
    pub fn last(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ClientToServer => self.c2s,
            Direction::ServerToClient => self.s2c,
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut u64 {
        match direction {
            Direction::ClientToServer => &mut self.c2s,
            Direction::ServerToClient => &mut self.s2c,
        }
    }

    /// Allocate the next outbound sequence for `direction`.
    pub fn next_outbound(&mut self, direction: Direction) -> u64 {
        let slot = self.slot_mut(direction);
        *slot = slot.saturating_add(1);
        *slot
    }
}

/// Timestamp-window and sequence validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayGuard {
    tolerance_ms: u64,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_MS)
    }
}

impl ReplayGuard {
    pub fn new(tolerance_ms: u64) -> Self {
        Self { tolerance_ms }
    }

    pub fn tolerance_ms(&self) -> u64 {
        self.tolerance_ms
    }

    /// Validate one inbound frame and, on success, advance the window.
    ///
    /// Nothing is mutated on rejection.
    pub fn validate(
        &self,
        direction: Direction,
        timestamp: u64,
        sequence: u64,
        window: &mut SequenceWindow,
        now: u64,
    ) -> Result<()> {
        if now.abs_diff(timestamp) > self.tolerance_ms {
            return Err(GateTrustError::StaleTimestamp {
                timestamp,
                now,
                tolerance_ms: self.tolerance_ms,
            });
        }

        let last = window.slot_mut(direction);
        if sequence <= *last {
            return Err(GateTrustError::ReplayDetected {
                direction,
                sequence,
                last: *last,
            });
        }
        *last = sequence;
        Ok(())
    }
}
