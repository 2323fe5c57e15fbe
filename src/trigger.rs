//! The write-back trigger decides when a backend should persist its
//! index snapshot.  It fires about once every `period` mutations, at a
//! random point: a process that always exits after the same number of
//! mutations must still get a snapshot written eventually.
//!
//! Each backend owns its trigger (there is no thread-local or global
//! counter), so independent caches never influence each other.
//!
//! The countdown is uniform over `[1, u64::MAX]` and every mutation
//! consumes `ceil(u64::MAX / period)` of it, so the trigger fires at
//! least once every `period` mutations, and the first firing is
//! uniformly spread over that window.
use rand::Rng;

#[derive(Debug)]
pub(crate) struct WritebackTrigger {
    // Countdown consumed by each mutation; `step * period >= u64::MAX`.
    step: u64,
    // Never zero.
    countdown: u64,
}

fn fresh_countdown() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

impl WritebackTrigger {
    /// Returns a trigger for snapshots every `period` mutations.  A
    /// period of 0 or 1 fires on every mutation.
    pub fn new(period: u64) -> WritebackTrigger {
        let period = period.max(1);
        let step = u64::MAX / period + (u64::MAX % period != 0) as u64;

        WritebackTrigger {
            step,
            countdown: fresh_countdown(),
        }
    }

    /// Records one index mutation.  Returns true when the snapshot
    /// should be written now.
    pub fn event(&mut self) -> bool {
        match self.countdown.checked_sub(self.step) {
            Some(rest) if rest > 0 => {
                self.countdown = rest;
                false
            }
            _ => {
                self.countdown = fresh_countdown();
                true
            }
        }
    }
}
