//! Entries carry `last_used` and `last_modified` timestamps, and
//! range dooms compare against them.  The backend reads time through
//! a [`Clock`] passed in its configuration, so tests (and embedders
//! with their own notion of time) can control it without any global
//! override.
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

/// A source of wall-clock time.
pub trait Clock: std::fmt::Debug + Send + Sync {
    /// Returns the current time.
    fn now(&self) -> SystemTime;
}

/// The system's real-time clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.  It may be moved backwards.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// Returns a clock stopped at `start`.
    pub fn new(start: SystemTime) -> ManualClock {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Moves the clock to `when`, possibly backwards.
    pub fn set(&self, when: SystemTime) {
        *self.now.lock() = when;
    }
}

impl Default for ManualClock {
    /// Starts at a round time well after the epoch, so that file
    /// times round-trip through any filesystem.
    fn default() -> ManualClock {
        ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_600_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Converts `time` to signed microseconds since the epoch, for
/// on-disk records.
pub(crate) fn to_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_micros()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_micros())
            .map(|micros| -micros)
            .unwrap_or(i64::MIN),
    }
}

/// Inverse of [`to_micros`].
pub(crate) fn from_micros(micros: i64) -> SystemTime {
    if micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(micros as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros(micros.unsigned_abs())
    }
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::default();
    let start = clock.now();

    clock.advance(Duration::from_millis(20));
    assert_eq!(clock.now(), start + Duration::from_millis(20));

    // Backwards is allowed.
    clock.set(start - Duration::from_secs(3600));
    assert!(clock.now() < start);
}

#[test]
fn test_micros_round_trip() {
    let clock = ManualClock::default();
    let now = clock.now() + Duration::from_micros(1234);

    assert_eq!(from_micros(to_micros(now)), now);
    assert_eq!(from_micros(0), UNIX_EPOCH);

    let before_epoch = UNIX_EPOCH - Duration::from_secs(10);
    assert_eq!(to_micros(before_epoch), -10_000_000);
    assert_eq!(from_micros(to_micros(before_epoch)), before_epoch);
}
