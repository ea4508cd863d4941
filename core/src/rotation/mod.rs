//! Protocol time
//!
//! Wall-clock time is bucketed into 10-minute intervals, and 144 intervals
//! make one rolling period (24h). A temporary key is bound to the interval
//! that starts its rolling period.
//!
//! - **clock**: injectable time source so rotation can be driven in tests
//! - **schedule**: per-tick decision of when to re-advertise and when to
//!   replace the temporary key

pub mod clock;
pub mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use schedule::{KeySchedule, TickOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of one interval in seconds
pub const INTERVAL_SECS: u64 = 600;

/// Number of intervals a temporary key is valid for
pub const ROLLING_PERIOD: u32 = 144;

/// Count of 10-minute buckets since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(u32);

impl Interval {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn from_unix_secs(secs: u64) -> Self {
        Self((secs / INTERVAL_SECS) as u32)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// The interval `n` buckets later
    pub fn offset(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Interval {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Interval containing `now`. Times before the Unix epoch map to interval 0.
pub fn current_interval(now: SystemTime) -> Interval {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Interval::from_unix_secs(secs)
}

/// First interval of the rolling period containing `interval`
pub fn epoch_start(interval: Interval) -> Interval {
    Interval((interval.0 / ROLLING_PERIOD) * ROLLING_PERIOD)
}

/// Whether a key bound to `current_key_epoch` is stale at `interval`
pub fn needs_new_key(current_key_epoch: Interval, interval: Interval) -> bool {
    epoch_start(interval) != current_key_epoch
}

/// Maps a clock onto protocol time
#[derive(Clone)]
pub struct RotationClock {
    clock: std::sync::Arc<dyn Clock>,
}

impl RotationClock {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(std::sync::Arc::new(SystemClock))
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    pub fn current_interval(&self) -> Interval {
        current_interval(self.clock.now())
    }

    pub fn current_epoch(&self) -> Interval {
        epoch_start(self.current_interval())
    }
}

impl fmt::Debug for RotationClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationClock")
            .field("interval", &self.current_interval())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_interval_known_answer() {
        let now = UNIX_EPOCH + Duration::from_secs(1585785600);
        assert_eq!(current_interval(now), Interval::new(2642976));
    }

    #[test]
    fn test_interval_floors_within_bucket() {
        let now = UNIX_EPOCH + Duration::from_secs(1585785600 + 599);
        assert_eq!(current_interval(now), Interval::new(2642976));
        let next = UNIX_EPOCH + Duration::from_secs(1585785600 + 600);
        assert_eq!(current_interval(next), Interval::new(2642977));
    }

    #[test]
    fn test_pre_epoch_time_maps_to_zero() {
        let before = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(current_interval(before), Interval::new(0));
    }

    #[test]
    fn test_epoch_start_boundaries() {
        assert_eq!(epoch_start(Interval::new(2642976)), Interval::new(2642976));
        assert_eq!(epoch_start(Interval::new(2643119)), Interval::new(2642976));
        assert_eq!(epoch_start(Interval::new(2643120)), Interval::new(2643120));
    }

    #[test]
    fn test_needs_new_key_at_boundary() {
        let epoch = Interval::new(2642976);
        assert!(!needs_new_key(epoch, Interval::new(2642976)));
        assert!(!needs_new_key(epoch, Interval::new(2643119)));
        assert!(needs_new_key(epoch, Interval::new(2643120)));
    }

    #[test]
    fn test_rotation_clock_follows_manual_clock() {
        let manual = std::sync::Arc::new(ManualClock::at_unix_secs(1585785600));
        let clock = RotationClock::new(manual.clone());
        assert_eq!(clock.current_interval(), Interval::new(2642976));

        manual.advance(Duration::from_secs(600 * 144));
        assert_eq!(clock.current_epoch(), Interval::new(2643120));
    }

    proptest! {
        #[test]
        fn prop_epoch_start_is_idempotent(i in any::<u32>()) {
            let start = epoch_start(Interval::new(i));
            prop_assert_eq!(epoch_start(start), start);
            prop_assert_eq!(start.value() % ROLLING_PERIOD, 0);
            prop_assert!(start.value() <= i);
            prop_assert!(i - start.value() < ROLLING_PERIOD);
        }

        #[test]
        fn prop_needs_new_key_only_across_boundary(epoch_index in 0u32..1_000_000, step in 0u32..1000) {
            let epoch = Interval::new(epoch_index * ROLLING_PERIOD);
            let interval = epoch.offset(step);
            prop_assert_eq!(needs_new_key(epoch, interval), step >= ROLLING_PERIOD);
        }
    }
}
