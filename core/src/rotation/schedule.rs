//! Key schedule
//!
//! Tracks the current temporary key and the interval being advertised, and
//! decides on each clock tick whether the advertisement must be restarted and
//! whether the key must be replaced first.

use super::{epoch_start, needs_new_key, Interval};
use crate::crypto::TemporaryKey;
use rand::{CryptoRng, RngCore};

/// What a tick asks the caller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Same interval as before; nothing to do
    Unchanged,
    /// The interval moved forward; advertising must be restarted
    NewInterval {
        interval: Interval,
        /// A fresh key was generated for the new rolling period
        key_rotated: bool,
    },
}

/// The device's current key and advertised interval
#[derive(Debug)]
pub struct KeySchedule {
    key: TemporaryKey,
    interval: Interval,
}

impl KeySchedule {
    /// Start a schedule with a freshly generated key
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, interval: Interval) -> Self {
        Self {
            key: TemporaryKey::generate(rng, interval),
            interval,
        }
    }

    /// Resume a schedule with an existing key. If the key belongs to another
    /// rolling period the next tick replaces it.
    pub fn with_key(key: TemporaryKey, interval: Interval) -> Self {
        Self { key, interval }
    }

    pub fn key(&self) -> &TemporaryKey {
        &self.key
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Whether the held key is valid for the held interval
    pub fn key_is_current(&self) -> bool {
        !needs_new_key(self.key.rolling_start(), self.interval)
    }

    /// Re-evaluate the schedule against the interval observed now
    pub fn tick<R: RngCore + CryptoRng>(&mut self, rng: &mut R, now: Interval) -> TickOutcome {
        if now == self.interval && self.key_is_current() {
            return TickOutcome::Unchanged;
        }
        if now < self.interval {
            tracing::warn!(
                current = %self.interval,
                observed = %now,
                "Clock moved backwards; keeping current interval"
            );
            return TickOutcome::Unchanged;
        }

        self.interval = now;
        let key_rotated = needs_new_key(self.key.rolling_start(), now);
        if key_rotated {
            self.key = TemporaryKey::generate(rng, now);
            tracing::info!(
                rolling_start = %epoch_start(now),
                "Rolled over temporary key"
            );
        }
        TickOutcome::NewInterval {
            interval: now,
            key_rotated,
        }
    }
}
