/// Working table of recently seen identifiers
///
/// Keyed by identifier bytes. A new sighting replaces the previous entry for
/// the same identifier (last write wins by observation time) and every update
/// sweeps out entries older than the retention window, so the table only
/// ever holds devices seen in the last few seconds.

use super::payload::Advertisement;
use crate::crypto::RollingProximityIdentifier;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Default retention window for scan results
pub const DEFAULT_SCAN_RETENTION: Duration = Duration::from_secs(30);

/// Something the table can age out
pub trait Observation {
    fn identifier(&self) -> RollingProximityIdentifier;
    fn observed_at(&self) -> SystemTime;
}

impl Observation for Advertisement {
    fn identifier(&self) -> RollingProximityIdentifier {
        self.identifier
    }

    fn observed_at(&self) -> SystemTime {
        self.observed_at
    }
}

/// Deduplicating, self-aging table of observations
#[derive(Debug, Clone)]
pub struct ScanTable<E> {
    entries: HashMap<RollingProximityIdentifier, E>,
    retention: Duration,
}

impl<E: Observation + Clone> ScanTable<E> {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identifier: &RollingProximityIdentifier) -> Option<&E> {
        self.entries.get(identifier)
    }

    /// One update cycle: upsert `entry`, then evict everything expired at `now`.
    /// Returns the number of evicted entries.
    pub fn record(&mut self, entry: E, now: SystemTime) -> usize {
        let id = entry.identifier();
        match self.entries.get(&id) {
            Some(existing) if existing.observed_at() > entry.observed_at() => {
                tracing::trace!(rpi = %id, "Ignoring out-of-order sighting");
            }
            _ => {
                self.entries.insert(id, entry);
            }
        }
        self.evict_expired(now)
    }

    /// Remove entries not refreshed within the retention window
    pub fn evict_expired(&mut self, now: SystemTime) -> usize {
        let retention = self.retention;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            // Entries stamped after `now` (clock skew) count as fresh
            now.duration_since(entry.observed_at())
                .map(|age| age <= retention)
                .unwrap_or(true)
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "Aged out scan results");
        }
        evicted
    }

    /// Entries ordered most recent first
    pub fn snapshot(&self) -> Vec<E> {
        let mut entries: Vec<E> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.observed_at()
                .cmp(&a.observed_at())
                .then_with(|| a.identifier().cmp(&b.identifier()))
        });
        entries
    }
}

impl<E: Observation + Clone> Default for ScanTable<E> {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptedMetadata;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1585785600 + secs)
    }

    fn sighting(id: u8, rssi: i16, secs: u64) -> Advertisement {
        Advertisement {
            identifier: RollingProximityIdentifier([id; 16]),
            metadata: EncryptedMetadata([0; 4]),
            rssi,
            observed_at: at(secs),
        }
    }

    #[test]
    fn test_same_identifier_is_deduplicated() {
        let mut table = ScanTable::default();
        table.record(sighting(1, -70, 0), at(0));
        table.record(sighting(1, -55, 5), at(5));

        assert_eq!(table.len(), 1);
        let entry = table.get(&RollingProximityIdentifier([1; 16])).unwrap();
        assert_eq!(entry.rssi, -55);
        assert_eq!(entry.observed_at, at(5));
    }

    #[test]
    fn test_stale_entries_are_evicted_on_update() {
        let mut table = ScanTable::default();
        table.record(sighting(1, -70, 0), at(0));
        table.record(sighting(2, -60, 10), at(10));

        // 31s after the first sighting
        let evicted = table.record(sighting(3, -65, 31), at(31));
        assert_eq!(evicted, 1);
        assert!(table.get(&RollingProximityIdentifier([1; 16])).is_none());
        assert!(table.get(&RollingProximityIdentifier([2; 16])).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_refreshed_entry_is_retained() {
        let mut table = ScanTable::default();
        table.record(sighting(1, -70, 0), at(0));
        table.record(sighting(1, -68, 25), at(25));
        table.record(sighting(2, -60, 50), at(50));

        let entry = table.get(&RollingProximityIdentifier([1; 16])).unwrap();
        assert_eq!(entry.rssi, -68);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_exactly_retention_old_is_kept() {
        let mut table = ScanTable::default();
        table.record(sighting(1, -70, 0), at(0));
        assert_eq!(table.evict_expired(at(30)), 0);
        assert_eq!(table.evict_expired(at(31)), 1);
    }

    #[test]
    fn test_out_of_order_sighting_does_not_regress() {
        let mut table = ScanTable::default();
        table.record(sighting(1, -50, 10), at(10));
        table.record(sighting(1, -90, 5), at(10));
        assert_eq!(table.get(&RollingProximityIdentifier([1; 16])).unwrap().rssi, -50);
    }

    #[test]
    fn test_snapshot_orders_most_recent_first() {
        let mut table = ScanTable::default();
        table.record(sighting(1, -70, 0), at(0));
        table.record(sighting(2, -60, 4), at(4));
        table.record(sighting(3, -65, 2), at(4));

        let ids: Vec<u8> = table.snapshot().iter().map(|a| a.identifier.0[0]).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
