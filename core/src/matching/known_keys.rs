// Known keys: imported temporary keys expanded into identifier lookups

use crate::crypto::{
    compute_identifier, derive_proximity_identifier_key, RollingProximityIdentifier,
    TemporaryKey,
};
use crate::rotation::{Interval, ROLLING_PERIOD};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One imported key with every identifier it broadcasts over its rolling period
pub struct KnownKeyEntry {
    key: TemporaryKey,
    label: String,
    identifiers: HashMap<RollingProximityIdentifier, Interval>,
}

impl KnownKeyEntry {
    /// Expand `key` into its 144 per-interval identifiers
    pub fn new(key: TemporaryKey, label: impl Into<String>) -> Self {
        let rpik = derive_proximity_identifier_key(&key);
        let start = key.rolling_start();
        let identifiers = (0..ROLLING_PERIOD)
            .map(|n| {
                let interval = start.offset(n);
                (compute_identifier(&rpik, interval), interval)
            })
            .collect();
        Self {
            key,
            label: label.into(),
            identifiers,
        }
    }

    pub fn key(&self) -> &TemporaryKey {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rolling_start(&self) -> Interval {
        self.key.rolling_start()
    }

    pub fn identifiers(&self) -> &HashMap<RollingProximityIdentifier, Interval> {
        &self.identifiers
    }

    /// Interval in which this key broadcast `identifier`, if it did
    pub fn interval_of(&self, identifier: &RollingProximityIdentifier) -> Option<Interval> {
        self.identifiers.get(identifier).copied()
    }
}

impl fmt::Debug for KnownKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnownKeyEntry")
            .field("label", &self.label)
            .field("rolling_start", &self.key.rolling_start())
            .field("identifiers", &self.identifiers.len())
            .finish()
    }
}

// ============================================================================
// MERGED TABLE
// ============================================================================

/// Immutable set of known keys with one merged identifier index
///
/// Built once per import; lookups are a single hash probe no matter how many
/// keys are known.
#[derive(Debug, Clone, Default)]
pub struct KnownKeyTable {
    entries: Vec<Arc<KnownKeyEntry>>,
    index: HashMap<RollingProximityIdentifier, (usize, Interval)>,
}

impl KnownKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = KnownKeyEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(Arc::new(entry));
        }
        table
    }

    fn insert(&mut self, entry: Arc<KnownKeyEntry>) {
        let position = self.entries.len();
        for (identifier, interval) in entry.identifiers() {
            if self.index.contains_key(identifier) {
                tracing::warn!(rpi = %identifier, label = entry.label(), "Identifier already known; keeping first entry");
                continue;
            }
            self.index.insert(*identifier, (position, *interval));
        }
        self.entries.push(entry);
    }

    /// A new table holding every current entry plus `entry`
    pub fn with_entry(&self, entry: KnownKeyEntry) -> Self {
        let mut table = self.clone();
        table.insert(Arc::new(entry));
        table
    }

    pub fn entries(&self) -> &[Arc<KnownKeyEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of identifiers in the merged index
    pub fn identifier_count(&self) -> usize {
        self.index.len()
    }

    pub fn lookup(
        &self,
        identifier: &RollingProximityIdentifier,
    ) -> Option<(&KnownKeyEntry, Interval)> {
        let (position, interval) = self.index.get(identifier)?;
        self.entries
            .get(*position)
            .map(|entry| (entry.as_ref(), *interval))
    }
}

// ============================================================================
// SNAPSHOT STORE
// ============================================================================

/// Handle through which imports reach the scanner
///
/// Readers take an `Arc` snapshot and never see a table mid-update; writers
/// replace the whole table at once.
#[derive(Clone, Default)]
pub struct KnownKeyStore {
    current: Arc<RwLock<Arc<KnownKeyTable>>>,
}

impl KnownKeyStore {
    pub fn new(table: KnownKeyTable) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    pub fn snapshot(&self) -> Arc<KnownKeyTable> {
        self.current.read().clone()
    }

    /// Replace the published table
    pub fn publish(&self, table: KnownKeyTable) {
        let keys = table.len();
        *self.current.write() = Arc::new(table);
        tracing::info!(keys, "Published known-key table");
    }

    /// Publish the current table extended with `entry`
    pub fn append(&self, entry: KnownKeyEntry) {
        let mut current = self.current.write();
        let next = current.with_entry(entry);
        let keys = next.len();
        *current = Arc::new(next);
        tracing::info!(keys, "Appended known key");
    }
}

impl fmt::Debug for KnownKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnownKeyStore")
            .field("keys", &self.snapshot().len())
            .finish()
    }
}
