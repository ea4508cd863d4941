// Match resolver: ties observed identifiers back to imported keys

use super::known_keys::KnownKeyTable;
use crate::crypto::{
    decrypt_metadata, derive_metadata_key, AssociatedMetadata, RollingProximityIdentifier,
};
use crate::rotation::Interval;
use crate::transport::ble::{Advertisement, Observation};
use serde::Serialize;
use std::time::SystemTime;

/// What a hit reveals about the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyMatch {
    pub label: String,
    /// Interval the identifier was generated for
    pub interval: Interval,
    pub rolling_start: Interval,
    pub metadata: AssociatedMetadata,
}

/// An advertisement, plus the known key it resolved to if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAdvertisement {
    pub advertisement: Advertisement,
    pub matched: Option<KeyMatch>,
}

impl ResolvedAdvertisement {
    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }

    pub fn label(&self) -> Option<&str> {
        self.matched.as_ref().map(|m| m.label.as_str())
    }
}

impl Observation for ResolvedAdvertisement {
    fn identifier(&self) -> RollingProximityIdentifier {
        self.advertisement.identifier
    }

    fn observed_at(&self) -> SystemTime {
        self.advertisement.observed_at
    }
}

/// Stateless lookup against a known-key snapshot
pub struct MatchResolver;

impl MatchResolver {
    pub fn resolve(table: &KnownKeyTable, advertisement: Advertisement) -> ResolvedAdvertisement {
        let matched = table
            .lookup(&advertisement.identifier)
            .map(|(entry, interval)| {
                let aemk = derive_metadata_key(entry.key());
                let plain =
                    decrypt_metadata(&advertisement.metadata, &advertisement.identifier, &aemk);
                let metadata = AssociatedMetadata::from_plaintext(&plain);
                tracing::debug!(
                    rpi = %advertisement.identifier,
                    label = entry.label(),
                    interval = %interval,
                    tx_power = metadata.tx_power,
                    "Resolved advertisement"
                );
                KeyMatch {
                    label: entry.label().to_string(),
                    interval,
                    rolling_start: entry.rolling_start(),
                    metadata,
                }
            });
        ResolvedAdvertisement {
            advertisement,
            matched,
        }
    }
}
