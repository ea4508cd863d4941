/// Exposure Notification service data
///
/// The service data carried under the 0xFD6F UUID is exactly 20 bytes: the
/// 16-byte rolling proximity identifier followed by the 4-byte encrypted
/// metadata. Anything else is not an EN advertisement.

use crate::crypto::{
    compute_identifier, derive_metadata_key, derive_proximity_identifier_key, encrypt_metadata,
    EncryptedMetadata, RollingProximityIdentifier, TemporaryKey, IDENTIFIER_LENGTH,
    METADATA_LENGTH,
};
use crate::rotation::Interval;
use crate::transport::abstraction::{AdvertiseData, EN_SERVICE_UUID};
use std::time::SystemTime;

/// Total service data length
pub const SERVICE_DATA_LENGTH: usize = IDENTIFIER_LENGTH + METADATA_LENGTH;

/// Identifier and metadata as broadcast for one interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisementPayload {
    pub identifier: RollingProximityIdentifier,
    pub metadata: EncryptedMetadata,
}

impl AdvertisementPayload {
    /// Compute the payload a key broadcasts during `interval`
    pub fn for_interval(key: &TemporaryKey, interval: Interval, tx_power: i8) -> Self {
        let identifier = compute_identifier(&derive_proximity_identifier_key(key), interval);
        let metadata = encrypt_metadata(&identifier, &derive_metadata_key(key), tx_power);
        Self {
            identifier,
            metadata,
        }
    }

    pub fn to_service_data(&self) -> [u8; SERVICE_DATA_LENGTH] {
        let mut data = [0u8; SERVICE_DATA_LENGTH];
        data[..IDENTIFIER_LENGTH].copy_from_slice(self.identifier.as_bytes());
        data[IDENTIFIER_LENGTH..].copy_from_slice(self.metadata.as_bytes());
        data
    }

    /// Split received service data. Returns `None` unless it is exactly 20 bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != SERVICE_DATA_LENGTH {
            return None;
        }
        let (rpi, aem) = data.split_at(IDENTIFIER_LENGTH);
        Some(Self {
            identifier: RollingProximityIdentifier::from_slice(rpi).ok()?,
            metadata: EncryptedMetadata::from_slice(aem).ok()?,
        })
    }

    /// Packet contents for the platform advertiser. Device name and the
    /// tx-power-level AD field are left out.
    pub fn to_advertise_data(&self) -> AdvertiseData {
        AdvertiseData {
            service_uuid: EN_SERVICE_UUID,
            service_data: self.to_service_data().to_vec(),
            include_device_name: false,
            include_tx_power_level: false,
        }
    }
}

/// One observed broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub identifier: RollingProximityIdentifier,
    pub metadata: EncryptedMetadata,
    pub rssi: i16,
    pub observed_at: SystemTime,
}

impl Advertisement {
    pub fn new(payload: AdvertisementPayload, rssi: i16, observed_at: SystemTime) -> Self {
        Self {
            identifier: payload.identifier,
            metadata: payload.metadata,
            rssi,
            observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_key() -> TemporaryKey {
        let secret: [u8; 16] = hex::decode("75c734c6dd1a782de7a965da5eb93125")
            .unwrap()
            .try_into()
            .unwrap();
        TemporaryKey::new(secret, Interval::new(2642976)).unwrap()
    }

    #[test]
    fn test_payload_known_answer() {
        let payload = AdvertisementPayload::for_interval(&reference_key(), Interval::new(2642976), 8);
        assert_eq!(
            hex::encode(payload.to_service_data()),
            "8be6cd371c5c891604bfbe49df84509672033874"
        );
    }

    #[test]
    fn test_parse_rejects_wrong_lengths() {
        assert!(AdvertisementPayload::parse(&[0u8; 19]).is_none());
        assert!(AdvertisementPayload::parse(&[0u8; 21]).is_none());
        assert!(AdvertisementPayload::parse(&[]).is_none());
    }

    #[test]
    fn test_parse_splits_identifier_and_metadata() {
        let mut data = [0u8; 20];
        data[..16].copy_from_slice(&[0xaa; 16]);
        data[16..].copy_from_slice(&[1, 2, 3, 4]);

        let payload = AdvertisementPayload::parse(&data).unwrap();
        assert_eq!(payload.identifier.0, [0xaa; 16]);
        assert_eq!(payload.metadata.0, [1, 2, 3, 4]);
        assert_eq!(payload.to_service_data(), data);
    }

    #[test]
    fn test_advertise_data_omits_optional_fields() {
        let payload = AdvertisementPayload::for_interval(&reference_key(), Interval::new(2642980), -42);
        let data = payload.to_advertise_data();
        assert_eq!(data.service_uuid, EN_SERVICE_UUID);
        assert_eq!(data.service_data.len(), SERVICE_DATA_LENGTH);
        assert!(!data.include_device_name);
        assert!(!data.include_tx_power_level);
    }
}
