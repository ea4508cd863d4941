//! Exposure Notification key schedule
//!
//! Pure functions that turn a temporary key and an interval into the bytes a
//! device broadcasts:
//!
//! ```text
//! RPIK = HKDF-SHA256(tek, salt = none, info = "EN-RPIK", 16)
//! AEMK = HKDF-SHA256(tek, salt = none, info = "EN-AEMK", 16)
//! RPI  = AES-128-ECB(RPIK, "EN-RPI" || 0x00 * 6 || LE32(interval))
//! AEM  = AES-128-CTR(AEMK, iv = RPI, metadata)
//! ```

use super::keys::{KeyError, MetadataKey, ProximityIdentifierKey, TemporaryKey, KEY_LENGTH};
use crate::rotation::Interval;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const RPIK_INFO: &[u8] = b"EN-RPIK";
const AEMK_INFO: &[u8] = b"EN-AEMK";
const RPI_PREFIX: &[u8; 6] = b"EN-RPI";

/// Length of a rolling proximity identifier
pub const IDENTIFIER_LENGTH: usize = 16;

/// Length of the associated encrypted metadata
pub const METADATA_LENGTH: usize = 4;

/// Plaintext byte 0: major version 1, minor version 0
pub const METADATA_VERSION_BYTE: u8 = 0x40;

// ============================================================================
// WIRE VALUES
// ============================================================================

/// 16-byte rolling proximity identifier (RPI)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RollingProximityIdentifier(pub [u8; IDENTIFIER_LENGTH]);

impl RollingProximityIdentifier {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| KeyError::InvalidLength {
                expected: IDENTIFIER_LENGTH,
                got: bytes.len(),
            })
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RollingProximityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rpi({})", self.to_hex())
    }
}

impl fmt::Display for RollingProximityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 4-byte associated encrypted metadata (AEM)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptedMetadata(pub [u8; METADATA_LENGTH]);

impl EncryptedMetadata {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| KeyError::InvalidLength {
                expected: METADATA_LENGTH,
                got: bytes.len(),
            })
    }

    pub fn as_bytes(&self) -> &[u8; METADATA_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EncryptedMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aem({})", self.to_hex())
    }
}

/// Decoded metadata plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedMetadata {
    pub major_version: u8,
    pub minor_version: u8,
    /// Calibrated transmit power in dBm
    pub tx_power: i8,
}

impl AssociatedMetadata {
    /// Decode a plaintext block. Reserved bytes are not checked.
    pub fn from_plaintext(plain: &[u8; METADATA_LENGTH]) -> Self {
        Self {
            major_version: (plain[0] >> 6) & 0b11,
            minor_version: (plain[0] >> 4) & 0b11,
            tx_power: plain[1] as i8,
        }
    }
}

// ============================================================================
// KEY DERIVATION
// ============================================================================

fn hkdf_sha256(secret: &[u8; KEY_LENGTH], info: &[u8]) -> [u8; KEY_LENGTH] {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = [0u8; KEY_LENGTH];
    hk.expand(info, &mut okm)
        .unwrap_or_else(|_| unreachable!("16 bytes is a valid HKDF-SHA256 output length"));
    okm
}

/// Derive the rolling proximity identifier key (RPIK)
pub fn derive_proximity_identifier_key(key: &TemporaryKey) -> ProximityIdentifierKey {
    ProximityIdentifierKey(hkdf_sha256(key.secret(), RPIK_INFO))
}

/// Derive the associated encrypted metadata key (AEMK)
pub fn derive_metadata_key(key: &TemporaryKey) -> MetadataKey {
    MetadataKey(hkdf_sha256(key.secret(), AEMK_INFO))
}

// ============================================================================
// IDENTIFIERS AND METADATA
// ============================================================================

/// Compute the identifier broadcast during `interval`
pub fn compute_identifier(
    key: &ProximityIdentifierKey,
    interval: Interval,
) -> RollingProximityIdentifier {
    let mut block = [0u8; IDENTIFIER_LENGTH];
    block[..6].copy_from_slice(RPI_PREFIX);
    block[12..].copy_from_slice(&interval.value().to_le_bytes());

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);

    let mut rpi = [0u8; IDENTIFIER_LENGTH];
    rpi.copy_from_slice(&block);
    RollingProximityIdentifier(rpi)
}

/// Build the metadata plaintext for a given transmit power
pub fn metadata_plaintext(tx_power: i8) -> [u8; METADATA_LENGTH] {
    [METADATA_VERSION_BYTE, tx_power as u8, 0, 0]
}

fn apply_ctr(
    key: &MetadataKey,
    identifier: &RollingProximityIdentifier,
    data: &mut [u8; METADATA_LENGTH],
) {
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(identifier.as_bytes()),
    );
    cipher.apply_keystream(data);
}

/// Encrypt the metadata that rides along with `identifier`
pub fn encrypt_metadata(
    identifier: &RollingProximityIdentifier,
    key: &MetadataKey,
    tx_power: i8,
) -> EncryptedMetadata {
    let mut data = metadata_plaintext(tx_power);
    apply_ctr(key, identifier, &mut data);
    EncryptedMetadata(data)
}

/// Decrypt a metadata block. The plaintext is returned as-is, without
/// validating the version byte.
pub fn decrypt_metadata(
    cipher: &EncryptedMetadata,
    identifier: &RollingProximityIdentifier,
    key: &MetadataKey,
) -> [u8; METADATA_LENGTH] {
    let mut data = cipher.0;
    apply_ctr(key, identifier, &mut data);
    data
}
