//! Temporary keys and their derived sub-keys
//!
//! A `TemporaryKey` is the 16-byte secret a device broadcasts from for one
//! rolling period. Everything that goes on the air is derived from it, so the
//! secret zeroizes on drop and never shows up in `Debug` output.

use crate::rotation::{epoch_start, Interval, ROLLING_PERIOD};
use base64::Engine;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every AES-128 key in the key schedule
pub const KEY_LENGTH: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors raised when key material crosses the crate boundary
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Invalid base64 encoding: {0}")]
    InvalidBase64(String),

    #[error("Rolling start {0} is not aligned to the rolling period")]
    UnalignedRollingStart(u32),
}

// ============================================================================
// TEMPORARY KEY
// ============================================================================

/// A secret valid for one rolling period of 144 intervals
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TemporaryKey {
    secret: [u8; KEY_LENGTH],
    #[zeroize(skip)]
    rolling_start: Interval,
}

impl TemporaryKey {
    /// Wrap an existing secret. `rolling_start` must be an epoch start.
    pub fn new(secret: [u8; KEY_LENGTH], rolling_start: Interval) -> Result<Self, KeyError> {
        if epoch_start(rolling_start) != rolling_start {
            return Err(KeyError::UnalignedRollingStart(rolling_start.value()));
        }
        Ok(Self {
            secret,
            rolling_start,
        })
    }

    /// Draw a fresh secret for the epoch containing `interval`
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, interval: Interval) -> Self {
        let mut secret = [0u8; KEY_LENGTH];
        rng.fill_bytes(&mut secret);
        let key = Self {
            secret,
            rolling_start: epoch_start(interval),
        };
        secret.zeroize();
        key
    }

    /// Parse a secret from an untrusted byte slice
    pub fn from_slice(bytes: &[u8], rolling_start: Interval) -> Result<Self, KeyError> {
        let secret: [u8; KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: KEY_LENGTH,
                got: bytes.len(),
            })?;
        Self::new(secret, rolling_start)
    }

    pub fn secret(&self) -> &[u8; KEY_LENGTH] {
        &self.secret
    }

    /// First interval this key is valid for
    pub fn rolling_start(&self) -> Interval {
        self.rolling_start
    }

    /// Hex form of the secret, for display after an explicit user action
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    /// Export the key so a second device can import it
    pub fn export(&self) -> ExportedKey {
        ExportedKey {
            key_data: self.secret_hex(),
            rolling_start_interval_number: self.rolling_start.value(),
            rolling_period: ROLLING_PERIOD,
        }
    }
}

impl fmt::Debug for TemporaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryKey")
            .field("secret", &"<redacted>")
            .field("rolling_start", &self.rolling_start)
            .finish()
    }
}

impl PartialEq for TemporaryKey {
    fn eq(&self, other: &Self) -> bool {
        self.secret == other.secret && self.rolling_start == other.rolling_start
    }
}

impl Eq for TemporaryKey {}

// ============================================================================
// DERIVED SUB-KEYS
// ============================================================================

/// Sub-key used to encrypt rolling proximity identifiers (RPIK)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProximityIdentifierKey(pub(crate) [u8; KEY_LENGTH]);

/// Sub-key used to encrypt associated metadata (AEMK)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MetadataKey(pub(crate) [u8; KEY_LENGTH]);

macro_rules! sub_key_impls {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(<redacted>)"))
            }
        }
    };
}

sub_key_impls!(ProximityIdentifierKey);
sub_key_impls!(MetadataKey);

// ============================================================================
// EXPORT FORMAT
// ============================================================================

/// Out-of-band form of a temporary key (QR code, file, clipboard)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedKey {
    /// Hex-encoded 16-byte secret
    pub key_data: String,
    pub rolling_start_interval_number: u32,
    pub rolling_period: u32,
}

impl ExportedKey {
    /// Turn an export back into a key
    pub fn to_temporary_key(&self) -> Result<TemporaryKey, KeyError> {
        let bytes = decode_hex_secret(&self.key_data)?;
        TemporaryKey::from_slice(&bytes, Interval::new(self.rolling_start_interval_number))
    }
}

pub(crate) fn decode_hex_secret(input: &str) -> Result<Vec<u8>, KeyError> {
    let bytes = hex::decode(input.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    check_length(bytes)
}

pub(crate) fn decode_base64_secret(input: &str) -> Result<Vec<u8>, KeyError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|e| KeyError::InvalidBase64(e.to_string()))?;
    check_length(bytes)
}

fn check_length(bytes: Vec<u8>) -> Result<Vec<u8>, KeyError> {
    if bytes.len() != KEY_LENGTH {
        return Err(KeyError::InvalidLength {
            expected: KEY_LENGTH,
            got: bytes.len(),
        });
    }
    Ok(bytes)
}
