// Key import: parsing secrets received out of band

use super::known_keys::KnownKeyEntry;
use crate::crypto::keys::{decode_base64_secret, decode_hex_secret};
use crate::crypto::{ExportedKey, KeyError, TemporaryKey, KEY_LENGTH};
use crate::rotation::Interval;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Label used when the sender supplied none
pub const DEFAULT_DEVICE_LABEL: &str = "EN device";

/// A secret awaiting expansion into a `KnownKeyEntry`
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyImport {
    secret: [u8; KEY_LENGTH],
    #[zeroize(skip)]
    label: String,
    #[zeroize(skip)]
    rolling_start: Option<Interval>,
}

impl KeyImport {
    pub fn new(secret: [u8; KEY_LENGTH]) -> Self {
        Self {
            secret,
            label: DEFAULT_DEVICE_LABEL.to_string(),
            rolling_start: None,
        }
    }

    fn from_vec(mut bytes: Vec<u8>) -> Result<Self, KeyError> {
        let mut secret = [0u8; KEY_LENGTH];
        if bytes.len() != KEY_LENGTH {
            let got = bytes.len();
            bytes.zeroize();
            return Err(KeyError::InvalidLength {
                expected: KEY_LENGTH,
                got,
            });
        }
        secret.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self::new(secret))
    }

    /// Parse a hex-encoded secret (surrounding whitespace ignored)
    pub fn from_hex(input: &str) -> Result<Self, KeyError> {
        Self::from_vec(decode_hex_secret(input)?)
    }

    /// Parse a standard base64-encoded secret
    pub fn from_base64(input: &str) -> Result<Self, KeyError> {
        Self::from_vec(decode_base64_secret(input)?)
    }

    /// Accept either encoding; hex is tried first
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        Self::from_hex(input).or_else(|hex_err| match Self::from_base64(input) {
            Ok(import) => Ok(import),
            Err(_) => Err(hex_err),
        })
    }

    pub fn from_exported(exported: &ExportedKey) -> Result<Self, KeyError> {
        Ok(Self::from_hex(&exported.key_data)?
            .with_rolling_start(Interval::new(exported.rolling_start_interval_number)))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !label.trim().is_empty() {
            self.label = label;
        }
        self
    }

    pub fn with_rolling_start(mut self, rolling_start: Interval) -> Self {
        self.rolling_start = Some(rolling_start);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rolling_start(&self) -> Option<Interval> {
        self.rolling_start
    }

    /// Expand into a known-key entry. Without an explicit rolling start the
    /// key is assumed to belong to `current_epoch`.
    pub fn into_entry(self, current_epoch: Interval) -> Result<KnownKeyEntry, KeyError> {
        let start = self.rolling_start.unwrap_or(current_epoch);
        let key = TemporaryKey::new(self.secret, start)?;
        tracing::debug!(label = %self.label, rolling_start = %start, "Expanding imported key");
        Ok(KnownKeyEntry::new(key, self.label.clone()))
    }
}

impl fmt::Debug for KeyImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyImport")
            .field("secret", &"<redacted>")
            .field("label", &self.label)
            .field("rolling_start", &self.rolling_start)
            .finish()
    }
}
