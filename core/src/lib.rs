// EN Toolkit Core: Exposure Notification key schedule and BLE proximity
#![allow(clippy::empty_line_after_doc_comments)]
//
// Rolling identifiers go out over BLE, identifiers heard nearby come back in,
// and the ones that belong to imported keys are resolved to a label.

pub mod crypto;
pub mod matching;
pub mod platform;
pub mod rotation;
pub mod transport;

use thiserror::Error;

pub use crypto::{
    AssociatedMetadata, EncryptedMetadata, ExportedKey, KeyError, RollingProximityIdentifier,
    TemporaryKey,
};
pub use matching::{
    KeyImport, KeyMatch, KnownKeyEntry, KnownKeyStore, KnownKeyTable, MatchResolver,
    ResolvedAdvertisement,
};
pub use platform::{
    AdvertisingState, ConfigError, ExportError, KeyBatchExporter, ProximityService,
    ServiceConfig,
};
pub use rotation::{
    current_interval, epoch_start, needs_new_key, Clock, Interval, ManualClock, RotationClock,
    SystemClock, INTERVAL_SECS, ROLLING_PERIOD,
};
pub use transport::{
    Advertisement, AdvertiserError, BleCentral, BleError, BlePeripheral, ScannerError,
    EN_SERVICE_UUID,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Any error the toolkit core can report
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolkitError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Ble(#[from] BleError),

    #[error(transparent)]
    Advertiser(#[from] AdvertiserError),

    #[error(transparent)]
    Scanner(#[from] ScannerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert_into_toolkit_error() {
        let err: ToolkitError = KeyError::InvalidHex("zz".to_string()).into();
        assert!(matches!(err, ToolkitError::Key(_)));

        let err: ToolkitError = ScannerError::ScanFailed(BleError::ScanFailed(2)).into();
        assert_eq!(err.to_string(), "Scan failed: Scan failed with error 2");
    }

    #[test]
    fn test_config_error_propagates_with_question_mark() {
        fn build() -> Result<(), ToolkitError> {
            ServiceConfig {
                scan_retention_secs: 0,
                ..Default::default()
            }
            .validate()?;
            Ok(())
        }
        assert_eq!(
            build(),
            Err(ToolkitError::Config(ConfigError::InvalidScanRetention(0)))
        );
    }
}
