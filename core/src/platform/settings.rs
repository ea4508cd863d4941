//! Service configuration
//!
//! Knobs the embedding application may tune:
//! - Calibrated transmit power carried in the encrypted metadata
//! - Tick period of the rotation loop
//! - Scan result retention window
//! - Platform advertise/scan modes
//!
//! The 600-second interval and 144-interval rolling period are protocol
//! constants and are not configurable.

use crate::transport::abstraction::{
    AdvertiseMode, AdvertiseSettings, AdvertiseTxLevel, ScanMode, ScanSettings,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Transmit power advertised when none is configured (dBm)
pub const DEFAULT_TX_POWER: i8 = -42;

/// Longest allowed gap between rotation ticks
pub const MAX_TICK_PERIOD_SECS: u64 = 60;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Invalid tick period: must be 1-60 seconds, got {0}")]
    InvalidTickPeriod(u64),

    #[error("Invalid scan retention: must be > 0 seconds, got {0}")]
    InvalidScanRetention(u64),

    #[error("Invalid tx power: {0} dBm is outside -127..=127")]
    InvalidTxPower(i8),
}

// ============================================================================
// SERVICE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Calibrated transmit power in dBm, encrypted into every advertisement
    pub tx_power: i8,

    /// How often the rotation loop re-checks the current interval
    pub tick_period_secs: u64,

    /// Scan results not refreshed within this window are evicted
    pub scan_retention_secs: u64,

    pub advertise_mode: AdvertiseMode,
    pub advertise_tx_level: AdvertiseTxLevel,
    pub scan_mode: ScanMode,
}

impl ServiceConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_secs == 0 || self.tick_period_secs > MAX_TICK_PERIOD_SECS {
            return Err(ConfigError::InvalidTickPeriod(self.tick_period_secs));
        }

        if self.scan_retention_secs == 0 {
            return Err(ConfigError::InvalidScanRetention(self.scan_retention_secs));
        }

        // Metadata carries tx power in -127..=127
        if self.tx_power == i8::MIN {
            return Err(ConfigError::InvalidTxPower(self.tx_power));
        }

        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_period_secs)
    }

    pub fn scan_retention(&self) -> Duration {
        Duration::from_secs(self.scan_retention_secs)
    }

    pub fn advertise_settings(&self) -> AdvertiseSettings {
        AdvertiseSettings {
            mode: self.advertise_mode,
            tx_level: self.advertise_tx_level,
            connectable: false,
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            mode: self.scan_mode,
            ..ScanSettings::default()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tx_power: DEFAULT_TX_POWER,
            tick_period_secs: MAX_TICK_PERIOD_SECS,
            scan_retention_secs: 30,
            advertise_mode: AdvertiseMode::Balanced,
            advertise_tx_level: AdvertiseTxLevel::Medium,
            scan_mode: ScanMode::LowLatency,
        }
    }
}
