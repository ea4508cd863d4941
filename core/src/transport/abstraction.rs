//! BLE platform abstraction
//!
//! The core never talks to a radio directly. Platform code (Android, iOS,
//! BlueZ via btleplug, or the in-process loopback) implements the two
//! capability traits below and the advertiser/scanner drive them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Exposure Notification service UUID (16-bit alias 0xFD6F)
pub const EN_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FD6F_0000_1000_8000_00805F9B34FB);

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors reported by a platform BLE stack
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BleError {
    #[error("BLE role not supported on this device")]
    Unsupported,

    #[error("Bluetooth is disabled")]
    Disabled,

    #[error("Advertise failed with error {0}")]
    AdvertiseFailed(i32),

    #[error("Scan failed with error {0}")]
    ScanFailed(i32),

    #[error("Platform error: {0}")]
    Platform(String),
}

// ============================================================================
// ADVERTISING
// ============================================================================

/// Advertising interval trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

/// Radio output level used while advertising
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AdvertiseTxLevel {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

/// How the platform should advertise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_level: AdvertiseTxLevel,
    pub connectable: bool,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::Balanced,
            tx_level: AdvertiseTxLevel::Medium,
            connectable: false,
        }
    }
}

/// Contents of one advertising packet
#[derive(Clone, PartialEq, Eq)]
pub struct AdvertiseData {
    pub service_uuid: Uuid,
    pub service_data: Vec<u8>,
    pub include_device_name: bool,
    pub include_tx_power_level: bool,
}

impl fmt::Debug for AdvertiseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvertiseData")
            .field("service_uuid", &self.service_uuid)
            .field("service_data", &hex::encode(&self.service_data))
            .field("include_device_name", &self.include_device_name)
            .field("include_tx_power_level", &self.include_tx_power_level)
            .finish()
    }
}

/// Peripheral role of the platform BLE stack
///
/// `start_advertising` resolves once the platform acknowledges the start or
/// reports a failure. Payload bytes are immutable once broadcasting starts;
/// a new payload needs a stop followed by a start.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Whether the device has a usable advertiser at all
    fn is_supported(&self) -> bool;

    async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        data: AdvertiseData,
    ) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;
}

// ============================================================================
// SCANNING
// ============================================================================

/// Scan duty cycle requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScanMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Which matches the platform reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallbackType {
    /// Every matching packet. Needed because MAC addresses rotate
    /// independently of identifiers.
    #[default]
    AllMatches,
    FirstMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Only report packets advertising this service
    pub service_uuid: Uuid,
    pub mode: ScanMode,
    pub callback_type: CallbackType,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            service_uuid: EN_SERVICE_UUID,
            mode: ScanMode::LowLatency,
            callback_type: CallbackType::AllMatches,
        }
    }
}

/// One packet as the platform saw it, before any validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Platform address of the sender, if exposed. Not used for matching.
    pub address: Option<String>,
    pub rssi: i16,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl RawAdvertisement {
    pub fn with_service_data(rssi: i16, uuid: Uuid, data: Vec<u8>) -> Self {
        let mut service_data = HashMap::new();
        service_data.insert(uuid, data);
        Self {
            address: None,
            rssi,
            service_data,
        }
    }
}

/// Callback from the platform scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result(RawAdvertisement),
    /// Terminal failure; no further events follow
    Failed(BleError),
}

/// Central role of the platform BLE stack
///
/// `start_scan` hands back a channel of scan callbacks. `stop_scan` must be
/// idempotent and callable from `Drop`, so it is synchronous.
#[async_trait]
pub trait BleCentral: Send + Sync {
    async fn start_scan(&self, settings: ScanSettings)
        -> Result<mpsc::Receiver<ScanEvent>, BleError>;

    fn stop_scan(&self);
}
