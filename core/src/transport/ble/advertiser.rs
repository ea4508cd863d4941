/// BLE advertiser
///
/// Drives the platform peripheral role. Each start computes the payload for
/// one interval and publishes it; rolling to the next interval is a full stop
/// and restart because the platform cannot update service data in place.

use super::payload::AdvertisementPayload;
use crate::crypto::{RollingProximityIdentifier, TemporaryKey};
use crate::rotation::Interval;
use crate::transport::abstraction::{AdvertiseSettings, BleError, BlePeripheral};
use std::sync::Arc;
use thiserror::Error;

/// Errors for advertiser operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertiserError {
    #[error("No BLE peripheral capability on this device")]
    Unsupported,
    #[error("Platform refused to advertise: {0}")]
    StartFailed(BleError),
}

/// Advertiser state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiserState {
    /// Nothing on the air
    Idle,
    /// The platform acknowledged this payload
    Advertising {
        identifier: RollingProximityIdentifier,
        interval: Interval,
    },
    /// The last start failed; the caller decides whether to retry
    Failed(AdvertiserError),
}

/// Single-payload advertiser over a platform peripheral
pub struct BleAdvertiser {
    peripheral: Arc<dyn BlePeripheral>,
    settings: AdvertiseSettings,
    state: AdvertiserState,
    // Set from the moment a start is issued until a stop completes, so a
    // start future dropped mid-flight still gets cleaned up by `stop`.
    platform_active: bool,
}

impl BleAdvertiser {
    pub fn new(peripheral: Arc<dyn BlePeripheral>, settings: AdvertiseSettings) -> Self {
        Self {
            peripheral,
            settings,
            state: AdvertiserState::Idle,
            platform_active: false,
        }
    }

    pub fn state(&self) -> &AdvertiserState {
        &self.state
    }

    pub fn is_advertising(&self) -> bool {
        matches!(self.state, AdvertiserState::Advertising { .. })
    }

    /// Advertise the payload for `interval`. Any current advertisement is
    /// stopped first so at most one payload is ever on the air.
    pub async fn start(
        &mut self,
        key: &TemporaryKey,
        interval: Interval,
        tx_power: i8,
    ) -> Result<AdvertisementPayload, AdvertiserError> {
        self.stop().await;

        if !self.peripheral.is_supported() {
            tracing::error!("Cannot advertise: no BLE peripheral capability");
            self.state = AdvertiserState::Failed(AdvertiserError::Unsupported);
            return Err(AdvertiserError::Unsupported);
        }

        let payload = AdvertisementPayload::for_interval(key, interval, tx_power);
        let data = payload.to_advertise_data();

        self.platform_active = true;
        match self
            .peripheral
            .start_advertising(self.settings.clone(), data)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    rpi = %payload.identifier,
                    interval = %interval,
                    "Started advertising"
                );
                self.state = AdvertiserState::Advertising {
                    identifier: payload.identifier,
                    interval,
                };
                Ok(payload)
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not start advertiser");
                self.platform_active = false;
                let err = match e {
                    BleError::Unsupported => AdvertiserError::Unsupported,
                    other => AdvertiserError::StartFailed(other),
                };
                self.state = AdvertiserState::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Cancel the current advertisement. Safe to call at any time.
    pub async fn stop(&mut self) {
        if self.platform_active {
            if let Err(e) = self.peripheral.stop_advertising().await {
                tracing::warn!(error = %e, "Platform reported an error stopping advertiser");
            } else {
                tracing::debug!("Stopped advertising");
            }
            self.platform_active = false;
        }
        self.state = AdvertiserState::Idle;
    }
}
