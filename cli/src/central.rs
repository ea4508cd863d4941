// Desktop BLE capabilities backed by btleplug
//
// btleplug only exposes the central role, so the desktop peripheral reports
// itself as unsupported and advertising fails cleanly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use en_toolkit_core::transport::{
    AdvertiseData, AdvertiseSettings, BleCentral, BleError, BlePeripheral, RawAdvertisement,
    ScanEvent, ScanSettings,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 256;

/// RSSI reported when the adapter has no reading for a peripheral
const UNKNOWN_RSSI: i16 = -127;

pub struct BtleplugCentral {
    adapter: Adapter,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Use the first Bluetooth adapter on this machine
    pub async fn first_adapter() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to initialise Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;

        if let Ok(info) = adapter.adapter_info().await {
            tracing::info!(adapter = %info, "Using Bluetooth adapter");
        }

        Ok(Self {
            adapter,
            pump: Mutex::new(None),
        })
    }
}

async fn rssi_of(adapter: &Adapter, id: &btleplug::platform::PeripheralId) -> i16 {
    match adapter.peripheral(id).await {
        Ok(peripheral) => match peripheral.properties().await {
            Ok(Some(props)) => props.rssi.unwrap_or(UNKNOWN_RSSI),
            _ => UNKNOWN_RSSI,
        },
        Err(_) => UNKNOWN_RSSI,
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(
        &self,
        settings: ScanSettings,
    ) -> Result<mpsc::Receiver<ScanEvent>, BleError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleError::Platform(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![settings.service_uuid],
            })
            .await
            .map_err(|e| BleError::Platform(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let adapter = self.adapter.clone();
        let service_uuid = settings.service_uuid;

        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::ServiceDataAdvertisement { id, service_data } = event else {
                    continue;
                };
                if !service_data.contains_key(&service_uuid) {
                    continue;
                }
                let raw = RawAdvertisement {
                    address: Some(format!("{:?}", id)),
                    rssi: rssi_of(&adapter, &id).await,
                    service_data,
                };
                if tx.send(ScanEvent::Result(raw)).await.is_err() {
                    return;
                }
            }
            tracing::warn!("Bluetooth adapter event stream ended");
            let _ = tx
                .send(ScanEvent::Failed(BleError::Platform(
                    "adapter event stream ended".to_string(),
                )))
                .await;
        });

        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        Ok(rx)
    }

    fn stop_scan(&self) {
        let Some(pump) = self.pump.lock().take() else {
            return;
        };
        pump.abort();

        let adapter = self.adapter.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    tracing::warn!(error = %e, "Failed to stop Bluetooth scan");
                }
            });
        }
    }
}

/// Peripheral role for desktops, where btleplug cannot advertise
pub struct UnsupportedPeripheral;

#[async_trait]
impl BlePeripheral for UnsupportedPeripheral {
    fn is_supported(&self) -> bool {
        false
    }

    async fn start_advertising(
        &self,
        _settings: AdvertiseSettings,
        _data: AdvertiseData,
    ) -> Result<(), BleError> {
        Err(BleError::Unsupported)
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        Ok(())
    }
}
