/// In-process BLE radio
///
/// `LoopbackAir` stands in for the shared radio channel. Peripherals attached
/// to it publish advertisements, centrals attached to it receive them. Used by
/// the integration tests and the CLI self-test, where no hardware is around.

use crate::transport::abstraction::{
    AdvertiseData, AdvertiseSettings, BleCentral, BleError, BlePeripheral, RawAdvertisement,
    ScanEvent, ScanSettings,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const LISTENER_CAPACITY: usize = 256;

#[derive(Default)]
struct AirState {
    broadcasts: HashMap<u64, Broadcast>,
    listeners: HashMap<u64, Listener>,
}

struct Broadcast {
    data: AdvertiseData,
    rssi: i16,
}

struct Listener {
    settings: ScanSettings,
    sender: mpsc::Sender<ScanEvent>,
}

impl AirState {
    fn deliver(&mut self, raw: &RawAdvertisement) {
        self.listeners.retain(|_, listener| {
            if !raw.service_data.contains_key(&listener.settings.service_uuid) {
                return true;
            }
            match listener.sender.try_send(ScanEvent::Result(raw.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("Loopback listener full; packet lost");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

fn to_raw(broadcast: &Broadcast) -> RawAdvertisement {
    RawAdvertisement::with_service_data(
        broadcast.rssi,
        broadcast.data.service_uuid,
        broadcast.data.service_data.clone(),
    )
}

/// Shared radio channel
#[derive(Clone, Default)]
pub struct LoopbackAir {
    state: Arc<Mutex<AirState>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a peripheral heard at `rssi` by every central
    pub fn peripheral(&self, rssi: i16) -> LoopbackPeripheral {
        LoopbackPeripheral {
            air: self.clone(),
            id: self.allocate_id(),
            rssi,
            supported: true,
            fail_with: Mutex::new(None),
        }
    }

    /// Attach a peripheral that reports no advertising capability
    pub fn unsupported_peripheral(&self) -> LoopbackPeripheral {
        LoopbackPeripheral {
            supported: false,
            ..self.peripheral(0)
        }
    }

    pub fn central(&self) -> LoopbackCentral {
        LoopbackCentral {
            air: self.clone(),
            id: self.allocate_id(),
        }
    }

    /// Re-send every active broadcast, as a real advertiser does on each
    /// advertising event
    pub fn pulse(&self) {
        let mut state = self.state.lock();
        let packets: Vec<RawAdvertisement> = state.broadcasts.values().map(to_raw).collect();
        for raw in &packets {
            state.deliver(raw);
        }
    }

    /// Put an arbitrary packet on the air
    pub fn inject(&self, raw: RawAdvertisement) {
        self.state.lock().deliver(&raw);
    }

    /// Report a platform scan failure to every listening central
    pub fn fail_scans(&self, error: BleError) {
        let mut state = self.state.lock();
        for listener in state.listeners.values() {
            let _ = listener.sender.try_send(ScanEvent::Failed(error.clone()));
        }
        state.listeners.clear();
    }

    /// Service data currently being broadcast, across all peripherals
    pub fn active_broadcasts(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .broadcasts
            .values()
            .map(|b| b.data.service_data.clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

// ============================================================================
// PERIPHERAL
// ============================================================================

pub struct LoopbackPeripheral {
    air: LoopbackAir,
    id: u64,
    rssi: i16,
    supported: bool,
    fail_with: Mutex<Option<BleError>>,
}

impl LoopbackPeripheral {
    /// Make the next start fail with `error`
    pub fn fail_next_start(&self, error: BleError) {
        *self.fail_with.lock() = Some(error);
    }
}

#[async_trait]
impl BlePeripheral for LoopbackPeripheral {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        data: AdvertiseData,
    ) -> Result<(), BleError> {
        if !self.supported {
            return Err(BleError::Unsupported);
        }
        if let Some(error) = self.fail_with.lock().take() {
            return Err(error);
        }
        if settings.connectable {
            tracing::debug!("Loopback ignores connectable advertising");
        }

        let broadcast = Broadcast {
            data,
            rssi: self.rssi,
        };
        let raw = to_raw(&broadcast);
        let mut state = self.air.state.lock();
        if state.broadcasts.insert(self.id, broadcast).is_some() {
            tracing::warn!(peripheral = self.id, "Loopback advertisement replaced without stop");
        }
        state.deliver(&raw);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        self.air.state.lock().broadcasts.remove(&self.id);
        Ok(())
    }
}

// ============================================================================
// CENTRAL
// ============================================================================

pub struct LoopbackCentral {
    air: LoopbackAir,
    id: u64,
}

#[async_trait]
impl BleCentral for LoopbackCentral {
    async fn start_scan(
        &self,
        settings: ScanSettings,
    ) -> Result<mpsc::Receiver<ScanEvent>, BleError> {
        let (sender, receiver) = mpsc::channel(LISTENER_CAPACITY);
        self.air
            .state
            .lock()
            .listeners
            .insert(self.id, Listener { settings, sender });
        Ok(receiver)
    }

    fn stop_scan(&self) {
        self.air.state.lock().listeners.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::EN_SERVICE_UUID;

    fn en_data(byte: u8) -> AdvertiseData {
        AdvertiseData {
            service_uuid: EN_SERVICE_UUID,
            service_data: vec![byte; 20],
            include_device_name: false,
            include_tx_power_level: false,
        }
    }

    #[tokio::test]
    async fn test_started_advertisement_reaches_central() {
        let air = LoopbackAir::new();
        let peripheral = air.peripheral(-48);
        let central = air.central();

        let mut events = central.start_scan(ScanSettings::default()).await.unwrap();
        peripheral
            .start_advertising(AdvertiseSettings::default(), en_data(7))
            .await
            .unwrap();

        match events.recv().await {
            Some(ScanEvent::Result(raw)) => {
                assert_eq!(raw.rssi, -48);
                assert_eq!(raw.service_data[&EN_SERVICE_UUID], vec![7; 20]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_removes_broadcast() {
        let air = LoopbackAir::new();
        let peripheral = air.peripheral(-48);
        peripheral
            .start_advertising(AdvertiseSettings::default(), en_data(1))
            .await
            .unwrap();
        assert_eq!(air.active_broadcasts().len(), 1);

        peripheral.stop_advertising().await.unwrap();
        assert!(air.active_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_stop_scan_detaches_listener() {
        let air = LoopbackAir::new();
        let central = air.central();
        let _events = central.start_scan(ScanSettings::default()).await.unwrap();
        assert_eq!(air.listener_count(), 1);

        central.stop_scan();
        central.stop_scan();
        assert_eq!(air.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_peripheral_refuses() {
        let air = LoopbackAir::new();
        let peripheral = air.unsupported_peripheral();
        assert!(!peripheral.is_supported());
        assert_eq!(
            peripheral
                .start_advertising(AdvertiseSettings::default(), en_data(1))
                .await,
            Err(BleError::Unsupported)
        );
    }
}
