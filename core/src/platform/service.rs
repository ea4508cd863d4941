//! Proximity service
//!
//! The Rust-side service platform code creates and drives. It owns the
//! current temporary key, the advertiser, the scanner and the scan working
//! table. Platform code supplies the BLE capabilities and a clock, calls
//! `start_advertising()`, spawns `run_rotation()` and `run_scanner()`, and
//! watches the published state.
//!
//! Failures are reported, never retried here. Restart policy belongs to the
//! caller.

use crate::crypto::ExportedKey;
use crate::matching::{KnownKeyStore, MatchResolver, ResolvedAdvertisement};
use crate::platform::settings::{ConfigError, ServiceConfig};
use crate::rotation::{Clock, Interval, KeySchedule, RotationClock, TickOutcome};
use crate::transport::abstraction::{BleCentral, BlePeripheral};
use crate::transport::ble::{
    AdvertisementPayload, AdvertiserError, BleAdvertiser, BleScanner, ScanTable, ScannerError,
};
use futures::StreamExt;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

/// How often the scan loop ages out silent devices
const EVICTION_SWEEP_PERIOD: Duration = Duration::from_secs(1);

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors from exporting the current key
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportError {
    #[error("No temporary key has been generated yet")]
    NoKey,

    #[error("Key batch exporter failed: {0}")]
    Exporter(String),
}

// ============================================================================
// EXPORT SINK
// ============================================================================

/// Collaborator that encodes and signs a batch of keys for upload
#[cfg_attr(test, mockall::automock)]
pub trait KeyBatchExporter: Send + Sync {
    fn export_signed_batch(&self, keys: &[ExportedKey]) -> Result<Vec<u8>, ExportError>;
}

// ============================================================================
// PUBLISHED STATE
// ============================================================================

/// What the advertiser is doing, as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisingState {
    Stopped,
    Started {
        key_hex: String,
        key_interval: Interval,
        rpi_hex: String,
        rpi_interval: Interval,
    },
    Error(String),
}

impl std::fmt::Display for AdvertisingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Started {
                rpi_hex,
                rpi_interval,
                ..
            } => write!(f, "Advertising {} (interval {})", rpi_hex, rpi_interval),
            Self::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}

struct Rotation {
    advertiser: BleAdvertiser,
    schedule: Option<KeySchedule>,
}

// ============================================================================
// PROXIMITY SERVICE
// ============================================================================

pub struct ProximityService {
    config: ServiceConfig,
    clock: RotationClock,
    known_keys: KnownKeyStore,
    rotation: Mutex<Rotation>,
    scanner: Mutex<BleScanner>,
    advertising_tx: watch::Sender<AdvertisingState>,
    scan_tx: watch::Sender<Vec<ResolvedAdvertisement>>,
}

impl ProximityService {
    pub fn new(
        peripheral: Arc<dyn BlePeripheral>,
        central: Arc<dyn BleCentral>,
        clock: Arc<dyn Clock>,
        known_keys: KnownKeyStore,
        config: ServiceConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let advertiser = BleAdvertiser::new(peripheral, config.advertise_settings());
        let scanner = BleScanner::new(central, clock.clone(), config.scan_settings());
        let (advertising_tx, _) = watch::channel(AdvertisingState::Stopped);
        let (scan_tx, _) = watch::channel(Vec::new());

        Ok(Self {
            config,
            clock: RotationClock::new(clock),
            known_keys,
            rotation: Mutex::new(Rotation {
                advertiser,
                schedule: None,
            }),
            scanner: Mutex::new(scanner),
            advertising_tx,
            scan_tx,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn known_keys(&self) -> &KnownKeyStore {
        &self.known_keys
    }

    pub fn advertising_state(&self) -> watch::Receiver<AdvertisingState> {
        self.advertising_tx.subscribe()
    }

    /// Working table snapshots, most recent first
    pub fn scan_results(&self) -> watch::Receiver<Vec<ResolvedAdvertisement>> {
        self.scan_tx.subscribe()
    }

    fn now_interval(&self) -> Interval {
        self.clock.current_interval()
    }

    fn publish_advertising(&self, state: AdvertisingState) {
        self.advertising_tx.send_replace(state);
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    async fn restart(
        &self,
        advertiser: &mut BleAdvertiser,
        schedule: &KeySchedule,
    ) -> Result<AdvertisementPayload, AdvertiserError> {
        match advertiser
            .start(schedule.key(), schedule.interval(), self.config.tx_power)
            .await
        {
            Ok(payload) => {
                self.publish_advertising(AdvertisingState::Started {
                    key_hex: schedule.key().secret_hex(),
                    key_interval: schedule.key().rolling_start(),
                    rpi_hex: payload.identifier.to_hex(),
                    rpi_interval: schedule.interval(),
                });
                Ok(payload)
            }
            Err(e) => {
                self.publish_advertising(AdvertisingState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Start advertising for the current interval, generating a key first if
    /// none exists or the held one belongs to another rolling period
    pub async fn start_advertising(&self) -> Result<AdvertisementPayload, AdvertiserError> {
        let now = self.now_interval();
        let mut rotation = self.rotation.lock().await;
        let Rotation {
            advertiser,
            schedule,
        } = &mut *rotation;

        let mut generated = false;
        let schedule = schedule.get_or_insert_with(|| {
            generated = true;
            KeySchedule::generate(&mut OsRng, now)
        });
        if generated {
            tracing::info!(
                rolling_start = %schedule.key().rolling_start(),
                "Generated temporary key"
            );
        } else {
            schedule.tick(&mut OsRng, now);
        }

        self.restart(advertiser, schedule).await
    }

    /// Re-evaluate protocol time. Restarts the advertisement when the
    /// interval moved, replacing the key first on an epoch boundary. Does
    /// nothing while advertising is stopped or failed.
    pub async fn on_tick(&self) -> Result<TickOutcome, AdvertiserError> {
        let now = self.now_interval();
        let mut rotation = self.rotation.lock().await;
        tracing::debug!(interval = %now, "Rotation tick");

        let Rotation {
            advertiser,
            schedule,
        } = &mut *rotation;
        if !advertiser.is_advertising() {
            return Ok(TickOutcome::Unchanged);
        }
        let Some(schedule) = schedule.as_mut() else {
            return Ok(TickOutcome::Unchanged);
        };

        let outcome = schedule.tick(&mut OsRng, now);
        if let TickOutcome::NewInterval { interval, .. } = outcome {
            tracing::debug!(interval = %interval, "Interval changed; restarting advertiser");
            self.restart(advertiser, schedule).await?;
        }
        Ok(outcome)
    }

    /// Stop advertising. The key is kept for a later restart.
    pub async fn stop_advertising(&self) {
        let mut rotation = self.rotation.lock().await;
        rotation.advertiser.stop().await;
        self.publish_advertising(AdvertisingState::Stopped);
    }

    /// Tick every `tick_period_secs` until `shutdown` completes, then stop
    /// advertising
    pub async fn run_rotation<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick().await {
                        tracing::warn!(error = %e, "Advertiser restart failed on rotation");
                    }
                }
            }
        }

        self.stop_advertising().await;
        tracing::info!("Rotation loop stopped");
    }

    /// Export form of the current key, if one exists
    pub async fn current_key(&self) -> Option<ExportedKey> {
        let rotation = self.rotation.lock().await;
        rotation.schedule.as_ref().map(|s| s.key().export())
    }

    /// Hand the current key to `exporter` and return its signed batch
    pub async fn export_current_key(
        &self,
        exporter: &dyn KeyBatchExporter,
    ) -> Result<Vec<u8>, ExportError> {
        let key = self.current_key().await.ok_or(ExportError::NoKey)?;
        let batch = exporter.export_signed_batch(&[key])?;
        tracing::info!(bytes = batch.len(), "Exported current key");
        Ok(batch)
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Scan until `shutdown` completes, the session is stopped or the
    /// platform fails. Each advertisement is resolved against the latest
    /// known-key snapshot and recorded in the working table, and the table is
    /// republished. Silent devices are swept out once a second.
    ///
    /// A `shutdown` that has already completed ends the scan right after it
    /// starts, so a stop requested before this task first runs is not lost.
    pub async fn run_scanner<F>(&self, shutdown: F) -> Result<(), ScannerError>
    where
        F: Future<Output = ()>,
    {
        let mut stream = {
            let mut scanner = self.scanner.lock().await;
            scanner.start().await?
        };
        let mut table = ScanTable::new(self.config.scan_retention());
        let mut sweep = tokio::time::interval(EVICTION_SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.stop_scanning().await;
                    break;
                }
                item = stream.next() => {
                    let Some(item) = item else { break };
                    let advertisement = item?;
                    let resolved =
                        MatchResolver::resolve(&self.known_keys.snapshot(), advertisement);
                    table.record(resolved, self.clock.now());
                    self.scan_tx.send_replace(table.snapshot());
                }
                _ = sweep.tick() => {
                    if table.evict_expired(self.clock.now()) > 0 {
                        self.scan_tx.send_replace(table.snapshot());
                    }
                }
            }
        }

        tracing::info!("Scan loop stopped");
        Ok(())
    }

    pub async fn stop_scanning(&self) {
        self.scanner.lock().await.stop();
    }

    /// Stop both roles. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.stop_scanning().await;
        self.stop_advertising().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{KeyImport, KnownKeyTable};
    use crate::rotation::{epoch_start, ManualClock, ROLLING_PERIOD};
    use crate::transport::abstraction::BleError;
    use crate::transport::ble::LoopbackAir;
    use std::time::Duration;

    // 2020-04-02T00:00:00Z, an epoch start
    const T0: u64 = 1585785600;

    fn service(air: &LoopbackAir, clock: Arc<ManualClock>) -> ProximityService {
        ProximityService::new(
            Arc::new(air.peripheral(-50)),
            Arc::new(air.central()),
            clock,
            KnownKeyStore::default(),
            ServiceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let air = LoopbackAir::new();
        let result = ProximityService::new(
            Arc::new(air.peripheral(-50)),
            Arc::new(air.central()),
            Arc::new(ManualClock::at_unix_secs(T0)),
            KnownKeyStore::default(),
            ServiceConfig {
                tick_period_secs: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::InvalidTickPeriod(0))));
    }

    #[tokio::test]
    async fn test_start_advertising_publishes_state() {
        let air = LoopbackAir::new();
        let clock = Arc::new(ManualClock::at_unix_secs(T0 + 1800));
        let service = service(&air, clock);
        let state = service.advertising_state();

        let payload = service.start_advertising().await.unwrap();

        match &*state.borrow() {
            AdvertisingState::Started {
                key_interval,
                rpi_hex,
                rpi_interval,
                ..
            } => {
                assert_eq!(*key_interval, Interval::new(2642976));
                assert_eq!(*rpi_interval, Interval::new(2642979));
                assert_eq!(rpi_hex, &payload.identifier.to_hex());
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(air.active_broadcasts(), vec![payload.to_service_data().to_vec()]);
    }

    #[tokio::test]
    async fn test_tick_within_interval_is_noop() {
        let air = LoopbackAir::new();
        let clock = Arc::new(ManualClock::at_unix_secs(T0));
        let service = service(&air, clock.clone());
        service.start_advertising().await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert_eq!(service.on_tick().await.unwrap(), TickOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_tick_rotates_identifier_and_key() {
        let air = LoopbackAir::new();
        let clock = Arc::new(ManualClock::at_unix_secs(T0));
        let service = service(&air, clock.clone());
        let first = service.start_advertising().await.unwrap();
        let first_key = service.current_key().await.unwrap();

        clock.advance(Duration::from_secs(600));
        let outcome = service.on_tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::NewInterval {
                interval: Interval::new(2642977),
                key_rotated: false
            }
        );
        let broadcasts = air.active_broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_ne!(broadcasts[0], first.to_service_data().to_vec());
        assert_eq!(service.current_key().await.unwrap(), first_key);

        clock.advance(Duration::from_secs(600 * u64::from(ROLLING_PERIOD)));
        let outcome = service.on_tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::NewInterval {
                key_rotated: true,
                ..
            }
        ));
        let rotated = service.current_key().await.unwrap();
        assert_ne!(rotated.key_data, first_key.key_data);
        assert_eq!(
            rotated.rolling_start_interval_number,
            epoch_start(Interval::new(2642977 + 144)).value()
        );
    }

    #[tokio::test]
    async fn test_tick_while_stopped_does_nothing() {
        let air = LoopbackAir::new();
        let clock = Arc::new(ManualClock::at_unix_secs(T0));
        let service = service(&air, clock.clone());
        service.start_advertising().await.unwrap();
        service.stop_advertising().await;

        clock.advance(Duration::from_secs(3600));
        assert_eq!(service.on_tick().await.unwrap(), TickOutcome::Unchanged);
        assert!(air.active_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_peripheral_reports_error_state() {
        let air = LoopbackAir::new();
        let service = ProximityService::new(
            Arc::new(air.unsupported_peripheral()),
            Arc::new(air.central()),
            Arc::new(ManualClock::at_unix_secs(T0)),
            KnownKeyStore::default(),
            ServiceConfig::default(),
        )
        .unwrap();

        assert_eq!(
            service.start_advertising().await,
            Err(AdvertiserError::Unsupported)
        );
        assert!(matches!(
            &*service.advertising_state().borrow(),
            AdvertisingState::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_restart_after_failure_keeps_key() {
        let air = LoopbackAir::new();
        let peripheral = Arc::new(air.peripheral(-50));
        peripheral.fail_next_start(BleError::AdvertiseFailed(1));
        let service = ProximityService::new(
            peripheral,
            Arc::new(air.central()),
            Arc::new(ManualClock::at_unix_secs(T0)),
            KnownKeyStore::default(),
            ServiceConfig::default(),
        )
        .unwrap();

        assert!(service.start_advertising().await.is_err());
        let key = service.current_key().await.unwrap();
        service.start_advertising().await.unwrap();
        assert_eq!(service.current_key().await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_export_current_key() {
        let air = LoopbackAir::new();
        let service = service(&air, Arc::new(ManualClock::at_unix_secs(T0)));

        let exporter = MockKeyBatchExporter::new();
        assert_eq!(
            service.export_current_key(&exporter).await,
            Err(ExportError::NoKey)
        );

        service.start_advertising().await.unwrap();
        let mut exporter = MockKeyBatchExporter::new();
        exporter
            .expect_export_signed_batch()
            .withf(|keys| keys.len() == 1 && keys[0].rolling_period == 144)
            .times(1)
            .returning(|_| Ok(vec![1, 2, 3]));
        assert_eq!(
            service.export_current_key(&exporter).await,
            Ok(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_scanner_resolves_known_key() {
        let air = LoopbackAir::new();
        let clock = Arc::new(ManualClock::at_unix_secs(T0));

        let sender = Arc::new(service(&air, clock.clone()));
        sender.start_advertising().await.unwrap();
        let exported = sender.current_key().await.unwrap();

        let store = KnownKeyStore::new(KnownKeyTable::from_entries(vec![KeyImport::from_exported(
            &exported,
        )
        .unwrap()
        .with_label("Alice")
        .into_entry(Interval::new(0))
        .unwrap()]));
        let receiver = Arc::new(
            ProximityService::new(
                Arc::new(air.peripheral(-70)),
                Arc::new(air.central()),
                clock,
                store,
                ServiceConfig::default(),
            )
            .unwrap(),
        );

        let mut results = receiver.scan_results();
        let scanning = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.run_scanner(std::future::pending()).await }
        });
        while air.listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        air.pulse();

        results.changed().await.unwrap();
        let snapshot = results.borrow().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].label(), Some("Alice"));
        assert_eq!(snapshot[0].matched.as_ref().unwrap().metadata.tx_power, -42);

        receiver.stop().await;
        assert_eq!(scanning.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_scan_failure_is_terminal() {
        let air = LoopbackAir::new();
        let service = Arc::new(service(&air, Arc::new(ManualClock::at_unix_secs(T0))));

        let scanning = tokio::spawn({
            let service = service.clone();
            async move { service.run_scanner(std::future::pending()).await }
        });
        while air.listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        air.fail_scans(BleError::ScanFailed(2));

        assert_eq!(
            scanning.await.unwrap(),
            Err(ScannerError::ScanFailed(BleError::ScanFailed(2)))
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_scanner_runs_is_not_lost() {
        let air = LoopbackAir::new();
        let service = Arc::new(service(&air, Arc::new(ManualClock::at_unix_secs(T0))));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let scanning = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .run_scanner(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            }
        });
        shutdown_tx.send(()).unwrap();
        service.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(2), scanning)
            .await
            .expect("scan loop should end after shutdown");
        assert_eq!(result.unwrap(), Ok(()));
        assert_eq!(air.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_devices_age_out_without_new_sightings() {
        let air = LoopbackAir::new();
        let clock = Arc::new(ManualClock::at_unix_secs(T0));
        let sender = service(&air, clock.clone());
        sender.start_advertising().await.unwrap();

        let receiver = Arc::new(service(&air, clock.clone()));
        let mut results = receiver.scan_results();
        let scanning = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.run_scanner(std::future::pending()).await }
        });
        while air.listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        air.pulse();
        results.changed().await.unwrap();
        assert_eq!(results.borrow_and_update().len(), 1);

        // Nothing more is heard; the sweep alone empties the table
        clock.advance(Duration::from_secs(31));
        tokio::time::timeout(Duration::from_secs(3), results.changed())
            .await
            .expect("sweep should republish")
            .unwrap();
        assert!(results.borrow().is_empty());

        receiver.stop().await;
        assert_eq!(scanning.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let air = LoopbackAir::new();
        let service = service(&air, Arc::new(ManualClock::at_unix_secs(T0)));
        service.stop().await;
        service.start_advertising().await.unwrap();
        service.stop().await;
        service.stop().await;
        assert_eq!(*service.advertising_state().borrow(), AdvertisingState::Stopped);
        assert!(air.active_broadcasts().is_empty());
    }
}
