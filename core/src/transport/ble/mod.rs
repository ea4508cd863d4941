/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level pieces of the Exposure Notification radio path:
///
/// - **payload**: 20-byte service data layout
/// - **advertiser**: single-payload advertiser over a platform peripheral
/// - **scanner**: filtered scan session producing validated advertisements
/// - **table**: deduplicating, self-aging table of recent sightings
/// - **loopback**: in-process radio for tests and the self-test
///
/// Platform code (Android, iOS, btleplug) only implements the capability
/// traits in `transport::abstraction`. Everything here is testable without
/// BLE hardware.

pub mod advertiser;
pub mod loopback;
pub mod payload;
pub mod scanner;
pub mod table;

pub use advertiser::{AdvertiserError, AdvertiserState, BleAdvertiser};
pub use loopback::{LoopbackAir, LoopbackCentral, LoopbackPeripheral};
pub use payload::{Advertisement, AdvertisementPayload, SERVICE_DATA_LENGTH};
pub use scanner::{AdvertisementStream, BleScanner, ScannerError, ScannerState};
pub use table::{Observation, ScanTable, DEFAULT_SCAN_RETENTION};
