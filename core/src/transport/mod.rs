// Transport module: platform BLE capabilities and the EN radio path

pub mod abstraction;
pub mod ble;

pub use abstraction::{
    AdvertiseData, AdvertiseMode, AdvertiseSettings, AdvertiseTxLevel, BleCentral, BleError,
    BlePeripheral, CallbackType, RawAdvertisement, ScanEvent, ScanMode, ScanSettings,
    EN_SERVICE_UUID,
};
pub use ble::{
    Advertisement, AdvertisementPayload, AdvertisementStream, AdvertiserError, AdvertiserState,
    BleAdvertiser, BleScanner, LoopbackAir, LoopbackCentral, LoopbackPeripheral, Observation,
    ScanTable, ScannerError, ScannerState, DEFAULT_SCAN_RETENTION, SERVICE_DATA_LENGTH,
};
