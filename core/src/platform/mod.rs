//! Platform integration layer
//!
//! This module provides:
//! - The proximity service platform code creates and drives
//! - Validated service configuration
//! - The key batch export capability implemented by the embedding app

pub mod service;
pub mod settings;

pub use service::{AdvertisingState, ExportError, KeyBatchExporter, ProximityService};
pub use settings::{ConfigError, ServiceConfig, DEFAULT_TX_POWER, MAX_TICK_PERIOD_SECS};
