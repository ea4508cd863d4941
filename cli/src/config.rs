// Configuration management for the entk CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/en-toolkit/config.json
// - Linux: ~/.config/en-toolkit/config.json
// - Windows: %APPDATA%\en-toolkit\config.json

use anyhow::{Context, Result};
use en_toolkit_core::matching::DEFAULT_DEVICE_LABEL;
use en_toolkit_core::ServiceConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Advertise/scan settings handed to the core service
    pub service: ServiceConfig,

    /// Label given to imported keys when none is supplied
    pub default_label: String,

    /// Where imported keys are kept; defaults to the data directory
    pub known_keys_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            default_label: DEFAULT_DEVICE_LABEL.to_string(),
            known_keys_path: None,
        }
    }
}

/// Parse a unit enum variant such as `LowLatency` from its serde name
fn parse_variant<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("Invalid value: {}", value))
}

fn variant_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => name,
        _ => String::from("?"),
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("en-toolkit");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("en-toolkit");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Path of the known-keys file
    pub fn known_keys_file(&self) -> Result<PathBuf> {
        match &self.known_keys_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("known_keys.json")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .service
                .validate()
                .context("Invalid service settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory. The result is validated before it is
    /// accepted.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "tx_power" => {
                next.service.tx_power = value.parse().context("Invalid tx power (dBm)")?;
            }
            "tick_period_secs" => {
                next.service.tick_period_secs = value.parse().context("Invalid number")?;
            }
            "scan_retention_secs" => {
                next.service.scan_retention_secs = value.parse().context("Invalid number")?;
            }
            "advertise_mode" => next.service.advertise_mode = parse_variant(value)?,
            "advertise_tx_level" => next.service.advertise_tx_level = parse_variant(value)?,
            "scan_mode" => next.service.scan_mode = parse_variant(value)?,
            "default_label" => {
                if value.trim().is_empty() {
                    anyhow::bail!("Label cannot be empty");
                }
                next.default_label = value.to_string();
            }
            "known_keys_path" => {
                next.known_keys_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.service.validate()?;
        *self = next;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("tx_power".to_string(), self.service.tx_power.to_string()),
            (
                "tick_period_secs".to_string(),
                self.service.tick_period_secs.to_string(),
            ),
            (
                "scan_retention_secs".to_string(),
                self.service.scan_retention_secs.to_string(),
            ),
            (
                "advertise_mode".to_string(),
                variant_name(&self.service.advertise_mode),
            ),
            (
                "advertise_tx_level".to_string(),
                variant_name(&self.service.advertise_tx_level),
            ),
            ("scan_mode".to_string(), variant_name(&self.service.scan_mode)),
            ("default_label".to_string(), self.default_label.clone()),
            (
                "known_keys_path".to_string(),
                self.known_keys_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }
}
