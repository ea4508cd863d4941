// Known-key file for the entk CLI
//
// Imported keys are kept as a JSON array next to the config. The file is
// rewritten on every change and expanded into a core `KnownKeyTable` when a
// scan starts.

use anyhow::{Context, Result};
use en_toolkit_core::matching::{KeyImport, KnownKeyTable};
use en_toolkit_core::rotation::Interval;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    /// Human-readable device label
    pub label: String,

    /// Hex-encoded 16-byte secret
    pub key_data: String,

    /// First interval of the key's rolling period
    pub rolling_start_interval_number: u32,

    /// When the key was imported (unix timestamp)
    pub added_at: u64,
}

impl StoredKey {
    fn to_import(&self) -> Result<KeyImport> {
        Ok(KeyImport::from_hex(&self.key_data)
            .with_context(|| format!("Stored key '{}' is corrupt", self.label))?
            .with_label(self.label.clone())
            .with_rolling_start(Interval::new(self.rolling_start_interval_number)))
    }
}

pub struct KnownKeyFile {
    path: PathBuf,
    keys: Vec<StoredKey>,
}

impl KnownKeyFile {
    /// Open the key file, starting empty if it does not exist yet
    pub fn open(path: PathBuf) -> Result<Self> {
        let keys = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read known-keys file")?;
            serde_json::from_str(&contents).context("Failed to parse known-keys file")?
        } else {
            Vec::new()
        };
        Ok(Self { path, keys })
    }

    fn save(&self) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(&self.keys).context("Failed to serialize known keys")?;
        std::fs::write(&self.path, contents).context("Failed to write known-keys file")?;
        Ok(())
    }

    pub fn list(&self) -> &[StoredKey] {
        &self.keys
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Forget every stored key and keep only `key`
    pub fn replace(&mut self, key: StoredKey) -> Result<()> {
        self.keys = vec![key];
        self.save()
    }

    pub fn append(&mut self, key: StoredKey) -> Result<()> {
        self.keys.retain(|k| {
            k.key_data != key.key_data
                || k.rolling_start_interval_number != key.rolling_start_interval_number
        });
        self.keys.push(key);
        self.save()
    }

    /// Expand every stored key into a lookup table
    pub fn to_table(&self, current_epoch: Interval) -> Result<KnownKeyTable> {
        let mut entries = Vec::with_capacity(self.keys.len());
        for stored in &self.keys {
            let entry = stored
                .to_import()?
                .into_entry(current_epoch)
                .with_context(|| format!("Stored key '{}' is invalid", stored.label))?;
            entries.push(entry);
        }
        Ok(KnownKeyTable::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(label: &str, byte: u8) -> StoredKey {
        StoredKey {
            label: label.to_string(),
            key_data: hex::encode([byte; 16]),
            rolling_start_interval_number: 2642976,
            added_at: 1585785600,
        }
    }

    #[test]
    fn test_replace_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_keys.json");

        let mut file = KnownKeyFile::open(path.clone()).unwrap();
        file.append(stored("a", 1)).unwrap();
        file.append(stored("b", 2)).unwrap();
        assert_eq!(file.count(), 2);

        // Re-importing the same key replaces its record
        file.append(stored("b renamed", 2)).unwrap();
        assert_eq!(file.count(), 2);

        file.replace(stored("c", 3)).unwrap();
        let reopened = KnownKeyFile::open(path).unwrap();
        assert_eq!(reopened.list(), &[stored("c", 3)]);
    }

    #[test]
    fn test_to_table_expands_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = KnownKeyFile::open(dir.path().join("k.json")).unwrap();
        file.append(stored("a", 1)).unwrap();
        file.append(stored("b", 2)).unwrap();

        let table = file.to_table(Interval::new(0)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.identifier_count(), 288);
        assert_eq!(table.entries()[0].label(), "a");
    }

    #[test]
    fn test_corrupt_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = KnownKeyFile::open(dir.path().join("k.json")).unwrap();
        let mut bad = stored("bad", 1);
        bad.key_data = "abcd".to_string();
        file.append(bad).unwrap();

        let err = file.to_table(Interval::new(0)).unwrap_err();
        assert!(err.to_string().contains("bad"));
    }
}
