//! Durable configuration stores.
//!
//! Two [`ConfigStore`] implementations:
//!
//! - [`MemoryConfigStore`] keeps values in a map, for tests and dry runs.
//! - [`TomlConfigStore`] keeps an autosave TOML file with one table per
//!   section. The file is read back by
//!   [`AutoZConfig::load_with_state`](crate::config::AutoZConfig::load_with_state),
//!   so a calibrated value survives a restart.
//!
//! Numeric values are written as TOML floats so the state file deserializes
//! straight into the config struct.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{AppResult, AutoZError};
use crate::hardware::capabilities::ConfigStore;

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn set(&self, section: &str, key: &str, value: &str) -> AppResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| AutoZError::Configuration("config store lock poisoned".into()))?;
        values.insert((section.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn get(&self, section: &str, key: &str) -> AppResult<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| AutoZError::Configuration("config store lock poisoned".into()))?;
        Ok(values
            .get(&(section.to_string(), key.to_string()))
            .cloned())
    }
}

/// Autosave TOML file store.
#[derive(Debug)]
pub struct TomlConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlConfigStore {
    /// Store backed by `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> AppResult<toml::Table> {
        if !self.path.exists() {
            return Ok(toml::Table::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        contents.parse::<toml::Table>().map_err(|err| {
            AutoZError::Configuration(format!(
                "cannot parse state file {}: {}",
                self.path.display(),
                err
            ))
        })
    }
}

impl ConfigStore for TomlConfigStore {
    fn set(&self, section: &str, key: &str, value: &str) -> AppResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AutoZError::Configuration("config store lock poisoned".into()))?;
        let mut table = self.read_table()?;

        let entry = table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let toml::Value::Table(section_table) = entry else {
            return Err(AutoZError::Configuration(format!(
                "state file entry '{}' is not a table",
                section
            )));
        };
        let stored = match value.parse::<f64>() {
            Ok(number) if number.is_finite() => toml::Value::Float(number),
            _ => toml::Value::String(value.to_string()),
        };
        section_table.insert(key.to_string(), stored);

        let contents = toml::to_string(&table)
            .map_err(|err| AutoZError::Configuration(format!("cannot encode state: {}", err)))?;
        fs::write(&self.path, contents)?;
        debug!(path = %self.path.display(), section, key, value, "state saved");
        Ok(())
    }

    fn get(&self, section: &str, key: &str) -> AppResult<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AutoZError::Configuration("config store lock poisoned".into()))?;
        let table = self.read_table()?;
        let value = table
            .get(section)
            .and_then(|s| s.get(key))
            .map(|v| match v {
                toml::Value::String(s) => s.clone(),
                toml::Value::Float(f) => format!("{:.6}", f),
                other => other.to_string(),
            });
        Ok(value)
    }
}
