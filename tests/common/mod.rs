//! Shared helpers for the integration tests.

#![allow(dead_code)]

use auto_z_offset::config::AutoZConfig;
use auto_z_offset::error::{AppResult, AutoZError};
use auto_z_offset::hardware::capabilities::ConfigStore;
use auto_z_offset::hardware::mock::SimulatedPrinter;
use auto_z_offset::storage::MemoryConfigStore;
use auto_z_offset::AutoZOffset;
use std::sync::Arc;

/// Section every test module instance uses.
pub const SECTION: &str = "auto_z_offset";

/// Store that refuses every write.
#[derive(Debug, Default)]
pub struct FailingStore;

impl ConfigStore for FailingStore {
    fn set(&self, _section: &str, _key: &str, _value: &str) -> AppResult<()> {
        Err(AutoZError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only config",
        )))
    }

    fn get(&self, _section: &str, _key: &str) -> AppResult<Option<String>> {
        Ok(None)
    }
}

/// Assemble a module on `printer` with an in-memory store.
pub fn module_with_memory_store(
    printer: &SimulatedPrinter,
    config: AutoZConfig,
) -> (AutoZOffset, Arc<MemoryConfigStore>) {
    let store = Arc::new(MemoryConfigStore::new());
    let module = AutoZOffset::new(config, printer.collaborators(store.clone()))
        .expect("valid test config");
    (module, store)
}

/// Stored calibrated value, if any.
pub fn stored_offset(store: &dyn ConfigStore) -> Option<String> {
    store
        .get(SECTION, "calibrated_z_offset")
        .expect("store readable")
}

/// `|a - b| < eps`
pub fn approx(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() < eps
}
