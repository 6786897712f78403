//! Fuzz target: persisted configuration documents
//!
//! Stores arbitrary bytes as the configuration blob and drives
//! `ConfigStore::begin` / `reload`, verifying:
//! - No panics under arbitrary blobs
//! - `reload` of a blob that fails to parse or validate leaves the
//!   previous snapshot untouched
//!
//! cargo fuzz run fuzz_config_document

#![no_main]

use std::sync::Arc;

use aeroenv::adapters::hardware::SimHardware;
use aeroenv::adapters::nvs::NvsStorage;
use aeroenv::app::config_store::{CONFIG_KEY, ConfigStore, NAMESPACE};
use aeroenv::app::ports::StoragePort;
use aeroenv::device::{DeviceCapability, EnvironmentalDevice};
use aeroenv::events::EventBus;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let capability: Arc<dyn DeviceCapability> =
        Arc::new(EnvironmentalDevice::new(Arc::new(SimHardware::new())));
    let mut nvs = NvsStorage::new();
    let store = ConfigStore::new(
        Box::new(nvs.clone()),
        Some(capability),
        Arc::new(EventBus::new()),
    );

    // First boot on a clean partition always succeeds with defaults.
    store.begin().unwrap();
    let before = store.snapshot();

    if nvs.write(NAMESPACE, CONFIG_KEY, data).is_err() {
        return;
    }
    match store.reload() {
        Ok(report) => assert!(report.is_valid()),
        Err(_) => assert_eq!(store.snapshot(), before, "failed reload replaced the snapshot"),
    }
});
