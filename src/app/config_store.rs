//! ConfigStore: the single in-memory configuration snapshot and its
//! persistence.
//!
//! The document lives as one JSON blob in a [`StoragePort`] under
//! namespace [`NAMESPACE`], key [`CONFIG_KEY`].  Readers get clones of the
//! current snapshot; writers go through the mutators, which mark the store
//! dirty and announce `config.changed`.
//!
//! `reload` is all-or-nothing: the persisted document must parse *and*
//! validate before it replaces the snapshot.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::app::events::{Payload, topics};
use crate::app::ports::StoragePort;
use crate::config::{
    self, ActuatorConfig, DeviceConfig, NetworkConfig, SafetyConfig, SensorConfig, ValidationResult,
};
use crate::device::DeviceCapability;
use crate::error::ConfigError;
use crate::events::EventBus;
use crate::managers::{Lifecycle, ManagerState};

pub const NAMESPACE: &str = "aeroenv";
pub const CONFIG_KEY: &str = "config";

const SOURCE: &str = "ConfigStore";

pub struct ConfigStore {
    storage: Mutex<Box<dyn StoragePort>>,
    config: RwLock<DeviceConfig>,
    dirty: Mutex<bool>,
    capability: Option<Arc<dyn DeviceCapability>>,
    lifecycle: Lifecycle,
}

impl ConfigStore {
    pub fn new(
        storage: Box<dyn StoragePort>,
        capability: Option<Arc<dyn DeviceCapability>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            storage: Mutex::new(storage),
            config: RwLock::new(DeviceConfig::default()),
            dirty: Mutex::new(false),
            capability,
            lifecycle: Lifecycle::new(SOURCE, bus),
        }
    }

    /// Open storage and load the persisted document, writing a default one
    /// on first boot or when the stored blob is unreadable.
    pub fn begin(&self) -> Result<(), ConfigError> {
        self.lifecycle
            .transition(ManagerState::Initializing)
            .map_err(|_| ConfigError::NotInitialized)?;

        if let Err(e) = self.storage.lock().init() {
            self.lifecycle.fail(format!("storage init failed: {e}"));
            return Err(e.into());
        }

        match self.load() {
            Ok(_) => {}
            Err(ConfigError::Invalid(errors)) => return Err(ConfigError::Invalid(errors)),
            Err(e) => {
                warn!("ConfigStore: {e}, writing defaults");
                *self.config.write() = self.defaults();
                *self.dirty.lock() = true;
                if let Err(e) = self.persist() {
                    self.lifecycle.fail(format!("saving default configuration failed: {e}"));
                    return Err(e);
                }
                let report = self.validate();
                for w in &report.warnings {
                    warn!("ConfigStore: {w}");
                }
                if !report.is_valid() {
                    self.lifecycle.fail(report.errors.join("; "));
                    return Err(ConfigError::Invalid(report.errors));
                }
            }
        }

        self.lifecycle
            .transition(ManagerState::Ready)
            .map_err(|_| ConfigError::NotInitialized)?;
        info!(
            "ConfigStore ready: {} sensors, {} actuators",
            self.config.read().sensors.len(),
            self.config.read().actuators.len()
        );
        Ok(())
    }

    /// Replace the snapshot with the persisted document and validate it.
    ///
    /// A document that parses is committed even if it fails validation; the
    /// store then enters `Error` and the error list is returned.
    pub fn load(&self) -> Result<ValidationResult, ConfigError> {
        let doc = self.read_document()?;
        *self.config.write() = doc;
        *self.dirty.lock() = false;
        self.check_committed()
    }

    /// Write the snapshot to storage and clear the dirty flag.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.persist()?;
        self.announce(topics::CONFIG_SAVED, "all");
        Ok(())
    }

    /// Re-read the persisted document, replacing the snapshot only when the
    /// new document parses and validates.
    pub fn reload(&self) -> Result<ValidationResult, ConfigError> {
        let doc = self.read_document()?;
        let report = config::validate(&doc, self.capability.as_deref());
        if !report.is_valid() {
            warn!("ConfigStore: reload rejected, keeping current snapshot");
            return Err(ConfigError::Invalid(report.errors));
        }
        *self.config.write() = doc;
        *self.dirty.lock() = false;
        if self.lifecycle.state() == ManagerState::Error {
            let _ = self.lifecycle.clear_error();
        }
        self.announce(topics::CONFIG_RELOADED, "all");
        Ok(report)
    }

    /// Replace the snapshot with the device defaults and persist them.
    pub fn reset_to_defaults(&self) -> Result<(), ConfigError> {
        *self.config.write() = self.defaults();
        *self.dirty.lock() = true;
        self.announce(topics::CONFIG_CHANGED, "all");
        self.save()
    }

    pub fn validate(&self) -> ValidationResult {
        config::validate(&self.config.read(), self.capability.as_deref())
    }

    // ── Getters ──────────────────────────────────────────────

    pub fn network(&self) -> NetworkConfig {
        self.config.read().network.clone()
    }

    pub fn safety(&self) -> SafetyConfig {
        self.config.read().safety.clone()
    }

    pub fn sensors(&self) -> Vec<SensorConfig> {
        self.config.read().sensors.clone()
    }

    pub fn actuators(&self) -> Vec<ActuatorConfig> {
        self.config.read().actuators.clone()
    }

    pub fn snapshot(&self) -> DeviceConfig {
        self.config.read().clone()
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock()
    }

    pub fn state(&self) -> ManagerState {
        self.lifecycle.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lifecycle.last_error()
    }

    pub fn capability(&self) -> Option<&Arc<dyn DeviceCapability>> {
        self.capability.as_ref()
    }

    /// The document as it would be persisted.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(&*self.config.read()).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    // ── Mutators ─────────────────────────────────────────────

    pub fn set_network(&self, network: NetworkConfig) {
        self.config.write().network = network;
        self.changed("network");
    }

    pub fn set_safety(&self, safety: SafetyConfig) {
        self.config.write().safety = safety;
        self.changed("safety");
    }

    /// Insert or replace (by name) a sensor entry.
    pub fn upsert_sensor(&self, sensor: SensorConfig) {
        {
            let mut cfg = self.config.write();
            match cfg.sensors.iter().position(|s| s.name == sensor.name) {
                Some(i) => cfg.sensors[i] = sensor,
                None => cfg.sensors.push(sensor),
            }
        }
        self.changed("sensors");
    }

    pub fn upsert_actuator(&self, actuator: ActuatorConfig) {
        {
            let mut cfg = self.config.write();
            match cfg.actuators.iter().position(|a| a.name == actuator.name) {
                Some(i) => cfg.actuators[i] = actuator,
                None => cfg.actuators.push(actuator),
            }
        }
        self.changed("actuators");
    }

    pub fn remove_sensor(&self, name: &str) -> bool {
        let removed = {
            let mut cfg = self.config.write();
            let before = cfg.sensors.len();
            cfg.sensors.retain(|s| s.name != name);
            cfg.sensors.len() != before
        };
        if removed {
            self.changed("sensors");
        }
        removed
    }

    pub fn remove_actuator(&self, name: &str) -> bool {
        let removed = {
            let mut cfg = self.config.write();
            let before = cfg.actuators.len();
            cfg.actuators.retain(|a| a.name != name);
            cfg.actuators.len() != before
        };
        if removed {
            self.changed("actuators");
        }
        removed
    }

    // ── Internals ────────────────────────────────────────────

    fn defaults(&self) -> DeviceConfig {
        match &self.capability {
            Some(cap) => DeviceConfig {
                network: NetworkConfig::default(),
                safety: cap.default_safety(),
                sensors: cap.default_sensors(),
                actuators: cap.default_actuators(),
            },
            None => DeviceConfig::default(),
        }
    }

    fn read_document(&self) -> Result<DeviceConfig, ConfigError> {
        let bytes = self.storage.lock().read(NAMESPACE, CONFIG_KEY)?;
        serde_json::from_slice(&bytes).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn persist(&self) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec(&*self.config.read())
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        self.storage.lock().write(NAMESPACE, CONFIG_KEY, &bytes)?;
        *self.dirty.lock() = false;
        info!("ConfigStore: saved ({} bytes)", bytes.len());
        Ok(())
    }

    fn check_committed(&self) -> Result<ValidationResult, ConfigError> {
        let report = self.validate();
        for w in &report.warnings {
            warn!("ConfigStore: {w}");
        }
        if !report.is_valid() {
            self.lifecycle
                .fail(format!("configuration invalid: {}", report.errors.join("; ")));
            return Err(ConfigError::Invalid(report.errors));
        }
        Ok(report)
    }

    fn changed(&self, section: &str) {
        *self.dirty.lock() = true;
        self.announce(topics::CONFIG_CHANGED, section);
    }

    fn announce(&self, topic: &str, section: &str) {
        self.lifecycle.bus().publish_new(
            topic,
            SOURCE,
            Payload::Config {
                section: section.to_owned(),
            },
        );
    }
}
