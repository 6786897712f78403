//! Device capability: the factory and rulebook for one hardware variant.
//!
//! ```text
//!   ConfigStore ──validate──▶ DeviceCapability ◀──create── SensorManager
//!                                    ▲                     ActuatorManager
//!                                    └──────── defaults ─── ConfigStore::begin
//! ```
//!
//! Managers stay device-agnostic: every concrete sensor or actuator they own
//! comes out of [`DeviceCapability::create_sensor`] /
//! [`DeviceCapability::create_actuator`], and every device-specific config
//! rule lives in the `validate_*` methods.  Exactly one provider is active in
//! a running image.

pub mod environmental;

use std::sync::Arc;

use crate::config::{ActuatorConfig, SafetyConfig, SensorConfig};
use crate::drivers::Actuator;
use crate::error::{ActuatorError, SensorError};
use crate::events::EventBus;
use crate::sensors::Sensor;

pub use environmental::EnvironmentalDevice;

pub trait DeviceCapability: Send + Sync {
    /// Short machine identifier, e.g. `"environmental"`.
    fn device_type(&self) -> &str;

    /// Human-readable product name.
    fn device_name(&self) -> &str;

    fn firmware_version(&self) -> &str;

    fn supported_sensor_kinds(&self) -> &[&'static str];

    fn supported_actuator_kinds(&self) -> &[&'static str];

    /// Build a sensor for `config.kind`.  Unknown kinds are an error, never
    /// a placeholder object.
    fn create_sensor(&self, config: &SensorConfig) -> Result<Box<dyn Sensor>, SensorError>;

    /// Build an actuator for `config.kind`, wired to `bus` for its outcome
    /// events.
    fn create_actuator(
        &self,
        config: &ActuatorConfig,
        bus: &Arc<EventBus>,
    ) -> Result<Arc<dyn Actuator>, ActuatorError>;

    /// Device-specific sensor rules; `Err` carries a one-line reason.
    fn validate_sensor(&self, config: &SensorConfig) -> Result<(), String>;

    fn validate_actuator(&self, config: &ActuatorConfig) -> Result<(), String>;

    /// Topics this device publishes beyond the common set.
    fn event_topics(&self) -> Vec<String>;

    /// Sensors written into a fresh configuration.
    fn default_sensors(&self) -> Vec<SensorConfig>;

    fn default_actuators(&self) -> Vec<ActuatorConfig>;

    fn default_safety(&self) -> SafetyConfig {
        SafetyConfig::default()
    }

    fn supports_sensor(&self, kind: &str) -> bool {
        self.supported_sensor_kinds().contains(&kind)
    }

    fn supports_actuator(&self, kind: &str) -> bool {
        self.supported_actuator_kinds().contains(&kind)
    }
}
