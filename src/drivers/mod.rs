//! Actuator drivers, raw peripheral access, and task helpers.
//!
//! Every actuator implements [`Actuator`].  Drivers are internally
//! synchronised (`&self` methods) so the
//! [`ActuatorManager`](crate::managers::actuator::ActuatorManager) can call
//! them from its maintenance task, bus handlers and the emergency path
//! without holding its registry lock across hardware I/O or publishes.

#[cfg(target_os = "espidf")]
pub mod hw_init;
pub mod nozzle;
pub mod pwm;
pub mod relay;
pub mod task_pin;

use std::sync::Arc;
use std::time::Duration;

use log::error;

use crate::app::events::{Payload, topics};
use crate::app::ports::HardwarePort;
use crate::config::ActuatorConfig;
use crate::error::ActuatorError;
use crate::events::EventBus;

pub trait Actuator: Send + Sync {
    fn config(&self) -> &ActuatorConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Configured kind, e.g. `"Relay"`.
    fn kind(&self) -> &str {
        &self.config().kind
    }

    /// Configure the output pins and drive the inactive level.
    fn begin(&self) -> Result<(), ActuatorError>;

    fn activate(&self) -> Result<(), ActuatorError>;

    fn deactivate(&self) -> Result<(), ActuatorError>;

    /// Force the safe state immediately, abandoning any timed sequence.
    fn emergency_stop(&self) -> Result<(), ActuatorError> {
        self.deactivate()
    }

    fn is_active(&self) -> bool;

    fn is_ready(&self) -> bool;

    /// Periodic maintenance hook for time-based behaviour.
    fn update(&self) {}

    /// Activate for `duration`, then deactivate.
    fn pulse(&self, _duration: Duration) -> Result<(), ActuatorError> {
        Err(ActuatorError::Unsupported("pulse"))
    }

    /// Set a continuous output level in percent.
    fn set_level(&self, _percent: f32) -> Result<(), ActuatorError> {
        Err(ActuatorError::Unsupported("set_level"))
    }

    /// Current output level in percent, for level-type outputs.
    fn level(&self) -> Option<f32> {
        None
    }

    fn shutdown(&self) {
        if let Err(e) = self.emergency_stop() {
            error!("Actuator '{}' shutdown: {e}", self.name());
        }
    }
}

/// Hardware and bus handles shared by every actuator driver.
#[derive(Clone)]
pub struct DriverContext {
    pub hw: Arc<dyn HardwarePort>,
    pub bus: Arc<EventBus>,
}

impl DriverContext {
    pub fn new(hw: Arc<dyn HardwarePort>, bus: Arc<EventBus>) -> Self {
        Self { hw, bus }
    }

    /// Publish a failed write as `actuator.error` and hand the error back.
    pub(crate) fn write_failed(&self, name: &str, err: ActuatorError) -> ActuatorError {
        error!("Actuator '{name}': {err}");
        self.bus.publish_new(
            topics::ACTUATOR_ERROR,
            name,
            Payload::error(name, err.to_string()),
        );
        err
    }

    pub(crate) fn announce(&self, name: &str, topic: &str, payload: Payload) {
        self.bus.publish_new(topic, name, payload);
    }
}
