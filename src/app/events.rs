//! Events carried by the [`EventBus`](crate::events::EventBus).
//!
//! Every event has a dot-hierarchical topic under one of the stable
//! prefixes (`sensor.`, `actuator.`, `system.`, `command.`, `config.`), the
//! name of the component that produced it, a typed [`Payload`] and a
//! monotonic timestamp.  Events are immutable once built.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::app::commands::{Command, StatusConfirmation};
use crate::diagnostics::RuntimeMetrics;

// ───────────────────────────────────────────────────────────────
// Topic namespace
// ───────────────────────────────────────────────────────────────

pub mod topics {
    pub const SENSOR_TEMPERATURE: &str = "sensor.temperature";
    pub const SENSOR_HUMIDITY: &str = "sensor.humidity";
    pub const SENSOR_PRESSURE: &str = "sensor.pressure";
    pub const SENSOR_ERROR: &str = "sensor.error";

    pub const ACTUATOR_ACTIVATED: &str = "actuator.activated";
    pub const ACTUATOR_DEACTIVATED: &str = "actuator.deactivated";
    pub const ACTUATOR_ERROR: &str = "actuator.error";

    // Intents published by the CommandHandler.
    pub const ACTUATOR_RELAY_SET: &str = "actuator.relay.set";
    pub const ACTUATOR_RELAY_TOGGLE: &str = "actuator.relay.toggle";
    pub const ACTUATOR_SPRAY_START: &str = "actuator.spray.start";
    pub const ACTUATOR_SPRAY_STOP: &str = "actuator.spray.stop";
    pub const ACTUATOR_NOZZLE_ACTIVATE: &str = "actuator.nozzle.activate";

    // Venturi nozzle phase transitions.
    pub const NOZZLE_AIR_OPEN: &str = "actuator.nozzle.air.open";
    pub const NOZZLE_NUTRIENT_OPEN: &str = "actuator.nozzle.nutrient.open";
    pub const NOZZLE_NUTRIENT_CLOSE: &str = "actuator.nozzle.nutrient.close";
    pub const NOZZLE_AIR_CLOSE: &str = "actuator.nozzle.air.close";

    pub const SYSTEM_STARTUP: &str = "system.startup";
    pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";
    pub const SYSTEM_ERROR: &str = "system.error";
    pub const SYSTEM_METRICS: &str = "system.metrics";
    pub const SYSTEM_SAFETY: &str = "system.safety";
    pub const SYSTEM_EMERGENCY: &str = "system.emergency";

    pub const COMMAND_RECEIVED: &str = "command.received";
    pub const COMMAND_STATUS: &str = "command.status";

    pub const CONFIG_CHANGED: &str = "config.changed";
    pub const CONFIG_SAVED: &str = "config.saved";
    pub const CONFIG_RELOADED: &str = "config.reloaded";

    /// Prefixes a topic may start with.
    pub const NAMESPACES: [&str; 5] = ["sensor", "actuator", "system", "command", "config"];

    /// `sensor.<kind>` for a reading kind such as `"temperature"`.
    pub fn sensor(kind: &str) -> String {
        format!("sensor.{kind}")
    }

    /// Whether `topic` is a well-formed, namespaced topic.
    ///
    /// Segments are non-empty and made of `[a-z0-9_]`.
    pub fn is_valid(topic: &str) -> bool {
        let mut segments = topic.split('.');
        let Some(head) = segments.next() else {
            return false;
        };
        if !NAMESPACES.contains(&head) {
            return false;
        }
        let mut rest = 0;
        for segment in segments {
            if segment.is_empty()
                || !segment
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
            {
                return false;
            }
            rest += 1;
        }
        rest > 0
    }
}

// ───────────────────────────────────────────────────────────────
// Payload
// ───────────────────────────────────────────────────────────────

/// Typed event payload.  The bus never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Empty,
    /// A valid sensor measurement.
    Reading {
        sensor: String,
        value: f32,
        unit: String,
        timestamp_ms: u64,
    },
    /// Outcome of an actuator state change.
    ActuatorState {
        name: String,
        active: bool,
        /// Elapsed active time, set on deactivation of timed outputs.
        duration_ms: Option<u64>,
        /// PWM duty in percent, set for level outputs.
        level: Option<f32>,
    },
    /// Intent to set (`state = Some`) or toggle (`state = None`) an actuator.
    ActuatorCommand { name: String, state: Option<bool> },
    /// Intent to start/stop spraying; `nozzle` is a 1-based index or a name.
    Spray { nozzle: Option<String> },
    /// A nozzle phase transition.
    Nozzle { name: String, phase: String },
    Command(Command),
    Status(StatusConfirmation),
    Metrics(RuntimeMetrics),
    /// A safety-limit violation or health alarm.
    Alarm {
        source: String,
        message: String,
        value: Option<f32>,
        limit: Option<f32>,
    },
    Error { component: String, message: String },
    /// Emergency-stop request or notice.
    Emergency { reason: String },
    Config { section: String },
}

impl Payload {
    pub fn error(component: &str, message: impl Into<String>) -> Self {
        Self::Error {
            component: component.to_owned(),
            message: message.into(),
        }
    }

    pub fn actuator_state(name: &str, active: bool) -> Self {
        Self::ActuatorState {
            name: name.to_owned(),
            active,
            duration_ms: None,
            level: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Event
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Event {
    topic: String,
    source: String,
    payload: Payload,
    timestamp: Instant,
}

impl Event {
    /// Build an event stamped with the current instant.
    pub fn new(topic: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            source: source.into(),
            payload,
            timestamp: Instant::now(),
        }
    }

    /// The dot-hierarchical topic, e.g. `"sensor.temperature"`.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}
