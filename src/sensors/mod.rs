//! Sensor subsystem: the [`Sensor`] contract and the concrete drivers.
//!
//! Drivers are constructed only through a
//! [`DeviceCapability`](crate::device::DeviceCapability) and are owned
//! exclusively by the [`SensorManager`](crate::managers::sensor::SensorManager).

pub mod pressure;
pub mod sht3x;

use serde::{Deserialize, Serialize};

use crate::adapters::time::uptime_ms;
use crate::config::SensorConfig;
use crate::error::SensorError;

/// A hardware sensor producing one or more measurement channels.
pub trait Sensor: Send {
    fn config(&self) -> &SensorConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Configured kind, e.g. `"SHT3x"`.
    fn kind(&self) -> &str {
        &self.config().kind
    }

    /// Probe and initialise the device.
    fn begin(&mut self) -> Result<(), SensorError>;

    /// Take one measurement.  Always returns one reading per channel;
    /// failed channels come back with `valid = false` and an error message.
    fn read(&mut self) -> Vec<SensorReading>;

    fn is_ready(&self) -> bool;

    fn shutdown(&mut self) {}
}

/// One measurement of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_name: String,
    /// Measured quantity, e.g. `"temperature"`; the event topic suffix.
    pub kind: String,
    pub value: f32,
    pub unit: String,
    pub valid: bool,
    /// Milliseconds since boot.
    pub timestamp_ms: u64,
    pub error_message: Option<String>,
}

impl SensorReading {
    pub fn ok(sensor_name: &str, kind: &str, value: f32, unit: &str) -> Self {
        Self {
            sensor_name: sensor_name.to_owned(),
            kind: kind.to_owned(),
            value,
            unit: unit.to_owned(),
            valid: true,
            timestamp_ms: uptime_ms(),
            error_message: None,
        }
    }

    pub fn failed(sensor_name: &str, kind: &str, unit: &str, error: &SensorError) -> Self {
        Self {
            sensor_name: sensor_name.to_owned(),
            kind: kind.to_owned(),
            value: 0.0,
            unit: unit.to_owned(),
            valid: false,
            timestamp_ms: uptime_ms(),
            error_message: Some(error.to_string()),
        }
    }

    /// Returned for lookups of a sensor that does not exist.
    pub fn not_found(sensor_name: &str) -> Self {
        Self {
            sensor_name: sensor_name.to_owned(),
            kind: String::new(),
            value: 0.0,
            unit: String::new(),
            valid: false,
            timestamp_ms: uptime_ms(),
            error_message: Some("Sensor not found".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_readings_carry_a_message() {
        let r = SensorReading::failed("p", "pressure", "psi", &SensorError::ChecksumMismatch);
        assert!(!r.valid);
        assert_eq!(r.error_message.as_deref(), Some("checksum mismatch"));

        let nf = SensorReading::not_found("ghost");
        assert!(!nf.valid);
        assert_eq!(nf.error_message.as_deref(), Some("Sensor not found"));
    }
}
