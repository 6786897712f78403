//! Analog pressure transducer (0.5–4.5 V ⇒ 0–1 MPa) on an ADC1 pin.
//!
//! The 12-bit sample is scaled to volts at 3.3 V full scale, mapped
//! linearly onto 0–1 MPa (clamped), and reported in PSI.

use std::sync::Arc;

use log::{info, warn};

use super::{Sensor, SensorReading};
use crate::app::ports::HardwarePort;
use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::pins;

pub const KIND: &str = "AnalogPressure";

const V_MIN: f32 = 0.5;
const V_MAX: f32 = 4.5;
const MPA_FULL_SCALE: f32 = 1.0;
pub const PSI_PER_MPA: f32 = 145.038;
/// Plausible reading window after calibration.
const PSI_RANGE: core::ops::RangeInclusive<f32> = 0.0..=200.0;

const CHANNEL: (&str, &str) = ("pressure", "psi");

pub struct AnalogPressure {
    config: SensorConfig,
    hw: Arc<dyn HardwarePort>,
    ready: bool,
}

impl AnalogPressure {
    pub fn new(config: SensorConfig, hw: Arc<dyn HardwarePort>) -> Self {
        Self {
            config,
            hw,
            ready: false,
        }
    }

    fn sample_psi(&self) -> Result<f32, SensorError> {
        let raw = self.hw.analog_read(self.config.pin)?;
        let psi = self.config.calibrate(raw_to_psi(raw));
        if PSI_RANGE.contains(&psi) {
            Ok(psi)
        } else {
            Err(SensorError::OutOfRange(psi))
        }
    }
}

/// Uncalibrated conversion of a 12-bit sample.
pub fn raw_to_psi(raw: u16) -> f32 {
    let volts = f32::from(raw) / f32::from(pins::ADC_MAX_RAW) * pins::ADC_VREF;
    let mpa = ((volts - V_MIN) / (V_MAX - V_MIN) * MPA_FULL_SCALE).clamp(0.0, MPA_FULL_SCALE);
    mpa * PSI_PER_MPA
}

impl Sensor for AnalogPressure {
    fn config(&self) -> &SensorConfig {
        &self.config
    }

    fn begin(&mut self) -> Result<(), SensorError> {
        // A failed sample here means the channel is unusable.
        self.hw.analog_read(self.config.pin)?;
        self.ready = true;
        info!("Pressure '{}' on GPIO{} ready", self.config.name, self.config.pin);
        Ok(())
    }

    fn read(&mut self) -> Vec<SensorReading> {
        let name = self.config.name.as_str();
        if !self.ready {
            return vec![SensorReading::failed(name, CHANNEL.0, CHANNEL.1, &SensorError::NotInitialized)];
        }
        let reading = match self.sample_psi() {
            Ok(psi) => SensorReading::ok(name, CHANNEL.0, psi, CHANNEL.1),
            Err(e) => {
                warn!("Pressure '{name}': {e}");
                SensorReading::failed(name, CHANNEL.0, CHANNEL.1, &e)
            }
        };
        vec![reading]
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn shutdown(&mut self) {
        self.ready = false;
    }
}
