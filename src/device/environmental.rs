//! AeroEnv environmental controller: SHT3x climate sensor, analog line
//! pressure, lighting relay, Venturi spray nozzle and a PWM circulation fan.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::DeviceCapability;
use crate::app::events::topics;
use crate::app::ports::HardwarePort;
use crate::config::{ActuatorConfig, SafetyConfig, SensorConfig};
use crate::drivers::nozzle::{self, VenturiNozzle};
use crate::drivers::pwm::{self, PwmOutput};
use crate::drivers::relay::{self, Relay};
use crate::drivers::{Actuator, DriverContext};
use crate::error::{ActuatorError, SensorError};
use crate::events::EventBus;
use crate::pins;
use crate::sensors::Sensor;
use crate::sensors::pressure::{self, AnalogPressure};
use crate::sensors::sht3x::{self, Sht3x};

pub const DEVICE_TYPE: &str = "environmental";
pub const DEVICE_NAME: &str = "AeroEnv Environmental Controller";

/// Older configs name the part by its exact variant.
const SHT30_ALIAS: &str = "SHT30";
const BME280: &str = "BME280";
const LIGHT_SENSOR: &str = "LightSensor";
const DS18B20: &str = "DS18B20";

const SENSOR_KINDS: [&str; 6] = [sht3x::KIND, SHT30_ALIAS, pressure::KIND, BME280, LIGHT_SENSOR, DS18B20];
const ACTUATOR_KINDS: [&str; 3] = [relay::KIND, pwm::KIND, nozzle::KIND];

/// Valid SHT3x addresses (ADDR pin low / high).
const SHT3X_ADDRESSES: [u8; 2] = [0x44, 0x45];

pub struct EnvironmentalDevice {
    hw: Arc<dyn HardwarePort>,
    /// LEDC channel per PWM pin, stable across re-creation.
    pwm_channels: Mutex<HashMap<i32, u8>>,
}

impl EnvironmentalDevice {
    pub fn new(hw: Arc<dyn HardwarePort>) -> Self {
        Self {
            hw,
            pwm_channels: Mutex::new(HashMap::new()),
        }
    }

    fn pwm_channel_for(&self, pin: i32) -> Result<u8, ActuatorError> {
        let mut channels = self.pwm_channels.lock();
        if let Some(&ch) = channels.get(&pin) {
            return Ok(ch);
        }
        let next = channels.len() as u8;
        if next >= pins::PWM_CHANNELS {
            return Err(ActuatorError::Unsupported("no free PWM channel"));
        }
        channels.insert(pin, next);
        Ok(next)
    }
}

fn output_pin(label: &str, pin: i32) -> Result<(), String> {
    if pins::is_output_gpio(pin) {
        Ok(())
    } else {
        Err(format!("{label} pin {pin} is not output-capable (0..={})", pins::OUTPUT_GPIO_MAX))
    }
}

impl DeviceCapability for EnvironmentalDevice {
    fn device_type(&self) -> &str {
        DEVICE_TYPE
    }

    fn device_name(&self) -> &str {
        DEVICE_NAME
    }

    fn firmware_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn supported_sensor_kinds(&self) -> &[&'static str] {
        &SENSOR_KINDS
    }

    fn supported_actuator_kinds(&self) -> &[&'static str] {
        &ACTUATOR_KINDS
    }

    fn create_sensor(&self, config: &SensorConfig) -> Result<Box<dyn Sensor>, SensorError> {
        match config.kind.as_str() {
            sht3x::KIND | SHT30_ALIAS => Ok(Box::new(Sht3x::new(config.clone(), self.hw.clone()))),
            pressure::KIND => Ok(Box::new(AnalogPressure::new(config.clone(), self.hw.clone()))),
            other => Err(SensorError::UnsupportedKind(other.to_owned())),
        }
    }

    fn create_actuator(
        &self,
        config: &ActuatorConfig,
        bus: &Arc<EventBus>,
    ) -> Result<Arc<dyn Actuator>, ActuatorError> {
        let ctx = DriverContext::new(self.hw.clone(), bus.clone());
        match config.kind.as_str() {
            relay::KIND => Ok(Arc::new(Relay::new(config.clone(), ctx))),
            pwm::KIND => {
                let channel = self.pwm_channel_for(config.pin)?;
                Ok(Arc::new(PwmOutput::new(config.clone(), channel, ctx)))
            }
            nozzle::KIND => Ok(Arc::new(VenturiNozzle::new(config.clone(), ctx))),
            other => Err(ActuatorError::UnsupportedKind(other.to_owned())),
        }
    }

    fn validate_sensor(&self, config: &SensorConfig) -> Result<(), String> {
        match config.kind.as_str() {
            sht3x::KIND | SHT30_ALIAS if !SHT3X_ADDRESSES.contains(&config.i2c_address) => Err(format!(
                "SHT3x I2C address 0x{:02X} must be 0x44 or 0x45",
                config.i2c_address
            )),
            pressure::KIND if !pins::is_adc1_pin(config.pin) => Err(format!(
                "pressure pin {} is not an ADC1 channel (32..=39)",
                config.pin
            )),
            DS18B20 if !pins::is_valid_gpio(config.pin) => {
                Err(format!("DS18B20 needs a one-wire data pin, got {}", config.pin))
            }
            LIGHT_SENSOR if !pins::is_adc1_pin(config.pin) && config.i2c_address == 0 => {
                Err("light sensor needs an ADC1 pin or an I2C address".into())
            }
            _ => Ok(()),
        }
    }

    fn validate_actuator(&self, config: &ActuatorConfig) -> Result<(), String> {
        output_pin("output", config.pin)?;
        if config.kind == nozzle::KIND {
            output_pin("nutrient", config.aux_pin)?;
            if config.aux_pin == config.pin {
                return Err("air and nutrient solenoids must use different pins".into());
            }
            if config.pulse_width_ms == 0 {
                return Err("spray duration (pulse_width_ms) must be non-zero".into());
            }
        }
        Ok(())
    }

    fn event_topics(&self) -> Vec<String> {
        [
            topics::SENSOR_TEMPERATURE,
            topics::SENSOR_HUMIDITY,
            topics::SENSOR_PRESSURE,
            topics::NOZZLE_AIR_OPEN,
            topics::NOZZLE_NUTRIENT_OPEN,
            topics::NOZZLE_NUTRIENT_CLOSE,
            topics::NOZZLE_AIR_CLOSE,
            topics::SYSTEM_SAFETY,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn default_sensors(&self) -> Vec<SensorConfig> {
        let mut climate = SensorConfig::new("sht3x", sht3x::KIND);
        climate.i2c_address = SHT3X_ADDRESSES[0];
        climate.read_interval_ms = 2_000;

        let mut line = SensorConfig::new("pressure", pressure::KIND);
        line.pin = pins::PRESSURE_ADC_GPIO;
        line.read_interval_ms = 1_000;

        vec![climate, line]
    }

    fn default_actuators(&self) -> Vec<ActuatorConfig> {
        let lights = ActuatorConfig::new("lights", relay::KIND, pins::LIGHTS_RELAY_GPIO);

        let mut spray = ActuatorConfig::new("spray", nozzle::KIND, pins::SPRAY_AIR_GPIO);
        spray.aux_pin = pins::SPRAY_NUTRIENT_GPIO;
        spray.pulse_width_ms = nozzle::DEFAULT_SPRAY_MS;

        let fan = ActuatorConfig::new("fan", pwm::KIND, pins::FAN_PWM_GPIO);

        vec![lights, spray, fan]
    }

    fn default_safety(&self) -> SafetyConfig {
        SafetyConfig {
            enable_emergency_shutdown: true,
            max_temperature_c: 45.0,
            min_temperature_c: 5.0,
            max_humidity_percent: 90.0,
            max_pressure_psi: 80.0,
            sensor_timeout_ms: 30_000,
        }
    }
}
