//! Device configuration document.
//!
//! The whole document is persisted as one JSON blob (see
//! [`ConfigStore`](crate::app::config_store::ConfigStore)).  Every optional
//! field has a serde default so documents written by older firmware keep
//! loading.  Durations are milliseconds and carry an `_ms` suffix.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceCapability;
use crate::pins;

/// Longest SSID accepted by the WiFi stack.
pub const MAX_SSID_LEN: usize = 32;
/// Longest WPA2 passphrase.
pub const MAX_PASSWORD_LEN: usize = 64;
/// Read intervals below this are accepted but flagged.
pub const MIN_RECOMMENDED_READ_INTERVAL_MS: u64 = 100;

/// The complete persisted configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub actuators: Vec<ActuatorConfig>,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    /// Base URL of the management server; empty disables the API client.
    pub server_url: String,
    pub device_token: String,
    pub device_name: String,
    pub command_poll_interval_ms: u64,
    pub data_upload_interval_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            server_url: "http://localhost:3000".into(),
            device_token: String::new(),
            device_name: "aeroenv".into(),
            command_poll_interval_ms: 5_000,
            data_upload_interval_ms: 30_000,
            connection_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Safety limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Trip every actuator when a limit is exceeded.
    pub enable_emergency_shutdown: bool,
    pub max_temperature_c: f32,
    pub min_temperature_c: f32,
    pub max_humidity_percent: f32,
    pub max_pressure_psi: f32,
    /// A sensor silent for longer than this is reported stale.
    pub sensor_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enable_emergency_shutdown: true,
            max_temperature_c: 45.0,
            min_temperature_c: 5.0,
            max_humidity_percent: 90.0,
            max_pressure_psi: 80.0,
            sensor_timeout_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Sensors / actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub kind: String,
    #[serde(default = "no_pin")]
    pub pin: i32,
    /// 7-bit address for I²C sensors, 0 otherwise.
    #[serde(default)]
    pub i2c_address: u8,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub calibration_offset: f32,
    #[serde(default = "unit_scale")]
    pub calibration_scale: f32,
    #[serde(default = "default_read_interval")]
    pub read_interval_ms: u64,
}

impl SensorConfig {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            pin: pins::NO_PIN,
            i2c_address: 0,
            enabled: true,
            calibration_offset: 0.0,
            calibration_scale: 1.0,
            read_interval_ms: default_read_interval(),
        }
    }

    /// Apply the linear calibration `(v + offset) * scale`.
    pub fn calibrate(&self, raw: f32) -> f32 {
        (raw + self.calibration_offset) * self.calibration_scale
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub name: String,
    pub kind: String,
    pub pin: i32,
    /// Second output (the nozzle's nutrient solenoid), -1 if unused.
    #[serde(default = "no_pin")]
    pub aux_pin: i32,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub invert_logic: bool,
    /// Relay pulse length, or the nozzle's spray duration.
    #[serde(default)]
    pub pulse_width_ms: u64,
    #[serde(default = "default_phase_delay")]
    pub pressurize_delay_ms: u64,
    #[serde(default = "default_phase_delay")]
    pub purge_delay_ms: u64,
}

impl ActuatorConfig {
    pub fn new(name: &str, kind: &str, pin: i32) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            pin,
            aux_pin: pins::NO_PIN,
            enabled: true,
            invert_logic: false,
            pulse_width_ms: 0,
            pressurize_delay_ms: default_phase_delay(),
            purge_delay_ms: default_phase_delay(),
        }
    }
}

fn no_pin() -> i32 {
    pins::NO_PIN
}
fn enabled() -> bool {
    true
}
fn unit_scale() -> f32 {
    1.0
}
fn default_read_interval() -> u64 {
    1_000
}
fn default_phase_delay() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Outcome of [`validate`]: errors block startup, warnings are logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Check a configuration document.
///
/// Generic rules apply to every device; `capability`, when present, adds
/// the kind whitelist and per-kind hardware constraints.
pub fn validate(config: &DeviceConfig, capability: Option<&dyn DeviceCapability>) -> ValidationResult {
    let mut result = ValidationResult::default();
    validate_network(&config.network, &mut result);
    validate_safety(&config.safety, &mut result);
    validate_sensors(&config.sensors, capability, &mut result);
    validate_actuators(&config.actuators, capability, &mut result);
    result
}

fn validate_network(net: &NetworkConfig, result: &mut ValidationResult) {
    if !net.server_url.is_empty() {
        match url::Url::parse(&net.server_url) {
            Ok(u) if u.has_host() => {}
            Ok(_) => result.error(format!("Server URL '{}' has no host", net.server_url)),
            Err(e) => result.error(format!("Server URL '{}' is malformed: {e}", net.server_url)),
        }
    }
    if net.wifi_ssid.len() > MAX_SSID_LEN {
        result.error(format!("WiFi SSID longer than {MAX_SSID_LEN} bytes"));
    }
    if net.wifi_password.len() > MAX_PASSWORD_LEN {
        result.error(format!("WiFi password longer than {MAX_PASSWORD_LEN} bytes"));
    }
    if net.wifi_ssid.is_empty() {
        result.warn("WiFi SSID not configured");
    }
    if net.device_token.is_empty() {
        result.warn("Device token not configured");
    }
    for (label, value) in [
        ("command_poll_interval_ms", net.command_poll_interval_ms),
        ("data_upload_interval_ms", net.data_upload_interval_ms),
        ("connection_timeout_ms", net.connection_timeout_ms),
    ] {
        if value == 0 {
            result.error(format!("Network {label} must be non-zero"));
        }
    }
}

fn validate_safety(safety: &SafetyConfig, result: &mut ValidationResult) {
    if safety.min_temperature_c >= safety.max_temperature_c {
        result.error(format!(
            "Safety min temperature {:.1} must be below max {:.1}",
            safety.min_temperature_c, safety.max_temperature_c
        ));
    }
    if !(safety.max_humidity_percent > 0.0 && safety.max_humidity_percent <= 100.0) {
        result.error(format!(
            "Safety max humidity {:.1} must be within (0, 100]",
            safety.max_humidity_percent
        ));
    }
    if safety.max_pressure_psi <= 0.0 {
        result.error("Safety max pressure must be positive");
    }
    if safety.sensor_timeout_ms == 0 {
        result.error("Safety sensor_timeout_ms must be non-zero");
    }
}

fn check_name(kind: &str, name: &str, seen: &mut HashMap<String, usize>, result: &mut ValidationResult) {
    if name.is_empty() {
        result.error(format!("{kind} with empty name"));
    } else if name.chars().any(char::is_whitespace) {
        result.error(format!("{kind} name '{name}' contains whitespace"));
    }
    let count = seen.entry(name.to_owned()).or_insert(0);
    *count += 1;
    if *count == 2 {
        result.error(format!("Duplicate {kind} name '{name}'"));
    }
}

fn validate_sensors(
    sensors: &[SensorConfig],
    capability: Option<&dyn DeviceCapability>,
    result: &mut ValidationResult,
) {
    let mut seen = HashMap::new();
    for s in sensors {
        check_name("sensor", &s.name, &mut seen, result);
        if s.pin != pins::NO_PIN && !pins::is_valid_gpio(s.pin) {
            result.error(format!("Sensor '{}' pin {} outside GPIO range", s.name, s.pin));
        }
        if s.i2c_address != 0 && !(pins::I2C_ADDR_MIN..=pins::I2C_ADDR_MAX).contains(&s.i2c_address) {
            result.error(format!(
                "Sensor '{}' I2C address 0x{:02X} outside 7-bit range",
                s.name, s.i2c_address
            ));
        }
        if s.calibration_scale == 0.0 {
            result.error(format!("Sensor '{}' calibration_scale must be non-zero", s.name));
        }
        if s.read_interval_ms == 0 {
            result.error(format!("Sensor '{}' read_interval_ms must be non-zero", s.name));
        } else if s.read_interval_ms < MIN_RECOMMENDED_READ_INTERVAL_MS {
            result.warn(format!(
                "Sensor '{}' read interval {}ms is very short",
                s.name, s.read_interval_ms
            ));
        }
        if let Some(cap) = capability {
            if !cap.supported_sensor_kinds().contains(&s.kind.as_str()) {
                result.error(format!("Sensor '{}' has unsupported kind '{}'", s.name, s.kind));
            } else if let Err(msg) = cap.validate_sensor(s) {
                result.error(format!("Sensor '{}': {msg}", s.name));
            }
        }
    }
    if !sensors.iter().any(|s| s.enabled) {
        result.warn("No sensors enabled");
    }
}

fn validate_actuators(
    actuators: &[ActuatorConfig],
    capability: Option<&dyn DeviceCapability>,
    result: &mut ValidationResult,
) {
    let mut seen = HashMap::new();
    let mut pin_owner: HashMap<i32, &str> = HashMap::new();
    for a in actuators {
        check_name("actuator", &a.name, &mut seen, result);
        for pin in [a.pin, a.aux_pin] {
            if pin == pins::NO_PIN {
                continue;
            }
            if !pins::is_valid_gpio(pin) {
                result.error(format!("Actuator '{}' pin {pin} outside GPIO range", a.name));
                continue;
            }
            if pin == pins::I2C_SDA_GPIO || pin == pins::I2C_SCL_GPIO {
                result.warn(format!("Actuator '{}' uses I2C bus pin {pin}", a.name));
            }
            if let Some(other) = pin_owner.insert(pin, &a.name) {
                if other != a.name {
                    result.warn(format!("Pin {pin} shared by actuators '{other}' and '{}'", a.name));
                }
            }
        }
        if let Some(cap) = capability {
            if !cap.supported_actuator_kinds().contains(&a.kind.as_str()) {
                result.error(format!("Actuator '{}' has unsupported kind '{}'", a.name, a.kind));
            } else if let Err(msg) = cap.validate_actuator(a) {
                result.error(format!("Actuator '{}': {msg}", a.name));
            }
        }
    }
    if !actuators.iter().any(|a| a.enabled) {
        result.warn("No actuators enabled");
    }
}
