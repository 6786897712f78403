//! GPIO / peripheral pin assignments for the AeroEnv controller board.
//!
//! Single source of truth for the platform's pin ranges and the default
//! wiring used when no configuration has been persisted yet.

// ---------------------------------------------------------------------------
// Platform ranges (ESP32)
// ---------------------------------------------------------------------------

/// Highest GPIO number on the ESP32.
pub const GPIO_MAX: i32 = 39;
/// GPIOs above this are input-only (34..=39) or absent.
pub const OUTPUT_GPIO_MAX: i32 = 33;
/// Sentinel for "no pin" (I2C sensors, unused auxiliary outputs).
pub const NO_PIN: i32 = -1;

/// ADC1 channel pins (ADC2 is unusable while WiFi is active).
pub const ADC1_PINS: core::ops::RangeInclusive<i32> = 32..=39;

/// Returns `true` if `pin` exists on the chip.
pub const fn is_valid_gpio(pin: i32) -> bool {
    pin >= 0 && pin <= GPIO_MAX
}

/// Returns `true` if `pin` can drive an output.
pub const fn is_output_gpio(pin: i32) -> bool {
    pin >= 0 && pin <= OUTPUT_GPIO_MAX
}

pub fn is_adc1_pin(pin: i32) -> bool {
    ADC1_PINS.contains(&pin)
}

/// ADC1 channel for an ADC1 pin (GPIO36 = CH0 ... GPIO39 = CH3, GPIO32 = CH4 ...).
pub const fn adc1_channel(pin: i32) -> Option<u32> {
    match pin {
        36 => Some(0),
        37 => Some(1),
        38 => Some(2),
        39 => Some(3),
        32 => Some(4),
        33 => Some(5),
        34 => Some(6),
        35 => Some(7),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// I²C bus (SHT3x)
// ---------------------------------------------------------------------------

pub const I2C_SDA_GPIO: i32 = 21;
pub const I2C_SCL_GPIO: i32 = 22;
pub const I2C_FREQ_HZ: u32 = 100_000;

/// Lowest / highest non-reserved 7-bit I²C address.
pub const I2C_ADDR_MIN: u8 = 0x08;
pub const I2C_ADDR_MAX: u8 = 0x77;

// ---------------------------------------------------------------------------
// Default wiring
// ---------------------------------------------------------------------------

/// Grow-light relay.
pub const LIGHTS_RELAY_GPIO: i32 = 23;
/// Venturi nozzle air solenoid.
pub const SPRAY_AIR_GPIO: i32 = 25;
/// Venturi nozzle nutrient solenoid.
pub const SPRAY_NUTRIENT_GPIO: i32 = 26;
/// Circulation fan (LEDC PWM).
pub const FAN_PWM_GPIO: i32 = 27;
/// Pressure transducer (ADC1 CH0).
pub const PRESSURE_ADC_GPIO: i32 = 36;

// ---------------------------------------------------------------------------
// PWM configuration
// ---------------------------------------------------------------------------

/// LEDC timer resolution (bits).  8-bit gives 0 – 255 duty levels.
pub const PWM_RESOLUTION_BITS: u8 = 8;
/// LEDC frequency for fans and dimmable outputs.
pub const PWM_FREQ_HZ: u32 = 5_000;
/// Number of LEDC channels available to PWM actuators.
pub const PWM_CHANNELS: u8 = 8;

// ---------------------------------------------------------------------------
// ADC
// ---------------------------------------------------------------------------

/// Full-scale raw value of the 12-bit ADC.
pub const ADC_MAX_RAW: u16 = 4095;
/// ADC reference voltage with 11 dB attenuation.
pub const ADC_VREF: f32 = 3.3;
