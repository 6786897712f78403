//! Port traits: the hexagonal boundary between the orchestration core and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ managers / ConfigStore (domain)
//! ```
//!
//! Sensors, actuators and stores never touch ESP-IDF directly; they hold one
//! of these traits.  On device the adapters wrap GPIO/LEDC/ADC/I2C/NVS, on
//! the host the simulation adapters record what would have happened.

use core::fmt;

// ───────────────────────────────────────────────────────────────
// Hardware port (driven adapter: domain → pins and buses)
// ───────────────────────────────────────────────────────────────

/// Raw peripheral access used by sensor and actuator drivers.
///
/// All methods take `&self`; implementations serialise access internally
/// so one port can be shared by every driver on the board.
pub trait HardwarePort: Send + Sync {
    /// Configure `pin` as a push-pull digital output.
    fn configure_output(&self, pin: i32) -> Result<(), HalError>;

    /// Drive a digital output high or low.
    fn digital_write(&self, pin: i32, high: bool) -> Result<(), HalError>;

    /// Attach `pin` to an LEDC channel with the given timer setup.
    fn configure_pwm(
        &self,
        pin: i32,
        channel: u8,
        frequency_hz: u32,
        resolution_bits: u8,
    ) -> Result<(), HalError>;

    /// Set the raw (resolution-scaled) duty of an LEDC channel.
    fn pwm_write(&self, channel: u8, duty: u32) -> Result<(), HalError>;

    /// Sample a 12-bit ADC1 pin.
    fn analog_read(&self, pin: i32) -> Result<u16, HalError>;

    /// Write `bytes` to the I²C device at `address`.
    fn i2c_write(&self, address: u8, bytes: &[u8]) -> Result<(), HalError>;

    /// Fill `buf` from the I²C device at `address`.
    fn i2c_read(&self, address: u8, buf: &mut [u8]) -> Result<(), HalError>;
}

/// Hardware-level failure reported by a [`HardwarePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// GPIO configuration or level write failed.
    Gpio(i32),
    /// LEDC channel setup or duty write failed.
    Pwm(u8),
    /// ADC sample failed on this pin.
    Adc(i32),
    /// I²C transaction NACKed or timed out.
    I2c(u8),
    /// The pin is not usable for the requested function.
    InvalidPin(i32),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpio(pin) => write!(f, "GPIO{pin} write failed"),
            Self::Pwm(ch) => write!(f, "LEDC channel {ch} failed"),
            Self::Adc(pin) => write!(f, "ADC read on GPIO{pin} failed"),
            Self::I2c(addr) => write!(f, "I2C transaction with 0x{addr:02X} failed"),
            Self::InvalidPin(pin) => write!(f, "GPIO{pin} not usable"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ NVS / flash)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value blob storage.
///
/// Keys are namespaced to prevent collisions between subsystems.  Write
/// operations MUST be atomic; the ESP-IDF NVS API guarantees this
/// natively; the in-memory simulation achieves it trivially.
pub trait StoragePort: Send {
    /// Prepare the backing store (open the partition, erase if corrupt).
    fn init(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Read a whole value.
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
    /// The stored value is larger than the adapter accepts.
    TooLarge,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
            Self::TooLarge => write!(f, "value too large"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// System probe (driven adapter: platform → SystemMonitor)
// ───────────────────────────────────────────────────────────────

/// Point-in-time platform health figures.
pub trait SystemProbe: Send + Sync {
    /// Currently free heap in bytes.
    fn free_heap(&self) -> u32;

    /// Low-water mark of free heap since boot.
    fn min_free_heap(&self) -> u32;

    /// RSSI of the associated access point, `None` when not connected.
    fn wifi_rssi(&self) -> Option<i8>;

    /// Milliseconds since boot.
    fn uptime_ms(&self) -> u64 {
        crate::adapters::time::uptime_ms()
    }
}

// ───────────────────────────────────────────────────────────────
// Restart port (driven adapter: CommandHandler → chip reset)
// ───────────────────────────────────────────────────────────────

pub trait RestartPort: Send + Sync {
    /// Reset the chip.  On device this does not return.
    fn restart(&self);
}
