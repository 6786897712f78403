//! Hardware adapters: the only code that touches real peripherals.
//!
//! | Adapter        | Target      | Backing                               |
//! |----------------|-------------|---------------------------------------|
//! | `EspHardware`  | espidf      | raw GPIO/LEDC/ADC1 + `embedded-hal` I²C |
//! | `SimHardware`  | host        | in-memory pin model with fault injection |
//!
//! Both implement [`HardwarePort`], so sensor and actuator drivers are
//! identical on device and in tests.

use embedded_hal::i2c::{Error as _, I2c};
use log::warn;
use parking_lot::Mutex;

#[cfg(not(target_os = "espidf"))]
use std::collections::{HashMap, HashSet};
#[cfg(not(target_os = "espidf"))]
use std::time::Instant;

use crate::app::ports::{HalError, HardwarePort};

// ── I²C bridge ────────────────────────────────────────────────

/// Shares one `embedded-hal` I²C bus between every sensor driver.
pub struct I2cBridge<B> {
    bus: Mutex<B>,
}

impl<B: I2c + Send> I2cBridge<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus: Mutex::new(bus),
        }
    }

    pub fn write(&self, address: u8, bytes: &[u8]) -> Result<(), HalError> {
        self.bus.lock().write(address, bytes).map_err(|e| {
            warn!("I2C write to 0x{address:02X} failed: {:?}", e.kind());
            HalError::I2c(address)
        })
    }

    pub fn read(&self, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        self.bus.lock().read(address, buf).map_err(|e| {
            warn!("I2C read from 0x{address:02X} failed: {:?}", e.kind());
            HalError::I2c(address)
        })
    }
}

// ── ESP-IDF adapter ───────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct EspHardware<B> {
    i2c: I2cBridge<B>,
}

#[cfg(target_os = "espidf")]
impl<B: I2c + Send> EspHardware<B> {
    pub fn new(i2c: B) -> Self {
        Self {
            i2c: I2cBridge::new(i2c),
        }
    }
}

#[cfg(target_os = "espidf")]
impl<B: I2c + Send> HardwarePort for EspHardware<B> {
    fn configure_output(&self, pin: i32) -> Result<(), HalError> {
        crate::drivers::hw_init::gpio_configure_output(pin)
    }

    fn digital_write(&self, pin: i32, high: bool) -> Result<(), HalError> {
        crate::drivers::hw_init::gpio_write(pin, high)
    }

    fn configure_pwm(&self, pin: i32, channel: u8, frequency_hz: u32, resolution_bits: u8) -> Result<(), HalError> {
        crate::drivers::hw_init::ledc_configure(pin, channel, frequency_hz, resolution_bits)
    }

    fn pwm_write(&self, channel: u8, duty: u32) -> Result<(), HalError> {
        crate::drivers::hw_init::ledc_set(channel, duty)
    }

    fn analog_read(&self, pin: i32) -> Result<u16, HalError> {
        crate::drivers::hw_init::adc1_read(pin)
    }

    fn i2c_write(&self, address: u8, bytes: &[u8]) -> Result<(), HalError> {
        self.i2c.write(address, bytes)
    }

    fn i2c_read(&self, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        self.i2c.read(address, buf)
    }
}

// ── Simulation adapter ────────────────────────────────────────

/// One recorded output change.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwWrite {
    Digital { pin: i32, high: bool },
    Pwm { channel: u8, duty: u32 },
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Copy)]
pub struct WriteRecord {
    pub at: Instant,
    pub write: HwWrite,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimState {
    outputs: HashSet<i32>,
    levels: HashMap<i32, bool>,
    pwm_channels: HashMap<u8, (i32, u32)>,
    pwm_duty: HashMap<u8, u32>,
    adc: HashMap<i32, u16>,
    i2c_responses: HashMap<u8, Vec<u8>>,
    i2c_writes: Vec<(u8, Vec<u8>)>,
    failing_pins: HashSet<i32>,
    failing_i2c: HashSet<u8>,
    history: Vec<WriteRecord>,
}

/// In-memory board used on the host.
///
/// Records every output write with its instant, returns injected ADC
/// samples and scripted I²C replies, and fails writes to pins marked with
/// [`fail_pin`](Self::fail_pin).
#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
pub struct SimHardware {
    state: Mutex<SimState>,
}

#[cfg(not(target_os = "espidf"))]
impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level of a digital output, `None` if never written.
    pub fn level(&self, pin: i32) -> Option<bool> {
        self.state.lock().levels.get(&pin).copied()
    }

    pub fn is_output(&self, pin: i32) -> bool {
        self.state.lock().outputs.contains(&pin)
    }

    pub fn pwm_duty(&self, channel: u8) -> Option<u32> {
        self.state.lock().pwm_duty.get(&channel).copied()
    }

    /// `(pin, frequency_hz)` an LEDC channel was configured with.
    pub fn pwm_channel(&self, channel: u8) -> Option<(i32, u32)> {
        self.state.lock().pwm_channels.get(&channel).copied()
    }

    pub fn set_adc(&self, pin: i32, raw: u16) {
        self.state.lock().adc.insert(pin, raw);
    }

    /// Bytes returned by every subsequent read from `address`.
    pub fn set_i2c_response(&self, address: u8, bytes: &[u8]) {
        self.state.lock().i2c_responses.insert(address, bytes.to_vec());
    }

    pub fn i2c_writes(&self, address: u8) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .i2c_writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Make writes to `pin` (digital, or the PWM channel bound to it) fail.
    pub fn fail_pin(&self, pin: i32, failing: bool) {
        let mut st = self.state.lock();
        if failing {
            st.failing_pins.insert(pin);
        } else {
            st.failing_pins.remove(&pin);
        }
    }

    pub fn fail_i2c(&self, address: u8, failing: bool) {
        let mut st = self.state.lock();
        if failing {
            st.failing_i2c.insert(address);
        } else {
            st.failing_i2c.remove(&address);
        }
    }

    pub fn history(&self) -> Vec<WriteRecord> {
        self.state.lock().history.clone()
    }

    /// Digital level changes on `pin` in write order.
    pub fn digital_history(&self, pin: i32) -> Vec<(Instant, bool)> {
        self.state
            .lock()
            .history
            .iter()
            .filter_map(|r| match r.write {
                HwWrite::Digital { pin: p, high } if p == pin => Some((r.at, high)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(not(target_os = "espidf"))]
impl HardwarePort for SimHardware {
    fn configure_output(&self, pin: i32) -> Result<(), HalError> {
        if !crate::pins::is_output_gpio(pin) {
            return Err(HalError::InvalidPin(pin));
        }
        self.state.lock().outputs.insert(pin);
        Ok(())
    }

    fn digital_write(&self, pin: i32, high: bool) -> Result<(), HalError> {
        let mut st = self.state.lock();
        if st.failing_pins.contains(&pin) || !st.outputs.contains(&pin) {
            return Err(HalError::Gpio(pin));
        }
        st.levels.insert(pin, high);
        st.history.push(WriteRecord {
            at: Instant::now(),
            write: HwWrite::Digital { pin, high },
        });
        Ok(())
    }

    fn configure_pwm(&self, pin: i32, channel: u8, frequency_hz: u32, _resolution_bits: u8) -> Result<(), HalError> {
        if !crate::pins::is_output_gpio(pin) {
            return Err(HalError::InvalidPin(pin));
        }
        let mut st = self.state.lock();
        st.pwm_channels.insert(channel, (pin, frequency_hz));
        st.pwm_duty.insert(channel, 0);
        Ok(())
    }

    fn pwm_write(&self, channel: u8, duty: u32) -> Result<(), HalError> {
        let mut st = self.state.lock();
        let Some(&(pin, _)) = st.pwm_channels.get(&channel) else {
            return Err(HalError::Pwm(channel));
        };
        if st.failing_pins.contains(&pin) {
            return Err(HalError::Pwm(channel));
        }
        st.pwm_duty.insert(channel, duty);
        st.history.push(WriteRecord {
            at: Instant::now(),
            write: HwWrite::Pwm { channel, duty },
        });
        Ok(())
    }

    fn analog_read(&self, pin: i32) -> Result<u16, HalError> {
        if !crate::pins::is_adc1_pin(pin) {
            return Err(HalError::InvalidPin(pin));
        }
        let st = self.state.lock();
        if st.failing_pins.contains(&pin) {
            return Err(HalError::Adc(pin));
        }
        Ok(st.adc.get(&pin).copied().unwrap_or(0))
    }

    fn i2c_write(&self, address: u8, bytes: &[u8]) -> Result<(), HalError> {
        let mut st = self.state.lock();
        if st.failing_i2c.contains(&address) || !st.i2c_responses.contains_key(&address) {
            return Err(HalError::I2c(address));
        }
        st.i2c_writes.push((address, bytes.to_vec()));
        Ok(())
    }

    fn i2c_read(&self, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        let st = self.state.lock();
        if st.failing_i2c.contains(&address) {
            return Err(HalError::I2c(address));
        }
        let Some(resp) = st.i2c_responses.get(&address) else {
            return Err(HalError::I2c(address));
        };
        for (dst, src) in buf.iter_mut().zip(resp.iter().chain(core::iter::repeat(&0xFF))) {
            *dst = *src;
        }
        Ok(())
    }
}
