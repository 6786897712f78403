//! Sensirion SHT3x temperature / humidity sensor over I²C.
//!
//! Single-shot, high-repeatability measurement with clock stretching
//! (`0x2C06`).  The sensor answers with two 16-bit words, each followed by
//! a CRC-8 (polynomial 0x31, init 0xFF):
//!
//! ```text
//!  [T_msb T_lsb T_crc RH_msb RH_lsb RH_crc]
//! ```
//!
//! T = −45 + 175 · raw / 65535 °C, RH = 100 · raw / 65535 %.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use super::{Sensor, SensorReading};
use crate::app::ports::HardwarePort;
use crate::config::SensorConfig;
use crate::error::SensorError;

pub const KIND: &str = "SHT3x";

pub const CMD_MEASURE_HIGH_REP: [u8; 2] = [0x2C, 0x06];
pub const CMD_SOFT_RESET: [u8; 2] = [0x30, 0xA2];

/// Worst-case high-repeatability conversion time.
const MEASURE_DELAY: Duration = Duration::from_millis(16);
const RESET_DELAY: Duration = Duration::from_millis(2);

const TEMP_RANGE_C: core::ops::RangeInclusive<f32> = -40.0..=125.0;

const CH_TEMPERATURE: (&str, &str) = ("temperature", "°C");
const CH_HUMIDITY: (&str, &str) = ("humidity", "%");

pub struct Sht3x {
    config: SensorConfig,
    hw: Arc<dyn HardwarePort>,
    ready: bool,
}

impl Sht3x {
    pub fn new(config: SensorConfig, hw: Arc<dyn HardwarePort>) -> Self {
        Self {
            config,
            hw,
            ready: false,
        }
    }

    fn address(&self) -> u8 {
        self.config.i2c_address
    }

    /// Raw conversion: returns `(celsius, percent_rh)` before calibration.
    fn measure(&self) -> Result<(f32, f32), SensorError> {
        self.hw.i2c_write(self.address(), &CMD_MEASURE_HIGH_REP)?;
        std::thread::sleep(MEASURE_DELAY);
        let mut frame = [0u8; 6];
        self.hw.i2c_read(self.address(), &mut frame)?;
        decode_frame(&frame)
    }
}

impl Sensor for Sht3x {
    fn config(&self) -> &SensorConfig {
        &self.config
    }

    fn begin(&mut self) -> Result<(), SensorError> {
        self.hw.i2c_write(self.address(), &CMD_SOFT_RESET)?;
        std::thread::sleep(RESET_DELAY);
        let (t, rh) = self.measure()?;
        self.ready = true;
        info!(
            "SHT3x '{}' @0x{:02X} ready ({t:.1}°C, {rh:.1}%)",
            self.config.name,
            self.address()
        );
        Ok(())
    }

    fn read(&mut self) -> Vec<SensorReading> {
        let name = self.config.name.as_str();
        let fail = |e: &SensorError| {
            vec![
                SensorReading::failed(name, CH_TEMPERATURE.0, CH_TEMPERATURE.1, e),
                SensorReading::failed(name, CH_HUMIDITY.0, CH_HUMIDITY.1, e),
            ]
        };
        if !self.ready {
            return fail(&SensorError::NotInitialized);
        }
        let (t, rh) = match self.measure() {
            Ok(v) => v,
            Err(e) => {
                warn!("SHT3x '{name}': {e}");
                return fail(&e);
            }
        };

        let t = self.config.calibrate(t);
        let rh = self.config.calibrate(rh).clamp(0.0, 100.0);
        let temperature = if TEMP_RANGE_C.contains(&t) {
            SensorReading::ok(name, CH_TEMPERATURE.0, t, CH_TEMPERATURE.1)
        } else {
            SensorReading::failed(name, CH_TEMPERATURE.0, CH_TEMPERATURE.1, &SensorError::OutOfRange(t))
        };
        vec![temperature, SensorReading::ok(name, CH_HUMIDITY.0, rh, CH_HUMIDITY.1)]
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn shutdown(&mut self) {
        self.ready = false;
    }
}

/// CRC-8 as specified by Sensirion (poly 0x31, init 0xFF, no reflection).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

/// Check both CRCs and convert a 6-byte measurement frame.
pub fn decode_frame(frame: &[u8; 6]) -> Result<(f32, f32), SensorError> {
    if crc8(&frame[0..2]) != frame[2] || crc8(&frame[3..5]) != frame[5] {
        return Err(SensorError::ChecksumMismatch);
    }
    let raw_t = u16::from_be_bytes([frame[0], frame[1]]);
    let raw_rh = u16::from_be_bytes([frame[3], frame[4]]);
    let t = -45.0 + 175.0 * f32::from(raw_t) / 65535.0;
    let rh = 100.0 * f32::from(raw_rh) / 65535.0;
    Ok((t, rh))
}

/// Build a frame with valid CRCs (used by simulations and tests).
pub fn encode_frame(raw_t: u16, raw_rh: u16) -> [u8; 6] {
    let t = raw_t.to_be_bytes();
    let rh = raw_rh.to_be_bytes();
    [t[0], t[1], crc8(&t), rh[0], rh[1], crc8(&rh)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hardware::SimHardware;

    #[test]
    fn crc_matches_datasheet_example() {
        // Sensirion datasheet: CRC(0xBEEF) = 0x92.
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn decode_converts_and_checks_crc() {
        let frame = encode_frame(0x6666, 0x8000);
        let (t, rh) = decode_frame(&frame).unwrap();
        assert!((t - 25.0).abs() < 0.1, "t={t}");
        assert!((rh - 50.0).abs() < 0.1, "rh={rh}");

        let mut bad = frame;
        bad[5] ^= 0x01;
        assert_eq!(decode_frame(&bad), Err(SensorError::ChecksumMismatch));
    }

    fn sensor(hw: &Arc<SimHardware>) -> Sht3x {
        let mut cfg = SensorConfig::new("climate", KIND);
        cfg.i2c_address = 0x44;
        Sht3x::new(cfg, Arc::clone(hw) as Arc<dyn HardwarePort>)
    }

    #[test]
    fn begin_resets_then_measures() {
        let hw = Arc::new(SimHardware::new());
        hw.set_i2c_response(0x44, &encode_frame(0x6666, 0x8000));
        let mut s = sensor(&hw);
        s.begin().unwrap();
        assert!(s.is_ready());
        let writes = hw.i2c_writes(0x44);
        assert_eq!(writes[0], CMD_SOFT_RESET.to_vec());
        assert_eq!(writes[1], CMD_MEASURE_HIGH_REP.to_vec());
    }

    #[test]
    fn absent_device_fails_begin() {
        let hw = Arc::new(SimHardware::new());
        let mut s = sensor(&hw);
        assert_eq!(s.begin(), Err(SensorError::Communication(crate::app::ports::HalError::I2c(0x44))));
        let readings = s.read();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| !r.valid && r.error_message.is_some()));
    }

    #[test]
    fn read_applies_calibration() {
        let hw = Arc::new(SimHardware::new());
        hw.set_i2c_response(0x44, &encode_frame(0x6666, 0x8000));
        let mut s = sensor(&hw);
        s.config.calibration_offset = 1.0;
        s.begin().unwrap();
        let readings = s.read();
        assert_eq!(readings[0].kind, "temperature");
        assert!((readings[0].value - 26.0).abs() < 0.1);
        assert_eq!(readings[1].kind, "humidity");
        assert!((readings[1].value - 51.0).abs() < 0.1);
        assert!(readings.iter().all(|r| r.valid));
    }

    #[test]
    fn corrupted_frame_yields_invalid_readings() {
        let hw = Arc::new(SimHardware::new());
        hw.set_i2c_response(0x44, &encode_frame(0x6666, 0x8000));
        let mut s = sensor(&hw);
        s.begin().unwrap();
        let mut bad = encode_frame(0x6666, 0x8000);
        bad[2] ^= 0xFF;
        hw.set_i2c_response(0x44, &bad);
        let readings = s.read();
        assert!(readings.iter().all(|r| !r.valid));
        assert_eq!(readings[0].error_message.as_deref(), Some("checksum mismatch"));
    }
}
