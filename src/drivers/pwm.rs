//! Variable-duty output on an LEDC channel (fans, dimmable lights).
//!
//! Duty is tracked in percent; the hardware value is rescaled to the
//! channel resolution on every write.  `activate` is a 50 % default,
//! `deactivate` is 0 %, and the output counts as active while duty > 0.

use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use parking_lot::Mutex;

use super::{Actuator, DriverContext};
use crate::app::events::{Payload, topics};
use crate::config::ActuatorConfig;
use crate::error::ActuatorError;
use crate::pins;

pub const KIND: &str = "PWMOutput";

pub const DEFAULT_ACTIVE_PERCENT: f32 = 50.0;

/// Clamp to `[0, 100]`; NaN is treated as off.
pub fn clamp_percent(percent: f32) -> f32 {
    if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) }
}

/// Percent → raw duty at `bits` resolution, honouring inverted outputs.
pub fn duty_raw(percent: f32, bits: u8, invert: bool) -> u32 {
    let max = (1u32 << bits) - 1;
    let raw = ((clamp_percent(percent) / 100.0) * max as f32).round() as u32;
    if invert { max - raw.min(max) } else { raw.min(max) }
}

#[derive(Debug)]
struct PwmState {
    percent: f32,
    frequency_hz: u32,
}

pub struct PwmOutput {
    config: ActuatorConfig,
    ctx: DriverContext,
    channel: u8,
    state: Mutex<PwmState>,
    ready: AtomicBool,
}

impl PwmOutput {
    pub fn new(config: ActuatorConfig, channel: u8, ctx: DriverContext) -> Self {
        Self {
            config,
            ctx,
            channel,
            state: Mutex::new(PwmState {
                percent: 0.0,
                frequency_hz: pins::PWM_FREQ_HZ,
            }),
            ready: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn duty_cycle(&self) -> f32 {
        self.state.lock().percent
    }

    pub fn frequency(&self) -> u32 {
        self.state.lock().frequency_hz
    }

    /// Reconfigure the LEDC timer and restore the current duty.
    pub fn set_frequency(&self, frequency_hz: u32) -> Result<(), ActuatorError> {
        if !self.is_ready() {
            return Err(ActuatorError::NotInitialized);
        }
        if frequency_hz == 0 {
            return Err(ActuatorError::Unsupported("zero frequency"));
        }
        let mut st = self.state.lock();
        let res = self
            .ctx
            .hw
            .configure_pwm(self.config.pin, self.channel, frequency_hz, pins::PWM_RESOLUTION_BITS)
            .and_then(|()| self.ctx.hw.pwm_write(self.channel, self.raw(st.percent)));
        if let Err(e) = res {
            drop(st);
            return Err(self.ctx.write_failed(&self.config.name, e.into()));
        }
        st.frequency_hz = frequency_hz;
        Ok(())
    }

    fn raw(&self, percent: f32) -> u32 {
        duty_raw(percent, pins::PWM_RESOLUTION_BITS, self.config.invert_logic)
    }

    fn apply(&self, percent: f32) -> Result<(), ActuatorError> {
        if !self.is_ready() {
            return Err(ActuatorError::NotInitialized);
        }
        let percent = clamp_percent(percent);
        let previous = {
            let mut st = self.state.lock();
            if st.percent == percent {
                return Ok(());
            }
            if let Err(e) = self.ctx.hw.pwm_write(self.channel, self.raw(percent)) {
                drop(st);
                return Err(self.ctx.write_failed(&self.config.name, e.into()));
            }
            std::mem::replace(&mut st.percent, percent)
        };

        let (was_on, is_on) = (previous > 0.0, percent > 0.0);
        if was_on != is_on || is_on {
            let topic = if is_on {
                topics::ACTUATOR_ACTIVATED
            } else {
                topics::ACTUATOR_DEACTIVATED
            };
            self.ctx.announce(
                &self.config.name,
                topic,
                Payload::ActuatorState {
                    name: self.config.name.clone(),
                    active: is_on,
                    duration_ms: None,
                    level: Some(percent),
                },
            );
        }
        Ok(())
    }
}

impl Actuator for PwmOutput {
    fn config(&self) -> &ActuatorConfig {
        &self.config
    }

    fn begin(&self) -> Result<(), ActuatorError> {
        let freq = self.state.lock().frequency_hz;
        self.ctx
            .hw
            .configure_pwm(self.config.pin, self.channel, freq, pins::PWM_RESOLUTION_BITS)?;
        self.ctx.hw.pwm_write(self.channel, self.raw(0.0))?;
        self.state.lock().percent = 0.0;
        self.ready.store(true, Ordering::Release);
        info!(
            "PWM '{}' on GPIO{} ch{} @ {} Hz ready",
            self.config.name, self.config.pin, self.channel, freq
        );
        Ok(())
    }

    fn activate(&self) -> Result<(), ActuatorError> {
        self.apply(DEFAULT_ACTIVE_PERCENT)
    }

    fn deactivate(&self) -> Result<(), ActuatorError> {
        self.apply(0.0)
    }

    fn is_active(&self) -> bool {
        self.state.lock().percent > 0.0
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set_level(&self, percent: f32) -> Result<(), ActuatorError> {
        self.apply(percent)
    }

    fn level(&self) -> Option<f32> {
        Some(self.duty_cycle())
    }

    fn shutdown(&self) {
        if self.is_ready() {
            let _ = self.deactivate();
        }
        self.ready.store(false, Ordering::Release);
    }
}
