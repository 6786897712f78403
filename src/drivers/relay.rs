//! On/off relay output (lights, pumps, heaters).
//!
//! `invert_logic` flips the electrical level for active-low relay boards.
//! A pulse arms a deadline that [`Actuator::update`] completes, so no
//! thread is parked for the pulse length.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use super::{Actuator, DriverContext};
use crate::app::events::{Payload, topics};
use crate::config::ActuatorConfig;
use crate::error::ActuatorError;

pub const KIND: &str = "Relay";

#[derive(Debug, Default)]
struct RelayState {
    active: bool,
    activated_at: Option<Instant>,
    pulse_deadline: Option<Instant>,
}

pub struct Relay {
    config: ActuatorConfig,
    ctx: DriverContext,
    state: Mutex<RelayState>,
    ready: AtomicBool,
}

impl Relay {
    pub fn new(config: ActuatorConfig, ctx: DriverContext) -> Self {
        Self {
            config,
            ctx,
            state: Mutex::new(RelayState::default()),
            ready: AtomicBool::new(false),
        }
    }

    fn drive(&self, on: bool) -> Result<(), ActuatorError> {
        self.ctx
            .hw
            .digital_write(self.config.pin, on != self.config.invert_logic)
            .map_err(ActuatorError::from)
    }

    fn ensure_ready(&self) -> Result<(), ActuatorError> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ActuatorError::NotInitialized)
        }
    }

    /// Remaining time of an armed pulse.
    pub fn pulse_remaining(&self) -> Option<Duration> {
        self.state
            .lock()
            .pulse_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Actuator for Relay {
    fn config(&self) -> &ActuatorConfig {
        &self.config
    }

    fn begin(&self) -> Result<(), ActuatorError> {
        self.ctx.hw.configure_output(self.config.pin)?;
        self.drive(false)?;
        self.ready.store(true, Ordering::Release);
        info!(
            "Relay '{}' on GPIO{} ready{}",
            self.config.name,
            self.config.pin,
            if self.config.invert_logic { " (inverted)" } else { "" }
        );
        Ok(())
    }

    fn activate(&self) -> Result<(), ActuatorError> {
        self.ensure_ready()?;
        {
            let mut st = self.state.lock();
            st.pulse_deadline = None;
            if st.active {
                return Ok(());
            }
            if let Err(e) = self.drive(true) {
                drop(st);
                return Err(self.ctx.write_failed(&self.config.name, e));
            }
            st.active = true;
            st.activated_at = Some(Instant::now());
        }
        self.ctx.announce(
            &self.config.name,
            topics::ACTUATOR_ACTIVATED,
            Payload::actuator_state(&self.config.name, true),
        );
        Ok(())
    }

    fn deactivate(&self) -> Result<(), ActuatorError> {
        self.ensure_ready()?;
        let duration_ms = {
            let mut st = self.state.lock();
            st.pulse_deadline = None;
            if !st.active {
                return Ok(());
            }
            if let Err(e) = self.drive(false) {
                drop(st);
                return Err(self.ctx.write_failed(&self.config.name, e));
            }
            st.active = false;
            st.activated_at
                .take()
                .map_or(0, |t| t.elapsed().as_millis() as u64)
        };
        self.ctx.announce(
            &self.config.name,
            topics::ACTUATOR_DEACTIVATED,
            Payload::ActuatorState {
                name: self.config.name.clone(),
                active: false,
                duration_ms: Some(duration_ms),
                level: None,
            },
        );
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn update(&self) {
        let due = self
            .state
            .lock()
            .pulse_deadline
            .is_some_and(|d| Instant::now() >= d);
        if due {
            // Failure already published by deactivate.
            let _ = self.deactivate();
        }
    }

    fn pulse(&self, duration: Duration) -> Result<(), ActuatorError> {
        let duration = if duration.is_zero() {
            Duration::from_millis(self.config.pulse_width_ms)
        } else {
            duration
        };
        if duration.is_zero() {
            return Err(ActuatorError::Unsupported("pulse without duration"));
        }
        self.activate()?;
        self.state.lock().pulse_deadline = Some(Instant::now() + duration);
        Ok(())
    }

    fn shutdown(&self) {
        if self.is_ready() {
            let _ = self.deactivate();
        }
        self.ready.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hardware::SimHardware;
    use crate::app::events::Event;
    use crate::events::EventBus;
    use std::sync::Arc;

    fn relay(invert: bool) -> (Relay, Arc<SimHardware>, Arc<EventBus>) {
        let hw = Arc::new(SimHardware::new());
        let bus = Arc::new(EventBus::new());
        let mut cfg = ActuatorConfig::new("lights", KIND, 23);
        cfg.invert_logic = invert;
        let r = Relay::new(cfg, DriverContext::new(hw.clone(), bus.clone()));
        (r, hw, bus)
    }

    #[test]
    fn requires_begin() {
        let (r, _, _) = relay(false);
        assert_eq!(r.activate(), Err(ActuatorError::NotInitialized));
    }

    #[test]
    fn activate_and_deactivate_drive_the_pin() {
        let (r, hw, _) = relay(false);
        r.begin().unwrap();
        assert_eq!(hw.level(23), Some(false));
        r.activate().unwrap();
        assert!(r.is_active());
        assert_eq!(hw.level(23), Some(true));
        r.deactivate().unwrap();
        assert!(!r.is_active());
        assert_eq!(hw.level(23), Some(false));
    }

    #[test]
    fn inverted_relay_is_active_low() {
        let (r, hw, _) = relay(true);
        r.begin().unwrap();
        assert_eq!(hw.level(23), Some(true));
        r.activate().unwrap();
        assert_eq!(hw.level(23), Some(false));
    }

    #[test]
    fn deactivation_reports_elapsed_duration() {
        let (r, _, bus) = relay(false);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bus.subscribe(topics::ACTUATOR_DEACTIVATED, move |ev: &Event| {
            if let Payload::ActuatorState { duration_ms, .. } = ev.payload() {
                *s.lock() = *duration_ms;
            }
        })
        .unwrap();
        r.begin().unwrap();
        r.activate().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        r.deactivate().unwrap();
        let d = seen.lock().expect("deactivation event");
        assert!(d >= 25, "duration {d}");
    }

    #[test]
    fn write_failure_keeps_state_and_publishes_error() {
        let (r, hw, bus) = relay(false);
        let errors = Arc::new(Mutex::new(0));
        let e = errors.clone();
        bus.subscribe(topics::ACTUATOR_ERROR, move |_| *e.lock() += 1).unwrap();
        r.begin().unwrap();
        hw.fail_pin(23, true);
        assert!(matches!(r.activate(), Err(ActuatorError::HardwareWrite(_))));
        assert!(!r.is_active());
        assert_eq!(*errors.lock(), 1);
    }

    #[test]
    fn pulse_completes_on_update() {
        let (r, hw, _) = relay(false);
        r.begin().unwrap();
        r.pulse(Duration::from_millis(20)).unwrap();
        assert!(r.is_active());
        r.update();
        assert!(r.is_active());
        std::thread::sleep(Duration::from_millis(30));
        r.update();
        assert!(!r.is_active());
        assert_eq!(hw.level(23), Some(false));
        assert_eq!(r.pulse_remaining(), None);
    }

    #[test]
    fn pulse_without_any_duration_is_rejected() {
        let (r, _, _) = relay(false);
        r.begin().unwrap();
        assert!(r.pulse(Duration::ZERO).is_err());
        assert!(!r.is_active());
    }
}
