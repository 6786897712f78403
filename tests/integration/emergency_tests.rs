//! Emergency stop: preemption of running spray cycles in every phase and
//! the path from a safety-limit violation to safe outputs.

use std::time::{Duration, Instant};

use aeroenv::app::events::{Payload, topics};
use aeroenv::pins::{LIGHTS_RELAY_GPIO, SPRAY_AIR_GPIO, SPRAY_NUTRIENT_GPIO};
use aeroenv::sensors::sht3x::encode_frame;

use crate::mock_hw::{Recorder, Rig, wait_until};

const PRESSURIZE_MS: u64 = 80;
const SPRAY_MS: u64 = 160;
const PURGE_MS: u64 = 80;

fn spraying_rig() -> Rig {
    let doc = Rig::new().fast_nozzle_config(PRESSURIZE_MS, SPRAY_MS, PURGE_MS);
    let rig = Rig::with_config(&doc);
    rig.start();
    rig
}

fn all_outputs_safe(rig: &Rig) -> bool {
    let actuators = rig.coordinator.actuators();
    actuators.active_actuators().is_empty()
        && rig.hw.level(SPRAY_AIR_GPIO) == Some(false)
        && rig.hw.level(SPRAY_NUTRIENT_GPIO) == Some(false)
        && rig.hw.level(LIGHTS_RELAY_GPIO) == Some(false)
}

#[test]
fn emergency_preempts_every_nozzle_phase() {
    // Pressurizing, spraying, purging.
    for wait_ms in [20, PRESSURIZE_MS + 60, PRESSURIZE_MS + SPRAY_MS + 30] {
        let rig = spraying_rig();
        let actuators = rig.coordinator.actuators();
        actuators.start_spray(None).unwrap();
        std::thread::sleep(Duration::from_millis(wait_ms));
        assert!(actuators.is_active("spray"), "cycle ended before {wait_ms} ms");

        let t0 = Instant::now();
        rig.coordinator.emergency_stop("test");
        assert!(t0.elapsed() < Duration::from_millis(50));
        assert!(!actuators.is_active("spray"));
        assert_eq!(rig.hw.level(SPRAY_AIR_GPIO), Some(false));
        assert_eq!(rig.hw.level(SPRAY_NUTRIENT_GPIO), Some(false));

        // The cancelled sequence must never reopen a valve.
        std::thread::sleep(Duration::from_millis(PRESSURIZE_MS + SPRAY_MS + PURGE_MS));
        let reopened = rig
            .hw
            .digital_history(SPRAY_NUTRIENT_GPIO)
            .iter()
            .filter(|(at, high)| *high && *at > t0)
            .count();
        assert_eq!(reopened, 0);
        assert_eq!(rig.hw.level(SPRAY_AIR_GPIO), Some(false));
    }
}

#[test]
fn emergency_drives_every_actuator_safe() {
    let rig = spraying_rig();
    let events = Recorder::attach(&rig.bus, &[topics::SYSTEM_EMERGENCY, topics::SYSTEM_ERROR]);
    let actuators = rig.coordinator.actuators();
    actuators.activate("lights").unwrap();
    actuators.set_level("fan", 60.0).unwrap();
    actuators.start_spray(None).unwrap();
    assert_eq!(actuators.active_actuators().len(), 3);

    rig.coordinator.emergency_stop("operator");

    assert!(all_outputs_safe(&rig));
    assert_eq!(actuators.level("fan"), Some(0.0));
    assert_eq!(rig.hw.pwm_duty(0), Some(0));
    assert_eq!(events.count(topics::SYSTEM_EMERGENCY), 1);
    assert!(events.payloads(topics::SYSTEM_ERROR).iter().any(
        |p| matches!(p, Payload::Emergency { reason } if reason == "operator")
    ));
    assert_eq!(rig.coordinator.emergency_stop_count(), 1);
}

#[test]
fn over_temperature_reading_trips_emergency_stop() {
    let rig = spraying_rig();
    let events = Recorder::attach(&rig.bus, &[topics::SYSTEM_SAFETY]);
    let actuators = rig.coordinator.actuators();
    actuators.activate("lights").unwrap();
    actuators.start_spray(None).unwrap();

    // 60 °C: raw = (60 + 45) / 175 * 65535.
    rig.hw.set_i2c_response(0x44, &encode_frame(39_321, 0x8000));
    assert!(rig.coordinator.sensors().read_all());

    assert_eq!(events.count(topics::SYSTEM_SAFETY), 1);
    assert!(all_outputs_safe(&rig));
    assert_eq!(rig.coordinator.emergency_stop_count(), 1);

    // Same episode: no second alarm while the limit stays exceeded.
    rig.coordinator.sensors().read_all();
    assert_eq!(events.count(topics::SYSTEM_SAFETY), 1);
}

#[test]
fn emergency_is_safe_before_startup_and_after_shutdown() {
    let rig = Rig::new();
    rig.coordinator.emergency_stop("early");
    assert_eq!(rig.coordinator.emergency_stop_count(), 1);

    rig.start();
    let actuators = rig.coordinator.actuators();
    actuators.activate("lights").unwrap();
    rig.coordinator.shutdown();
    assert_eq!(rig.hw.level(LIGHTS_RELAY_GPIO), Some(false));
    rig.coordinator.emergency_stop("late");
    assert!(actuators.active_actuators().is_empty());
    assert_eq!(rig.coordinator.emergency_stop_count(), 2);
}

#[test]
fn emergency_with_stuck_nutrient_valve_keeps_air_flowing() {
    let rig = spraying_rig();
    let errors = Recorder::attach(&rig.bus, &[topics::ACTUATOR_ERROR]);
    let actuators = rig.coordinator.actuators();
    actuators.start_spray(None).unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        rig.hw.level(SPRAY_NUTRIENT_GPIO) == Some(true)
    }));

    rig.hw.fail_pin(SPRAY_NUTRIENT_GPIO, true);
    assert_eq!(actuators.emergency_stop_all("stuck valve"), 1);
    assert_eq!(errors.count(topics::ACTUATOR_ERROR), 1);
    assert!(actuators.is_active("spray"));
    assert_eq!(rig.hw.level(SPRAY_AIR_GPIO), Some(true));
    assert_eq!(rig.hw.level(SPRAY_NUTRIENT_GPIO), Some(true));
    assert!(actuators.start_spray(None).is_err());

    rig.hw.fail_pin(SPRAY_NUTRIENT_GPIO, false);
    assert_eq!(actuators.emergency_stop_all("retry"), 0);
    assert!(!actuators.is_active("spray"));
    assert_eq!(rig.hw.level(SPRAY_AIR_GPIO), Some(false));
    assert_eq!(rig.hw.level(SPRAY_NUTRIENT_GPIO), Some(false));
}
