//! Venturi nozzle sequencing through the full stack, measured on the
//! simulated output pins.

use std::time::Duration;

use aeroenv::app::events::{Payload, topics};
use aeroenv::drivers::nozzle::{self, NozzleTiming};
use aeroenv::error::ActuatorError;
use aeroenv::pins::{SPRAY_AIR_GPIO, SPRAY_NUTRIENT_GPIO};

use crate::mock_hw::{Recorder, Rig, wait_until};

const TOLERANCE: Duration = Duration::from_millis(40);

fn fast_rig(pressurize: u64, spray: u64, purge: u64) -> Rig {
    let doc = Rig::new().fast_nozzle_config(pressurize, spray, purge);
    let rig = Rig::with_config(&doc);
    rig.start();
    rig
}

fn within(actual: Duration, expected: Duration) -> bool {
    actual + Duration::from_millis(5) >= expected && actual <= expected + TOLERANCE
}

#[test]
fn default_nozzle_timing_is_one_five_one_seconds() {
    let rig = Rig::new();
    let spray = rig
        .capability
        .default_actuators()
        .into_iter()
        .find(|a| a.kind == nozzle::KIND)
        .unwrap();
    let timing = NozzleTiming::from_config(&spray);
    assert_eq!(timing.pressurize, Duration::from_millis(1_000));
    assert_eq!(timing.spray, Duration::from_millis(5_000));
    assert_eq!(timing.purge, Duration::from_millis(1_000));
    assert_eq!(timing.total(), Duration::from_millis(7_000));
}

#[test]
fn valve_edges_follow_the_phase_intervals() {
    let rig = fast_rig(100, 300, 100);
    let actuators = rig.coordinator.actuators();

    assert_eq!(actuators.start_spray(None).unwrap(), 1);
    assert!(actuators.is_active("spray"));
    assert!(wait_until(Duration::from_secs(3), || !actuators.is_active("spray")));

    let air = rig.hw.digital_history(SPRAY_AIR_GPIO);
    let nutrient = rig.hw.digital_history(SPRAY_NUTRIENT_GPIO);
    // Index 0 is the "closed" write from begin().
    assert_eq!(air.iter().map(|(_, high)| *high).collect::<Vec<_>>(), vec![false, true, false]);
    assert_eq!(
        nutrient.iter().map(|(_, high)| *high).collect::<Vec<_>>(),
        vec![false, true, false]
    );

    let (air_open, air_close) = (air[1].0, air[2].0);
    let (nut_open, nut_close) = (nutrient[1].0, nutrient[2].0);
    assert!(within(nut_open - air_open, Duration::from_millis(100)));
    assert!(within(nut_close - nut_open, Duration::from_millis(300)));
    assert!(within(air_close - nut_close, Duration::from_millis(100)));
}

#[test]
fn phase_events_arrive_in_order() {
    let rig = fast_rig(30, 60, 30);
    let events = Recorder::attach(
        &rig.bus,
        &[
            topics::ACTUATOR_ACTIVATED,
            topics::NOZZLE_AIR_OPEN,
            topics::NOZZLE_NUTRIENT_OPEN,
            topics::NOZZLE_NUTRIENT_CLOSE,
            topics::NOZZLE_AIR_CLOSE,
            topics::ACTUATOR_DEACTIVATED,
        ],
    );
    let actuators = rig.coordinator.actuators();
    actuators.start_spray(Some("1")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        events.count(topics::ACTUATOR_DEACTIVATED) == 1
    }));

    assert_eq!(
        events.topics(),
        vec![
            topics::NOZZLE_AIR_OPEN,
            topics::ACTUATOR_ACTIVATED,
            topics::NOZZLE_NUTRIENT_OPEN,
            topics::NOZZLE_NUTRIENT_CLOSE,
            topics::NOZZLE_AIR_CLOSE,
            topics::ACTUATOR_DEACTIVATED,
        ]
    );
    match &events.payloads(topics::ACTUATOR_DEACTIVATED)[0] {
        Payload::ActuatorState { name, duration_ms, .. } => {
            assert_eq!(name, "spray");
            assert!(duration_ms.is_some_and(|ms| ms >= 115));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn spray_intent_over_the_bus_starts_a_cycle() {
    let rig = fast_rig(50, 100, 50);
    let delivered = rig.bus.publish_new(
        topics::ACTUATOR_NOZZLE_ACTIVATE,
        "test",
        Payload::Spray {
            nozzle: Some("spray".into()),
        },
    );
    assert!(delivered >= 1);
    let actuators = rig.coordinator.actuators();
    assert!(actuators.is_active("spray"));
    assert!(wait_until(Duration::from_secs(2), || !actuators.is_active("spray")));
}

#[test]
fn unknown_selector_and_overlapping_start_are_rejected() {
    let rig = fast_rig(200, 200, 200);
    let actuators = rig.coordinator.actuators();

    assert!(matches!(actuators.start_spray(Some("2")), Err(ActuatorError::NotFound(_))));
    assert!(matches!(actuators.start_spray(Some("mister")), Err(ActuatorError::NotFound(_))));

    actuators.start_spray(None).unwrap();
    assert_eq!(actuators.start_spray(Some("spray")), Err(ActuatorError::Busy));
    assert_eq!(actuators.stop_spray(None).unwrap(), 1);
    assert!(!actuators.is_active("spray"));
}
