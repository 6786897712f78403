//! Whole-device lifecycle through the DeviceCoordinator.

use std::sync::Arc;
use std::time::Duration;

use aeroenv::app::events::{Payload, topics};
use aeroenv::config::SensorConfig;
use aeroenv::managers::monitor::{Health, SystemMonitor};
use aeroenv::managers::{Managed, ManagerState, Stage};
use aeroenv::sensors::{pressure, sht3x};

use crate::mock_hw::{FixedProbe, Recorder, Rig, wait_until};

#[test]
fn boot_publishes_startup_and_reports_status() {
    let rig = Rig::new();
    let events = Recorder::attach(&rig.bus, &[topics::SYSTEM_STARTUP, topics::SYSTEM_METRICS]);
    rig.start();

    assert!(rig.coordinator.is_ready());
    assert_eq!(events.count(topics::SYSTEM_STARTUP), 1);
    // The monitor samples once as soon as it is up.
    assert!(events.count(topics::SYSTEM_METRICS) >= 1);

    let summary = rig.coordinator.status_summary();
    assert_eq!(summary.device_type, "environmental");
    assert_eq!(summary.sensors, vec!["sht3x", "pressure"]);
    assert_eq!(
        summary.stages.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(),
        Stage::ORDER.iter().map(ToString::to_string).collect::<Vec<_>>()
    );
    assert!(summary.healthy);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["ready"], true);
    assert_eq!(json["actuators"][1], "spray");
}

#[test]
fn readings_flow_from_sensors_to_cache_and_bus() {
    let rig = Rig::new();
    let events = Recorder::attach(
        &rig.bus,
        &[topics::SENSOR_TEMPERATURE, topics::SENSOR_HUMIDITY, topics::SENSOR_PRESSURE],
    );
    rig.start();
    let sensors = rig.coordinator.sensors();
    assert!(sensors.read_all());

    let climate = sensors.readings_for("sht3x");
    assert_eq!(climate.len(), 2);
    let temperature = sensors.readings_by_kind("temperature");
    assert!((temperature[0].value - 25.0).abs() < 0.1);
    assert!(sensors.reading("pressure").valid);
    assert!(!sensors.reading("nonexistent").valid);

    assert!(events.count(topics::SENSOR_TEMPERATURE) >= 1);
    assert!(events.count(topics::SENSOR_HUMIDITY) >= 1);
    match events.payloads(topics::SENSOR_PRESSURE).last() {
        Some(Payload::Reading { sensor, unit, .. }) => {
            assert_eq!(sensor, "pressure");
            assert_eq!(unit, "psi");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn broken_sensor_is_reported_but_not_fatal() {
    let rig = Rig::new();
    let errors = Recorder::attach(&rig.bus, &[topics::SENSOR_ERROR]);
    rig.start();
    rig.hw.fail_i2c(0x44, true);

    let sensors = rig.coordinator.sensors();
    assert!(!sensors.read_all());
    assert!(errors.count(topics::SENSOR_ERROR) >= 1);
    assert!(sensors.reading("pressure").valid);
    assert!(rig.coordinator.is_ready());
}

#[test]
fn sensors_can_be_added_and_removed_at_runtime() {
    let rig = Rig::new();
    rig.start();
    let sensors = rig.coordinator.sensors();

    let mut spare = SensorConfig::new("root-zone", pressure::KIND);
    spare.pin = 39;
    rig.hw.set_adc(39, 1500);
    sensors.add_sensor(&spare).unwrap();
    assert!(sensors.add_sensor(&spare).is_err());
    assert_eq!(sensors.sensor_count(), 3);
    assert!(sensors.read_all());
    assert!(sensors.reading("root-zone").valid);

    assert!(sensors.remove_sensor("root-zone"));
    assert!(!sensors.remove_sensor("root-zone"));
    assert!(sensors.readings_for("root-zone").is_empty());
}

#[test]
fn reconfigure_picks_up_new_sensor_list() {
    let rig = Rig::new();
    rig.start();
    let mut only_climate = SensorConfig::new("sht3x", sht3x::KIND);
    only_climate.i2c_address = 0x44;
    rig.config.remove_sensor("pressure");
    rig.config.upsert_sensor(only_climate);

    let sensors = rig.coordinator.sensors();
    sensors.reconfigure().unwrap();
    assert_eq!(sensors.sensor_names(), vec!["sht3x"]);
    assert_eq!(rig.coordinator.stage_state(Stage::SensorManager), ManagerState::Ready);
}

#[test]
fn shutdown_then_restart_cycles_cleanly() {
    let rig = Rig::new();
    let events = Recorder::attach(&rig.bus, &[topics::SYSTEM_SHUTDOWN, topics::SYSTEM_STARTUP]);
    rig.start();
    rig.coordinator.actuators().activate("lights").unwrap();

    rig.coordinator.restart().unwrap();
    assert!(rig.coordinator.is_ready());
    assert!(rig.coordinator.actuators().active_actuators().is_empty());
    assert_eq!(
        events.topics(),
        vec![topics::SYSTEM_STARTUP, topics::SYSTEM_SHUTDOWN, topics::SYSTEM_STARTUP]
    );
    assert_eq!(rig.coordinator.stage_state(Stage::Config), ManagerState::Ready);
}

#[test]
fn low_heap_degrades_health_and_raises_alarm() {
    let rig = Rig::new();
    rig.config.begin().unwrap();
    let errors = Recorder::attach(&rig.bus, &[topics::SYSTEM_ERROR]);
    let monitor = Arc::new(SystemMonitor::with_interval(
        rig.config.clone(),
        Arc::new(FixedProbe {
            free_heap: 4_000,
            rssi: Some(-90),
        }),
        rig.bus.clone(),
        Duration::from_secs(60),
    ));
    monitor.begin().unwrap();

    assert!(wait_until(Duration::from_millis(200), || monitor.last_metrics().is_some()));
    let status = monitor.health_status();
    assert_eq!(status.health, Health::Critical);
    assert!(status.conditions.iter().any(|c| c.contains("heap")));
    assert!(status.conditions.iter().any(|c| c.contains("WiFi")));
    assert_eq!(errors.count(topics::SYSTEM_ERROR), 2);

    // Still the same episode: nothing new.
    monitor.sample();
    assert_eq!(errors.count(topics::SYSTEM_ERROR), 2);
    assert_eq!(monitor.alarm_count(), 2);
    monitor.shutdown();
}
