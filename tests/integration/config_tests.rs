//! ConfigStore persistence and validation against the environmental
//! device's hardware rules.

use aeroenv::adapters::nvs::NvsStorage;
use aeroenv::app::config_store::{CONFIG_KEY, ConfigStore, NAMESPACE};
use aeroenv::app::events::topics;
use aeroenv::app::ports::StoragePort;
use aeroenv::config::{ActuatorConfig, SensorConfig};
use aeroenv::drivers::{nozzle, relay};
use aeroenv::error::ConfigError;
use aeroenv::managers::ManagerState;
use aeroenv::sensors::pressure;

use crate::mock_hw::{Recorder, Rig};

fn reopen(rig: &Rig) -> ConfigStore {
    ConfigStore::new(
        Box::new(rig.nvs.clone()),
        Some(rig.capability.clone()),
        rig.bus.clone(),
    )
}

#[test]
fn first_boot_persists_device_defaults() {
    let rig = Rig::new();
    assert!(!rig.nvs.exists(NAMESPACE, CONFIG_KEY));
    rig.config.begin().unwrap();

    assert!(rig.nvs.exists(NAMESPACE, CONFIG_KEY));
    assert_eq!(rig.config.state(), ManagerState::Ready);
    assert_eq!(rig.config.sensors().len(), 2);
    assert_eq!(
        rig.config.actuators().iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        vec!["lights", "spray", "fan"]
    );
    assert!(!rig.config.is_dirty());
}

#[test]
fn saved_changes_survive_a_reboot() {
    let rig = Rig::new();
    rig.config.begin().unwrap();
    let events = Recorder::attach(&rig.bus, &[topics::CONFIG_CHANGED, topics::CONFIG_SAVED]);

    let mut vent = ActuatorConfig::new("vent", relay::KIND, 19);
    vent.pulse_width_ms = 1_500;
    rig.config.upsert_actuator(vent.clone());
    let mut safety = rig.config.safety();
    safety.max_temperature_c = 38.0;
    rig.config.set_safety(safety);
    assert!(rig.config.is_dirty());
    rig.config.save().unwrap();

    assert_eq!(events.count(topics::CONFIG_CHANGED), 2);
    assert_eq!(events.count(topics::CONFIG_SAVED), 1);

    let rebooted = reopen(&rig);
    rebooted.begin().unwrap();
    assert_eq!(rebooted.snapshot(), rig.config.snapshot());
    assert!(rebooted.actuators().contains(&vent));
    assert!((rebooted.safety().max_temperature_c - 38.0).abs() < f32::EPSILON);
}

#[test]
fn upsert_replaces_by_name() {
    let rig = Rig::new();
    rig.config.begin().unwrap();
    let mut lights = ActuatorConfig::new("lights", relay::KIND, 18);
    lights.invert_logic = true;
    rig.config.upsert_actuator(lights);

    let all = rig.config.actuators();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].pin, 18);
    assert!(all[0].invert_logic);

    assert!(rig.config.remove_actuator("lights"));
    assert!(!rig.config.remove_actuator("lights"));
    assert_eq!(rig.config.actuators().len(), 2);
}

#[test]
fn duplicate_names_block_startup() {
    let rig = Rig::new();
    let mut doc = rig.fast_nozzle_config(1_000, 5_000, 1_000);
    doc.sensors.push(SensorConfig {
        pin: 39,
        ..SensorConfig::new("pressure", pressure::KIND)
    });
    let rig = Rig::with_config(&doc);

    match rig.config.begin() {
        Err(ConfigError::Invalid(errors)) => {
            assert!(errors.iter().any(|e| e.contains("Duplicate sensor name 'pressure'")));
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
    assert_eq!(rig.config.state(), ManagerState::Error);
    assert!(rig.coordinator.begin().is_err());
}

#[test]
fn device_rules_reject_unusable_pins() {
    let rig = Rig::new();
    rig.config.begin().unwrap();

    // Pressure must be on ADC1; GPIO 4 is ADC2.
    rig.config.upsert_sensor(SensorConfig {
        pin: 4,
        ..SensorConfig::new("pressure", pressure::KIND)
    });
    // GPIO 34 is input-only.
    rig.config.upsert_actuator(ActuatorConfig::new("lights", relay::KIND, 34));
    let mut spray = ActuatorConfig::new("spray", nozzle::KIND, 25);
    spray.aux_pin = 25;
    spray.pulse_width_ms = 2_000;
    rig.config.upsert_actuator(spray);

    let report = rig.config.validate();
    assert!(!report.is_valid());
    assert!(report.errors.iter().any(|e| e.contains("'pressure'") && e.contains("ADC1")));
    assert!(report.errors.iter().any(|e| e.contains("'lights'") && e.contains("34")));
    assert!(report.errors.iter().any(|e| e.contains("'spray'") && e.contains("different pins")));
}

#[test]
fn unparseable_blob_is_replaced_with_defaults() {
    let mut nvs = NvsStorage::new();
    nvs.write(NAMESPACE, CONFIG_KEY, b"{ not json").unwrap();
    let rig = Rig::new();
    let store = ConfigStore::new(Box::new(nvs.clone()), Some(rig.capability.clone()), rig.bus.clone());

    store.begin().unwrap();
    assert_eq!(store.state(), ManagerState::Ready);
    assert_eq!(store.actuators().len(), 3);
    let persisted = nvs.read(NAMESPACE, CONFIG_KEY).unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&persisted).is_ok());
}

#[test]
fn rejected_reload_keeps_running_configuration() {
    let rig = Rig::new();
    rig.config.begin().unwrap();
    let before = rig.config.snapshot();

    let mut broken = before.clone();
    broken.safety.min_temperature_c = 50.0;
    let mut nvs = rig.nvs.clone();
    nvs.write(NAMESPACE, CONFIG_KEY, &serde_json::to_vec(&broken).unwrap())
        .unwrap();

    assert!(matches!(rig.config.reload(), Err(ConfigError::Invalid(_))));
    assert_eq!(rig.config.snapshot(), before);
    assert_eq!(rig.config.state(), ManagerState::Ready);
}

#[test]
fn failed_write_keeps_store_dirty() {
    let rig = Rig::new();
    rig.config.begin().unwrap();
    rig.config.upsert_sensor(SensorConfig::new("probe", "DS18B20"));
    rig.nvs.set_read_only(true);

    assert!(matches!(rig.config.save(), Err(ConfigError::Storage(_))));
    assert!(rig.config.is_dirty());

    rig.nvs.set_read_only(false);
    rig.config.save().unwrap();
    assert!(!rig.config.is_dirty());
}
