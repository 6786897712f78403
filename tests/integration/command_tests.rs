//! Commands end to end: JSON in, intent over the bus, actuator moved, one
//! confirmation out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aeroenv::app::commands::{Command, CommandHandler, CommandStatus};
use aeroenv::app::events::{Payload, topics};
use aeroenv::app::ports::RestartPort;
use aeroenv::config::SensorConfig;
use aeroenv::managers::Managed;
use aeroenv::pins::LIGHTS_RELAY_GPIO;
use aeroenv::sensors::pressure;
use serde_json::json;

use crate::mock_hw::{Recorder, Rig, wait_until};

#[derive(Default)]
struct CountingRestart {
    calls: AtomicUsize,
}

impl RestartPort for CountingRestart {
    fn restart(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    rig: Rig,
    handler: Arc<CommandHandler>,
    restart: Arc<CountingRestart>,
    statuses: Recorder,
}

fn harness() -> Harness {
    let doc = Rig::new().fast_nozzle_config(30, 60, 30);
    let rig = Rig::with_config(&doc);
    rig.start();
    let restart = Arc::new(CountingRestart::default());
    let handler = Arc::new(CommandHandler::with_restart_delay(
        rig.bus.clone(),
        restart.clone(),
        Duration::from_millis(20),
    ));
    handler.begin().unwrap();
    let statuses = Recorder::attach(&rig.bus, &[topics::COMMAND_STATUS]);
    Harness {
        rig,
        handler,
        restart,
        statuses,
    }
}

fn confirmations(h: &Harness) -> Vec<(String, CommandStatus)> {
    h.statuses
        .payloads(topics::COMMAND_STATUS)
        .into_iter()
        .filter_map(|p| match p {
            Payload::Status(s) => Some((s.command_id, s.status)),
            _ => None,
        })
        .collect()
}

#[test]
fn lights_commands_drive_the_relay() {
    let h = harness();
    let on = h
        .handler
        .process_json(r#"{"id":"c1","type":"lights","action":"on"}"#, "api");
    assert_eq!(on.status, CommandStatus::Completed);
    assert_eq!(h.rig.hw.level(LIGHTS_RELAY_GPIO), Some(true));

    h.handler
        .process_json(r#"{"id":"c2","type":"lights","action":"toggle"}"#, "display");
    assert_eq!(h.rig.hw.level(LIGHTS_RELAY_GPIO), Some(false));

    assert_eq!(
        confirmations(&h),
        vec![
            ("c1".to_owned(), CommandStatus::Completed),
            ("c2".to_owned(), CommandStatus::Completed)
        ]
    );
}

#[test]
fn commands_published_on_the_bus_are_executed() {
    let h = harness();
    let cmd = Command::new("bus-1", "spray", "cycle", "api").with_params(json!({ "nozzle": 1 }));
    h.rig
        .bus
        .publish_new(topics::COMMAND_RECEIVED, "transport", Payload::Command(cmd));

    let actuators = h.rig.coordinator.actuators();
    assert!(actuators.is_active("spray"));
    assert_eq!(confirmations(&h), vec![("bus-1".to_owned(), CommandStatus::Completed)]);
    assert!(wait_until(Duration::from_secs(2), || !actuators.is_active("spray")));
    assert_eq!(h.handler.processed_count(), 1);
}

#[test]
fn spray_on_and_off() {
    let h = harness();
    let actuators = h.rig.coordinator.actuators();
    h.handler.process(&Command::new("s1", "spray", "on", "api"));
    assert!(actuators.is_active("spray"));
    h.handler.process(&Command::new("s2", "spray", "off", "api"));
    assert!(!actuators.is_active("spray"));
    assert_eq!(confirmations(&h).len(), 2);
}

#[test]
fn every_rejection_still_confirms_once() {
    let h = harness();
    let inputs = [
        r#"{"id":"x1","type":"heater","action":"on"}"#,
        r#"{"id":"x2","type":"lights","action":"dim"}"#,
        r#"{"id":"x3","type":"spray"}"#,
        "not json at all",
    ];
    for text in inputs {
        let c = h.handler.process_json(text, "api");
        assert_eq!(c.status, CommandStatus::Error, "{text}");
    }
    let seen = confirmations(&h);
    assert_eq!(seen.len(), inputs.len());
    assert_eq!(seen[0].0, "x1");
    assert_eq!(seen[2].0, "x3");
    assert_eq!(seen[3].0, "");
    assert_eq!(h.handler.failed_count(), 4);
}

#[test]
fn lights_schedule_is_acknowledged_pending() {
    let h = harness();
    let c = h.handler.process(&Command::new("sch", "lights", "schedule", "api"));
    assert_eq!(c.status, CommandStatus::Pending);
    assert_eq!(h.rig.hw.level(LIGHTS_RELAY_GPIO), Some(false));
}

#[test]
fn intent_without_listener_is_an_error() {
    let h = harness();
    h.rig.coordinator.shutdown();
    let c = h.handler.process(&Command::new("late", "lights", "on", "api"));
    assert_eq!(c.status, CommandStatus::Error);
    assert_eq!(confirmations(&h), vec![("late".to_owned(), CommandStatus::Error)]);
}

#[test]
fn restart_confirms_before_resetting() {
    let h = harness();
    let c = h.handler.process(&Command::new("r1", "system", "restart", "api"));
    assert_eq!(c.status, CommandStatus::Completed);
    assert_eq!(confirmations(&h).len(), 1);
    assert!(wait_until(Duration::from_secs(1), || h.restart.calls.load(Ordering::SeqCst) == 1));
}

#[test]
fn commands_after_failed_startup_confirm_an_error() {
    let rig = Rig::new();
    let mut doc = rig.fast_nozzle_config(30, 60, 30);
    doc.sensors.push(SensorConfig {
        pin: 39,
        ..SensorConfig::new("pressure", pressure::KIND)
    });
    let rig = Rig::with_config(&doc);
    assert!(rig.coordinator.begin().is_err());
    assert!(!rig.coordinator.is_ready());
    assert!(!rig.coordinator.monitor().is_ready());

    let handler = Arc::new(CommandHandler::new(rig.bus.clone(), Arc::new(CountingRestart::default())));
    handler.begin().unwrap();
    let statuses = Recorder::attach(&rig.bus, &[topics::COMMAND_STATUS]);

    let c = handler.process_json(r#"{"id":"d1","type":"lights","action":"on"}"#, "api");
    assert_eq!(c.status, CommandStatus::Error);
    assert_eq!(statuses.count(topics::COMMAND_STATUS), 1);
    assert_ne!(rig.hw.level(LIGHTS_RELAY_GPIO), Some(true));
}
