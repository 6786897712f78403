//! EventBus delivery guarantees: ordering, snapshot semantics, handler
//! isolation and the bounded lock wait.

use std::sync::Arc;
use std::time::Duration;

use aeroenv::app::events::{Event, Payload, topics};
use aeroenv::error::BusError;
use aeroenv::events::EventBus;
use parking_lot::Mutex;

fn log_into(bus: &EventBus, topic: &str, log: &Arc<Mutex<Vec<String>>>, tag: &'static str) {
    let log = log.clone();
    bus.subscribe(topic, move |ev: &Event| log.lock().push(format!("{tag}:{}", ev.topic())))
        .unwrap();
}

#[test]
fn handlers_run_in_registration_order() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    log_into(&bus, topics::SYSTEM_STARTUP, &log, "a");
    log_into(&bus, topics::SYSTEM_STARTUP, &log, "b");
    log_into(&bus, topics::SYSTEM_STARTUP, &log, "c");

    assert_eq!(bus.publish_new(topics::SYSTEM_STARTUP, "test", Payload::Empty), 3);
    assert_eq!(
        *log.lock(),
        vec!["a:system.startup", "b:system.startup", "c:system.startup"]
    );
}

#[test]
fn topics_match_exactly() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    log_into(&bus, topics::SENSOR_TEMPERATURE, &log, "t");

    assert_eq!(bus.publish_new(topics::SENSOR_HUMIDITY, "test", Payload::Empty), 0);
    assert_eq!(bus.publish_new("sensor.temperature.raw", "test", Payload::Empty), 0);
    assert_eq!(bus.publish_new(topics::SENSOR_TEMPERATURE, "test", Payload::Empty), 1);
    assert_eq!(log.lock().len(), 1);
    assert_eq!(bus.published_count(), 3);
}

#[test]
fn subscriber_added_during_delivery_misses_current_event() {
    let bus = Arc::new(EventBus::new());
    let late_hits = Arc::new(Mutex::new(0));

    let weak_bus = Arc::downgrade(&bus);
    let hits = late_hits.clone();
    bus.subscribe(topics::SYSTEM_METRICS, move |_| {
        if let Some(bus) = weak_bus.upgrade() {
            let hits = hits.clone();
            bus.subscribe(topics::SYSTEM_METRICS, move |_| *hits.lock() += 1)
                .unwrap();
        }
    })
    .unwrap();

    assert_eq!(bus.publish_new(topics::SYSTEM_METRICS, "test", Payload::Empty), 1);
    assert_eq!(*late_hits.lock(), 0);
    assert_eq!(bus.subscriber_count(topics::SYSTEM_METRICS), 2);

    bus.publish_new(topics::SYSTEM_METRICS, "test", Payload::Empty);
    assert_eq!(*late_hits.lock(), 1);
}

#[test]
fn nested_publish_from_handler_is_delivered() {
    let bus = Arc::new(EventBus::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    log_into(&bus, topics::SYSTEM_ERROR, &log, "err");

    let weak_bus = Arc::downgrade(&bus);
    bus.subscribe(topics::SYSTEM_SAFETY, move |_| {
        if let Some(bus) = weak_bus.upgrade() {
            bus.publish_new(topics::SYSTEM_ERROR, "nested", Payload::error("test", "from handler"));
        }
    })
    .unwrap();

    bus.publish_new(topics::SYSTEM_SAFETY, "test", Payload::Empty);
    assert_eq!(*log.lock(), vec!["err:system.error"]);
}

#[test]
fn panicking_handler_does_not_stop_the_others() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(topics::ACTUATOR_ERROR, |_| panic!("handler bug")).unwrap();
    log_into(&bus, topics::ACTUATOR_ERROR, &log, "after");

    assert_eq!(bus.publish_new(topics::ACTUATOR_ERROR, "test", Payload::Empty), 2);
    assert_eq!(log.lock().len(), 1);
    assert_eq!(bus.handler_panic_count(), 1);

    // The bus stays usable afterwards.
    bus.publish_new(topics::ACTUATOR_ERROR, "test", Payload::Empty);
    assert_eq!(log.lock().len(), 2);
}

#[test]
fn unsubscribe_removes_only_that_handler() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let id = bus
        .subscribe(topics::CONFIG_CHANGED, move |_| sink.lock().push("gone".to_string()))
        .unwrap();
    log_into(&bus, topics::CONFIG_CHANGED, &log, "kept");

    assert!(bus.unsubscribe(id).unwrap());
    assert!(!bus.unsubscribe(id).unwrap());
    bus.publish_new(topics::CONFIG_CHANGED, "test", Payload::Empty);
    assert_eq!(*log.lock(), vec!["kept:config.changed"]);
}

#[test]
fn malformed_topics_are_rejected() {
    let bus = EventBus::new();
    for topic in ["", "sensor", "sensor.", "weather.rain", "sensor.Temp", "sensor..x"] {
        assert!(
            matches!(bus.subscribe(topic, |_| {}), Err(BusError::InvalidTopic(_))),
            "subscribe accepted '{topic}'"
        );
        assert!(matches!(
            bus.try_publish(Event::new(topic, "test", Payload::Empty)),
            Err(BusError::InvalidTopic(_))
        ));
    }
    assert_eq!(bus.topic_count(), 0);
}

#[test]
fn contended_publish_is_dropped_after_timeout() {
    let bus = Arc::new(EventBus::with_lock_timeout(Duration::from_millis(20)));
    bus.subscribe(topics::SYSTEM_METRICS, |_| {
        std::thread::sleep(Duration::from_millis(200));
    })
    .unwrap();

    let holder = {
        let bus = bus.clone();
        std::thread::spawn(move || bus.publish_new(topics::SYSTEM_METRICS, "slow", Payload::Empty))
    };
    std::thread::sleep(Duration::from_millis(50));

    let result = bus.try_publish(Event::new(topics::SYSTEM_STARTUP, "test", Payload::Empty));
    assert!(matches!(result, Err(BusError::LockTimeout { .. })));
    assert_eq!(bus.publish_new(topics::SYSTEM_STARTUP, "test", Payload::Empty), 0);
    assert_eq!(bus.dropped_count(), 2);

    assert_eq!(holder.join().unwrap(), 1);
    assert_eq!(bus.publish_new(topics::SYSTEM_STARTUP, "test", Payload::Empty), 0);
    assert_eq!(bus.dropped_count(), 2);
}
