//! SystemMonitor: periodic health sampling and safety-limit supervision.
//!
//! Every `health_check_interval` the monitor samples the [`SystemProbe`],
//! publishes a [`RuntimeMetrics`] snapshot on `system.metrics` and raises
//! `system.error` alarms for low heap or weak WiFi.  It also watches the
//! climate and pressure readings on the bus: a reading beyond a
//! [`SafetyConfig`] limit raises one `system.safety` alarm per violation
//! episode, and a sensor that goes quiet for longer than
//! `sensor_timeout_ms` is reported stale once until it reports again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use heapless::HistoryBuffer;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use super::{Lifecycle, Managed, ManagerState};
use crate::adapters::time::uptime_ms;
use crate::app::config_store::ConfigStore;
use crate::app::events::{Event, Payload, topics};
use crate::app::ports::SystemProbe;
use crate::config::SafetyConfig;
use crate::diagnostics::RuntimeMetrics;
use crate::drivers::task_pin::PeriodicTask;
use crate::error::ManagerError;
use crate::events::{EventBus, SubscriptionId};

const SOURCE: &str = "SystemMonitor";
const TASK_NAME: &str = "sys-monitor\0";
const TASK_STACK_KB: usize = 4;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(5000);
pub const MIN_FREE_HEAP: u32 = 10_000;
pub const MIN_WIFI_RSSI: i8 = -80;
pub const ALARM_HISTORY: usize = 8;

/// Reading topics checked against the safety limits.
const WATCHED: [&str; 3] = [
    topics::SENSOR_TEMPERATURE,
    topics::SENSOR_HUMIDITY,
    topics::SENSOR_PRESSURE,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alarm {
    pub source: String,
    pub message: String,
    /// Milliseconds since boot.
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    /// Stale sensors or a weak link; control still works.
    Degraded,
    /// Low memory or a safety limit is being exceeded.
    Critical,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub health: Health,
    /// One line per active condition.
    pub conditions: Vec<String>,
}

#[derive(Default)]
struct Watch {
    last_metrics: Option<RuntimeMetrics>,
    alarms: HistoryBuffer<Alarm, ALARM_HISTORY>,
    alarm_count: u32,
    low_heap: bool,
    weak_link: bool,
    last_seen: HashMap<String, Instant>,
    stale: HashSet<String>,
    /// `"<sensor>/<limit>"` keys currently beyond their limit.
    violations: HashSet<String>,
}

/// Alarms collected under the state lock, published after it is released.
type Pending = Vec<(&'static str, Payload)>;

pub struct SystemMonitor {
    lifecycle: Lifecycle,
    config: Arc<ConfigStore>,
    probe: Arc<dyn SystemProbe>,
    interval: Duration,
    crash_count: AtomicU32,
    watch: Mutex<Watch>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl SystemMonitor {
    pub fn new(config: Arc<ConfigStore>, probe: Arc<dyn SystemProbe>, bus: Arc<EventBus>) -> Self {
        Self::with_interval(config, probe, bus, HEALTH_CHECK_INTERVAL)
    }

    pub fn with_interval(
        config: Arc<ConfigStore>,
        probe: Arc<dyn SystemProbe>,
        bus: Arc<EventBus>,
        interval: Duration,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(SOURCE, bus),
            config,
            probe,
            interval,
            crash_count: AtomicU32::new(0),
            watch: Mutex::new(Watch::default()),
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    /// Crashes found in the crash log at boot, reported in every sample.
    pub fn set_crash_count(&self, count: u32) {
        self.crash_count.store(count, Ordering::Relaxed);
    }

    pub fn begin(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.lifecycle.transition(ManagerState::Initializing)?;

        let bus = self.lifecycle.bus();
        let mut ids = Vec::with_capacity(WATCHED.len());
        for topic in WATCHED {
            let weak: Weak<Self> = Arc::downgrade(self);
            let subscribed = bus.subscribe(topic, move |ev: &Event| {
                if let Some(monitor) = weak.upgrade() {
                    monitor.on_reading(ev);
                }
            });
            match subscribed {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        let _ = bus.unsubscribe(id);
                    }
                    let err = ManagerError::Spawn(format!("bus subscription failed: {e}"));
                    self.lifecycle.fail(&err);
                    return Err(err);
                }
            }
        }
        *self.subscriptions.lock() = ids;

        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = PeriodicTask::spawn(TASK_NAME, self.interval, TASK_STACK_KB, move || {
            let Some(monitor) = weak.upgrade() else {
                return false;
            };
            monitor.sample();
            true
        });
        match spawned {
            Ok(task) => *self.task.lock() = Some(task),
            Err(e) => {
                self.unsubscribe_all();
                let err = ManagerError::Spawn(e.to_string());
                self.lifecycle.fail(&err);
                return Err(err);
            }
        }

        self.lifecycle.transition(ManagerState::Ready)?;
        self.sample();
        Ok(())
    }

    /// Take one health sample now and publish it.
    pub fn sample(&self) -> RuntimeMetrics {
        let bus = self.lifecycle.bus();
        let safety = self.config.safety();
        let mut pending: Pending = Vec::new();

        let metrics = {
            let mut watch = self.watch.lock();
            let free_heap = self.probe.free_heap();
            let rssi = self.probe.wifi_rssi();

            let low_heap = free_heap < MIN_FREE_HEAP;
            if low_heap && !watch.low_heap {
                raise(
                    &mut watch,
                    &mut pending,
                    topics::SYSTEM_ERROR,
                    alarm("heap", format!("free heap {free_heap} B below {MIN_FREE_HEAP} B"))
                        .with_values(free_heap as f32, MIN_FREE_HEAP as f32),
                );
            }
            watch.low_heap = low_heap;

            let weak_link = rssi.is_some_and(|r| r < MIN_WIFI_RSSI);
            if weak_link && !watch.weak_link {
                let r = rssi.unwrap_or_default();
                raise(
                    &mut watch,
                    &mut pending,
                    topics::SYSTEM_ERROR,
                    alarm("wifi", format!("RSSI {r} dBm below {MIN_WIFI_RSSI} dBm"))
                        .with_values(f32::from(r), f32::from(MIN_WIFI_RSSI)),
                );
            }
            watch.weak_link = weak_link;

            check_stale(&mut watch, &mut pending, &safety);

            let metrics = RuntimeMetrics {
                uptime_secs: self.probe.uptime_ms() / 1000,
                free_heap,
                min_free_heap: self.probe.min_free_heap(),
                wifi_rssi: rssi,
                events_published: bus.published_count(),
                events_dropped: bus.dropped_count(),
                handler_panics: bus.handler_panic_count(),
                alarms_raised: watch.alarm_count,
                crash_count: self.crash_count.load(Ordering::Relaxed),
            };
            watch.last_metrics = Some(metrics.clone());
            metrics
        };

        for (topic, payload) in pending {
            bus.publish_new(topic, SOURCE, payload);
        }
        bus.publish_new(topics::SYSTEM_METRICS, SOURCE, Payload::Metrics(metrics.clone()));
        metrics
    }

    fn on_reading(&self, ev: &Event) {
        let Payload::Reading { sensor, value, .. } = ev.payload() else {
            return;
        };
        let safety = self.config.safety();
        let mut pending: Pending = Vec::new();
        {
            let mut watch = self.watch.lock();
            watch.last_seen.insert(sensor.clone(), Instant::now());
            if watch.stale.remove(sensor) {
                info!("SystemMonitor: '{sensor}' reporting again");
            }

            for (limit_name, limit, exceeded) in limits_for(ev.topic(), *value, &safety) {
                let key = format!("{sensor}/{limit_name}");
                if !exceeded {
                    watch.violations.remove(&key);
                    continue;
                }
                if !watch.violations.insert(key) {
                    continue;
                }
                raise(
                    &mut watch,
                    &mut pending,
                    topics::SYSTEM_SAFETY,
                    alarm(sensor, format!("{} {limit_name} exceeded", ev.topic()))
                        .with_values(*value, limit),
                );
            }
        }
        let bus = self.lifecycle.bus();
        for (topic, payload) in pending {
            bus.publish_new(topic, SOURCE, payload);
        }
    }

    // ── Queries ──────────────────────────────────────────────

    pub fn is_healthy(&self) -> bool {
        self.health_status().health == Health::Healthy
    }

    pub fn health_status(&self) -> HealthStatus {
        let watch = self.watch.lock();
        let mut conditions = Vec::new();
        let mut health = Health::Healthy;

        if watch.low_heap {
            health = Health::Critical;
            conditions.push("low free heap".to_owned());
        }
        if !watch.violations.is_empty() {
            health = Health::Critical;
            let mut v: Vec<&String> = watch.violations.iter().collect();
            v.sort();
            for key in v {
                conditions.push(format!("limit exceeded: {key}"));
            }
        }
        let mut degrade = |what: String| {
            if health == Health::Healthy {
                health = Health::Degraded;
            }
            conditions.push(what);
        };
        if watch.weak_link {
            degrade("weak WiFi signal".to_owned());
        }
        let mut stale: Vec<&String> = watch.stale.iter().collect();
        stale.sort();
        for name in stale {
            degrade(format!("sensor '{name}' stale"));
        }
        HealthStatus { health, conditions }
    }

    pub fn last_metrics(&self) -> Option<RuntimeMetrics> {
        self.watch.lock().last_metrics.clone()
    }

    /// Up to the last eight alarms, oldest first.
    pub fn recent_alarms(&self) -> Vec<Alarm> {
        self.watch.lock().alarms.oldest_ordered().cloned().collect()
    }

    pub fn alarm_count(&self) -> u32 {
        self.watch.lock().alarm_count
    }

    fn unsubscribe_all(&self) {
        let ids = std::mem::take(&mut *self.subscriptions.lock());
        let bus = self.lifecycle.bus();
        for id in ids {
            let _ = bus.unsubscribe(id);
        }
    }
}

impl Managed for SystemMonitor {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn state(&self) -> ManagerState {
        self.lifecycle.state()
    }

    fn last_error(&self) -> Option<String> {
        self.lifecycle.last_error()
    }

    fn shutdown(&self) {
        self.unsubscribe_all();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
        let _ = self.lifecycle.transition(ManagerState::Shutdown);
    }
}

// ── Helpers ──────────────────────────────────────────────────

struct AlarmDraft {
    source: String,
    message: String,
    value: Option<f32>,
    limit: Option<f32>,
}

impl AlarmDraft {
    fn with_values(mut self, value: f32, limit: f32) -> Self {
        self.value = Some(value);
        self.limit = Some(limit);
        self
    }
}

fn alarm(source: &str, message: String) -> AlarmDraft {
    AlarmDraft {
        source: source.to_owned(),
        message,
        value: None,
        limit: None,
    }
}

fn raise(watch: &mut Watch, pending: &mut Pending, topic: &'static str, draft: AlarmDraft) {
    warn!("SystemMonitor: {}: {}", draft.source, draft.message);
    watch.alarm_count = watch.alarm_count.saturating_add(1);
    watch.alarms.write(Alarm {
        source: draft.source.clone(),
        message: draft.message.clone(),
        at_ms: uptime_ms(),
    });
    pending.push((
        topic,
        Payload::Alarm {
            source: draft.source,
            message: draft.message,
            value: draft.value,
            limit: draft.limit,
        },
    ));
}

/// `(limit name, limit, exceeded)` for every limit that applies to `topic`.
fn limits_for(topic: &str, value: f32, safety: &SafetyConfig) -> Vec<(&'static str, f32, bool)> {
    match topic {
        topics::SENSOR_TEMPERATURE => vec![
            ("max_temperature_c", safety.max_temperature_c, value > safety.max_temperature_c),
            ("min_temperature_c", safety.min_temperature_c, value < safety.min_temperature_c),
        ],
        topics::SENSOR_HUMIDITY => vec![(
            "max_humidity_percent",
            safety.max_humidity_percent,
            value > safety.max_humidity_percent,
        )],
        topics::SENSOR_PRESSURE => vec![(
            "max_pressure_psi",
            safety.max_pressure_psi,
            value > safety.max_pressure_psi,
        )],
        _ => Vec::new(),
    }
}

fn check_stale(watch: &mut Watch, pending: &mut Pending, safety: &SafetyConfig) {
    let timeout = Duration::from_millis(safety.sensor_timeout_ms);
    let newly_stale: Vec<(String, Duration)> = watch
        .last_seen
        .iter()
        .filter(|(name, seen)| seen.elapsed() > timeout && !watch.stale.contains(*name))
        .map(|(name, seen)| (name.clone(), seen.elapsed()))
        .collect();
    for (name, silent) in newly_stale {
        watch.stale.insert(name.clone());
        raise(
            watch,
            pending,
            topics::SYSTEM_ERROR,
            alarm(&name, format!("no reading for {} ms", silent.as_millis())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsStorage;
    use crate::app::ports::StoragePort;
    use crate::app::config_store::{CONFIG_KEY, NAMESPACE};
    use crate::config::DeviceConfig;
    use std::sync::atomic::AtomicI32;

    struct FakeProbe {
        heap: AtomicU32,
        rssi: AtomicI32,
    }

    impl SystemProbe for FakeProbe {
        fn free_heap(&self) -> u32 {
            self.heap.load(Ordering::Relaxed)
        }

        fn min_free_heap(&self) -> u32 {
            self.free_heap() / 2
        }

        fn wifi_rssi(&self) -> Option<i8> {
            i8::try_from(self.rssi.load(Ordering::Relaxed)).ok()
        }
    }

    struct Rig {
        bus: Arc<EventBus>,
        probe: Arc<FakeProbe>,
        monitor: Arc<SystemMonitor>,
    }

    fn rig(sensor_timeout_ms: u64) -> Rig {
        let mut doc = DeviceConfig::default();
        doc.safety.sensor_timeout_ms = sensor_timeout_ms;
        let mut nvs = NvsStorage::new();
        nvs.write(NAMESPACE, CONFIG_KEY, &serde_json::to_vec(&doc).unwrap())
            .unwrap();
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(ConfigStore::new(Box::new(nvs), None, bus.clone()));
        store.begin().unwrap();

        let probe = Arc::new(FakeProbe {
            heap: AtomicU32::new(200_000),
            rssi: AtomicI32::new(-55),
        });
        let monitor = Arc::new(SystemMonitor::with_interval(
            store,
            probe.clone(),
            bus.clone(),
            Duration::from_secs(3600),
        ));
        Rig { bus, probe, monitor }
    }

    fn capture(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<Payload>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(topic, move |ev: &Event| sink.lock().push(ev.payload().clone()))
            .unwrap();
        seen
    }

    fn reading(bus: &EventBus, topic: &str, sensor: &str, value: f32) {
        bus.publish_new(
            topic,
            sensor,
            Payload::Reading {
                sensor: sensor.into(),
                value,
                unit: String::new(),
                timestamp_ms: 0,
            },
        );
    }

    #[test]
    fn begin_samples_immediately() {
        let r = rig(30_000);
        let metrics = capture(&r.bus, topics::SYSTEM_METRICS);
        r.monitor.begin().unwrap();
        assert!(r.monitor.is_ready());
        assert_eq!(metrics.lock().len(), 1);
        let m = r.monitor.last_metrics().unwrap();
        assert_eq!(m.free_heap, 200_000);
        assert_eq!(m.wifi_rssi, Some(-55));
        assert!(r.monitor.is_healthy());
        r.monitor.shutdown();
        assert_eq!(r.bus.subscriber_count(topics::SENSOR_TEMPERATURE), 0);
    }

    #[test]
    fn low_heap_alarms_once_per_episode() {
        let r = rig(30_000);
        r.monitor.begin().unwrap();
        let errors = capture(&r.bus, topics::SYSTEM_ERROR);

        r.probe.heap.store(5_000, Ordering::Relaxed);
        r.monitor.sample();
        r.monitor.sample();
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(r.monitor.health_status().health, Health::Critical);

        r.probe.heap.store(50_000, Ordering::Relaxed);
        r.monitor.sample();
        assert!(r.monitor.is_healthy());
        r.probe.heap.store(5_000, Ordering::Relaxed);
        r.monitor.sample();
        assert_eq!(errors.lock().len(), 2);
    }

    #[test]
    fn weak_wifi_degrades() {
        let r = rig(30_000);
        r.monitor.begin().unwrap();
        r.probe.rssi.store(-90, Ordering::Relaxed);
        let m = r.monitor.sample();
        assert_eq!(m.wifi_rssi, Some(-90));
        let status = r.monitor.health_status();
        assert_eq!(status.health, Health::Degraded);
        assert_eq!(status.conditions, vec!["weak WiFi signal"]);
    }

    #[test]
    fn safety_limits_raise_one_alarm_per_violation() {
        let r = rig(30_000);
        r.monitor.begin().unwrap();
        let safety = capture(&r.bus, topics::SYSTEM_SAFETY);

        reading(&r.bus, topics::SENSOR_TEMPERATURE, "sht3x", 25.0);
        assert!(safety.lock().is_empty());
        reading(&r.bus, topics::SENSOR_TEMPERATURE, "sht3x", 50.0);
        reading(&r.bus, topics::SENSOR_TEMPERATURE, "sht3x", 51.0);
        assert_eq!(safety.lock().len(), 1);
        match &safety.lock()[0] {
            Payload::Alarm { source, value, limit, .. } => {
                assert_eq!(source, "sht3x");
                assert_eq!(*value, Some(50.0));
                assert_eq!(*limit, Some(45.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(!r.monitor.is_healthy());

        reading(&r.bus, topics::SENSOR_TEMPERATURE, "sht3x", 20.0);
        assert!(r.monitor.is_healthy());
        reading(&r.bus, topics::SENSOR_PRESSURE, "pressure", 95.0);
        reading(&r.bus, topics::SENSOR_HUMIDITY, "sht3x", 97.0);
        assert_eq!(safety.lock().len(), 3);
        assert_eq!(r.monitor.recent_alarms().len(), 3);
    }

    #[test]
    fn stale_sensor_reported_once() {
        let r = rig(50);
        r.monitor.begin().unwrap();
        let errors = capture(&r.bus, topics::SYSTEM_ERROR);
        reading(&r.bus, topics::SENSOR_PRESSURE, "pressure", 10.0);
        std::thread::sleep(Duration::from_millis(120));
        r.monitor.sample();
        r.monitor.sample();
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(r.monitor.health_status().health, Health::Degraded);

        reading(&r.bus, topics::SENSOR_PRESSURE, "pressure", 10.0);
        assert!(r.monitor.is_healthy());
    }

    #[test]
    fn alarm_history_keeps_the_last_eight() {
        let r = rig(30_000);
        r.monitor.begin().unwrap();
        for i in 0..12 {
            let sensor = format!("s{i}");
            reading(&r.bus, topics::SENSOR_PRESSURE, &sensor, 100.0);
        }
        let recent = r.monitor.recent_alarms();
        assert_eq!(recent.len(), ALARM_HISTORY);
        assert_eq!(recent[0].source, "s4");
        assert_eq!(recent[7].source, "s11");
        assert_eq!(r.monitor.alarm_count(), 12);
    }

    #[test]
    fn metrics_carry_bus_counters_and_crashes() {
        let r = rig(30_000);
        r.monitor.set_crash_count(2);
        r.monitor.begin().unwrap();
        let m = r.monitor.sample();
        assert_eq!(m.crash_count, 2);
        assert!(m.events_published >= 1);
    }
}
