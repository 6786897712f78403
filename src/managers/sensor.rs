//! SensorManager: owns every sensor instance and the cached reading set.
//!
//! Sensors are built through the [`DeviceCapability`] factory from the
//! enabled entries of the [`ConfigStore`].  A background [`PeriodicTask`]
//! polls the sensors that are due, swaps the new reading set in as one
//! `Arc` and then publishes `sensor.<kind>` for each valid reading.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use super::{Lifecycle, Managed, ManagerState};
use crate::app::config_store::ConfigStore;
use crate::app::events::{Payload, topics};
use crate::config::SensorConfig;
use crate::device::DeviceCapability;
use crate::drivers::task_pin::PeriodicTask;
use crate::error::{ManagerError, SensorError};
use crate::events::EventBus;
use crate::sensors::{Sensor, SensorReading};

const SOURCE: &str = "SensorManager";
const TASK_NAME: &str = "sensor-read\0";
const TASK_STACK_KB: usize = 6;

/// Poll interval when no sensor declares one.
pub const DEFAULT_READ_INTERVAL: Duration = Duration::from_millis(1000);

struct Slot {
    sensor: Box<dyn Sensor>,
    last_read: Option<Instant>,
}

impl Slot {
    fn is_due(&self, now: Instant) -> bool {
        let every = Duration::from_millis(self.sensor.config().read_interval_ms);
        self.last_read.is_none_or(|t| now.duration_since(t) >= every)
    }
}

pub struct SensorManager {
    lifecycle: Lifecycle,
    config: Arc<ConfigStore>,
    capability: Option<Arc<dyn DeviceCapability>>,
    slots: Mutex<Vec<Slot>>,
    readings: RwLock<Arc<Vec<SensorReading>>>,
    interval: Mutex<Duration>,
    task: Mutex<Option<PeriodicTask>>,
}

impl SensorManager {
    pub fn new(
        config: Arc<ConfigStore>,
        capability: Option<Arc<dyn DeviceCapability>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(SOURCE, bus),
            config,
            capability,
            slots: Mutex::new(Vec::new()),
            readings: RwLock::new(Arc::new(Vec::new())),
            interval: Mutex::new(DEFAULT_READ_INTERVAL),
            task: Mutex::new(None),
        }
    }

    /// Build and start every enabled sensor, then start the read loop.
    ///
    /// Sensors that fail to come up are logged and left out; the manager
    /// only fails when none of them start.
    pub fn begin(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.lifecycle.transition(ManagerState::Initializing)?;

        let Some(capability) = self.capability.clone() else {
            self.lifecycle.fail(ManagerError::MissingCapability);
            return Err(ManagerError::MissingCapability);
        };

        let started: Vec<Slot> = self
            .config
            .sensors()
            .into_iter()
            .filter(|c| c.enabled)
            .filter_map(|c| start_sensor(capability.as_ref(), &c).ok())
            .map(|sensor| Slot {
                sensor,
                last_read: None,
            })
            .collect();

        if started.is_empty() {
            let err = ManagerError::NoInstances("sensors");
            self.lifecycle.fail(&err);
            return Err(err);
        }

        let interval = poll_interval(&started);
        info!("SensorManager: {} sensor(s) up, polling every {interval:?}", started.len());
        *self.slots.lock() = started;
        *self.interval.lock() = interval;

        if let Err(e) = self.spawn_task(interval) {
            self.release_sensors();
            self.lifecycle.fail(&e);
            return Err(e);
        }
        self.lifecycle.transition(ManagerState::Ready)
    }

    /// Read every ready sensor now, regardless of its interval.
    ///
    /// Returns `true` when at least one reading was taken and all of them
    /// were valid.
    pub fn read_all(&self) -> bool {
        self.poll(true)
    }

    /// One tick of the background loop: read only the sensors that are due.
    fn poll(&self, force: bool) -> bool {
        let now = Instant::now();
        let mut fresh: Vec<SensorReading> = Vec::new();
        {
            // Held across the swap so concurrent polls cannot lose readings.
            let mut slots = self.slots.lock();
            let mut polled: Vec<String> = Vec::new();
            for slot in slots.iter_mut() {
                if !slot.sensor.is_ready() || !(force || slot.is_due(now)) {
                    continue;
                }
                polled.push(slot.sensor.name().to_owned());
                fresh.extend(slot.sensor.read());
                slot.last_read = Some(now);
            }
            if polled.is_empty() {
                return false;
            }

            // Readings of sensors not polled this round carry over unchanged.
            let next: Vec<SensorReading> = self
                .readings
                .read()
                .iter()
                .filter(|r| !polled.contains(&r.sensor_name))
                .cloned()
                .chain(fresh.iter().cloned())
                .collect();
            *self.readings.write() = Arc::new(next);
        }

        let ok = !fresh.is_empty() && fresh.iter().all(|r| r.valid);
        for reading in &fresh {
            self.announce(reading);
        }
        ok
    }

    fn announce(&self, reading: &SensorReading) {
        let bus = self.lifecycle.bus();
        if reading.valid {
            bus.publish_new(
                &topics::sensor(&reading.kind),
                &reading.sensor_name,
                Payload::Reading {
                    sensor: reading.sensor_name.clone(),
                    value: reading.value,
                    unit: reading.unit.clone(),
                    timestamp_ms: reading.timestamp_ms,
                },
            );
        } else {
            let msg = reading.error_message.as_deref().unwrap_or("invalid reading");
            debug!("SensorManager: {} {}: {msg}", reading.sensor_name, reading.kind);
            bus.publish_new(
                topics::SENSOR_ERROR,
                &reading.sensor_name,
                Payload::error(&reading.sensor_name, format!("{}: {msg}", reading.kind)),
            );
        }
    }

    // ── Queries ──────────────────────────────────────────────

    /// First cached reading of `name`, or the not-found sentinel.
    pub fn reading(&self, name: &str) -> SensorReading {
        self.readings
            .read()
            .iter()
            .find(|r| r.sensor_name == name)
            .cloned()
            .unwrap_or_else(|| SensorReading::not_found(name))
    }

    /// Every channel cached for `name` (an SHT3x yields two).
    pub fn readings_for(&self, name: &str) -> Vec<SensorReading> {
        self.readings
            .read()
            .iter()
            .filter(|r| r.sensor_name == name)
            .cloned()
            .collect()
    }

    pub fn readings_by_kind(&self, kind: &str) -> Vec<SensorReading> {
        self.readings.read().iter().filter(|r| r.kind == kind).cloned().collect()
    }

    /// The complete reading set from the most recent update.
    pub fn all_readings(&self) -> Arc<Vec<SensorReading>> {
        Arc::clone(&self.readings.read())
    }

    pub fn sensor_names(&self) -> Vec<String> {
        self.slots.lock().iter().map(|s| s.sensor.name().to_owned()).collect()
    }

    pub fn sensor_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn read_interval(&self) -> Duration {
        *self.interval.lock()
    }

    // ── Mutation ─────────────────────────────────────────────

    /// Build, start and adopt one more sensor.
    pub fn add_sensor(&self, config: &SensorConfig) -> Result<(), SensorError> {
        let capability = self.capability.as_ref().ok_or(SensorError::NotInitialized)?;
        if self.slots.lock().iter().any(|s| s.sensor.name() == config.name) {
            return Err(SensorError::Duplicate(config.name.clone()));
        }
        let sensor = start_sensor(capability.as_ref(), config)?;
        self.slots.lock().push(Slot {
            sensor,
            last_read: None,
        });
        Ok(())
    }

    /// Shut down and drop `name`; its cached readings go with it.
    pub fn remove_sensor(&self, name: &str) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            let Some(idx) = slots.iter().position(|s| s.sensor.name() == name) else {
                return false;
            };
            slots.remove(idx)
        };
        let mut sensor = removed.sensor;
        sensor.shutdown();
        let kept: Vec<SensorReading> = self
            .readings
            .read()
            .iter()
            .filter(|r| r.sensor_name != name)
            .cloned()
            .collect();
        *self.readings.write() = Arc::new(kept);
        info!("SensorManager: removed '{name}'");
        true
    }

    /// Rebuild the sensor set from the current configuration.
    ///
    /// This is the supervised way out of `Error`.
    pub fn reconfigure(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.stop_task();
        self.release_sensors();
        *self.readings.write() = Arc::new(Vec::new());
        if self.lifecycle.state() == ManagerState::Ready {
            self.lifecycle.transition(ManagerState::Error)?;
        }
        self.begin()
    }

    /// Change the background poll period; restarts the read loop.
    pub fn set_read_interval(self: &Arc<Self>, interval: Duration) -> Result<(), ManagerError> {
        let interval = interval.max(Duration::from_millis(1));
        *self.interval.lock() = interval;
        if self.task.lock().is_some() {
            self.stop_task();
            self.spawn_task(interval)?;
        }
        Ok(())
    }

    fn spawn_task(self: &Arc<Self>, interval: Duration) -> Result<(), ManagerError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn(TASK_NAME, interval, TASK_STACK_KB, move || {
            let Some(manager) = weak.upgrade() else {
                return false;
            };
            manager.poll(false);
            true
        })
        .map_err(|e| ManagerError::Spawn(e.to_string()))?;
        *self.task.lock() = Some(task);
        Ok(())
    }

    fn stop_task(&self) {
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    fn release_sensors(&self) {
        let slots = std::mem::take(&mut *self.slots.lock());
        for mut slot in slots {
            slot.sensor.shutdown();
        }
    }

    /// Per-sensor-name count of cached readings, for status output.
    pub fn channel_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for r in self.readings.read().iter() {
            *counts.entry(r.sensor_name.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Managed for SensorManager {
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
        self.stop_task();
        self.release_sensors();
        let _ = self.lifecycle.transition(ManagerState::Shutdown);
    }
}

fn start_sensor(
    capability: &dyn DeviceCapability,
    config: &SensorConfig,
) -> Result<Box<dyn Sensor>, SensorError> {
    let mut sensor = capability.create_sensor(config).inspect_err(|e| {
        warn!("SensorManager: cannot create '{}' ({}): {e}", config.name, config.kind);
    })?;
    sensor.begin().inspect_err(|e| {
        warn!("SensorManager: '{}' failed to start: {e}", config.name);
    })?;
    Ok(sensor)
}

/// Smallest configured interval among `slots`.
fn poll_interval(slots: &[Slot]) -> Duration {
    slots
        .iter()
        .map(|s| s.sensor.config().read_interval_ms)
        .filter(|&ms| ms > 0)
        .min()
        .map_or(DEFAULT_READ_INTERVAL, Duration::from_millis)
}
