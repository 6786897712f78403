//! DeviceCoordinator: startup sequencing, shutdown and the safety loop.
//!
//! Startup runs the stages in [`Stage::ORDER`]: configuration, then the
//! SystemMonitor, SensorManager and ActuatorManager, each gated on the
//! previous one.  A failing stage rolls back whatever already started (in
//! reverse) and surfaces as [`ManagerError::StartupFailed`] naming the
//! stage.  Shutdown is the reverse of startup.
//!
//! The coordinator also closes the safety loop: a `system.safety` alarm
//! from the monitor triggers [`DeviceCoordinator::emergency_stop`] when
//! the configuration enables emergency shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::actuator::ActuatorManager;
use super::monitor::SystemMonitor;
use super::sensor::SensorManager;
use super::{Managed, ManagerState, Stage};
use crate::app::config_store::ConfigStore;
use crate::app::events::{Event, Payload, topics};
use crate::app::ports::SystemProbe;
use crate::device::DeviceCapability;
use crate::error::ManagerError;
use crate::events::{EventBus, SubscriptionId};

const SOURCE: &str = "DeviceCoordinator";

#[derive(Clone)]
struct Managers {
    monitor: Arc<SystemMonitor>,
    sensors: Arc<SensorManager>,
    actuators: Arc<ActuatorManager>,
}

/// Point-in-time view of the whole device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub device_type: String,
    pub device_name: String,
    pub firmware_version: String,
    pub ready: bool,
    /// `(stage, state)` in startup order.
    pub stages: Vec<(String, String)>,
    pub last_failure: Option<String>,
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub active_actuators: Vec<String>,
    pub healthy: bool,
    pub emergency_stops: u32,
}

pub struct DeviceCoordinator {
    bus: Arc<EventBus>,
    config: Arc<ConfigStore>,
    capability: Arc<dyn DeviceCapability>,
    probe: Arc<dyn SystemProbe>,
    managers: RwLock<Managers>,
    started: Mutex<Vec<Stage>>,
    safety_subscription: Mutex<Option<SubscriptionId>>,
    last_failure: Mutex<Option<String>>,
    emergency_stops: AtomicU32,
}

impl DeviceCoordinator {
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<ConfigStore>,
        capability: Arc<dyn DeviceCapability>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let managers = Self::build_managers(&bus, &config, &capability, &probe);
        Self {
            bus,
            config,
            capability,
            probe,
            managers: RwLock::new(managers),
            started: Mutex::new(Vec::new()),
            safety_subscription: Mutex::new(None),
            last_failure: Mutex::new(None),
            emergency_stops: AtomicU32::new(0),
        }
    }

    fn build_managers(
        bus: &Arc<EventBus>,
        config: &Arc<ConfigStore>,
        capability: &Arc<dyn DeviceCapability>,
        probe: &Arc<dyn SystemProbe>,
    ) -> Managers {
        Managers {
            monitor: Arc::new(SystemMonitor::new(
                Arc::clone(config),
                Arc::clone(probe),
                Arc::clone(bus),
            )),
            sensors: Arc::new(SensorManager::new(
                Arc::clone(config),
                Some(Arc::clone(capability)),
                Arc::clone(bus),
            )),
            actuators: Arc::new(ActuatorManager::new(
                Arc::clone(config),
                Some(Arc::clone(capability)),
                Arc::clone(bus),
            )),
        }
    }

    /// Bring the device up stage by stage.
    pub fn begin(self: &Arc<Self>) -> Result<(), ManagerError> {
        info!(
            "{SOURCE}: starting {} ({} v{})",
            self.capability.device_name(),
            self.capability.device_type(),
            self.capability.firmware_version()
        );
        *self.last_failure.lock() = None;

        for stage in Stage::ORDER {
            if let Err(e) = self.start_stage(stage) {
                let reason = e.to_string();
                error!("{SOURCE}: {stage} failed: {reason}");
                *self.last_failure.lock() = Some(format!("{stage}: {reason}"));
                self.rollback();
                return Err(ManagerError::StartupFailed { stage, reason });
            }
            self.started.lock().push(stage);
        }

        self.subscribe_safety()?;
        info!("{SOURCE}: all stages ready");
        self.bus.publish_new(topics::SYSTEM_STARTUP, SOURCE, Payload::Empty);
        Ok(())
    }

    fn start_stage(&self, stage: Stage) -> Result<(), ManagerError> {
        let m = self.managers();
        match stage {
            Stage::Config => {
                if self.config.state() == ManagerState::Ready {
                    return Ok(());
                }
                self.config.begin().map_err(ManagerError::from)
            }
            Stage::SystemMonitor => m.monitor.begin(),
            Stage::SensorManager => m.sensors.begin(),
            Stage::ActuatorManager => m.actuators.begin(),
        }
    }

    fn stop_stage(&self, stage: Stage) {
        let m = self.managers();
        match stage {
            // The configuration outlives a restart.
            Stage::Config => {}
            Stage::SystemMonitor => m.monitor.shutdown(),
            Stage::SensorManager => m.sensors.shutdown(),
            Stage::ActuatorManager => m.actuators.shutdown(),
        }
    }

    fn rollback(&self) {
        let started = std::mem::take(&mut *self.started.lock());
        for stage in started.into_iter().rev() {
            warn!("{SOURCE}: rolling back {stage}");
            self.stop_stage(stage);
        }
    }

    /// Stop every started stage in reverse startup order.
    pub fn shutdown(&self) {
        if let Some(id) = self.safety_subscription.lock().take() {
            let _ = self.bus.unsubscribe(id);
        }
        let started = std::mem::take(&mut *self.started.lock());
        if started.is_empty() {
            return;
        }
        info!("{SOURCE}: shutting down");
        self.bus.publish_new(topics::SYSTEM_SHUTDOWN, SOURCE, Payload::Empty);
        for stage in started.into_iter().rev() {
            self.stop_stage(stage);
        }
    }

    /// Shut down, replace the managers with fresh ones and start again.
    pub fn restart(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.shutdown();
        *self.managers.write() =
            Self::build_managers(&self.bus, &self.config, &self.capability, &self.probe);
        self.begin()
    }

    /// Force every actuator safe.
    ///
    /// Broadcasts `system.emergency`; if the broadcast was dropped or the
    /// ActuatorManager is not listening, the manager is called directly.
    pub fn emergency_stop(&self, reason: &str) {
        self.emergency_stops.fetch_add(1, Ordering::Relaxed);
        error!("{SOURCE}: emergency stop: {reason}");
        let delivered = self.bus.publish_new(
            topics::SYSTEM_EMERGENCY,
            SOURCE,
            Payload::Emergency {
                reason: reason.to_owned(),
            },
        );
        let actuators = self.managers().actuators;
        if delivered == 0 || !actuators.is_listening() {
            warn!("{SOURCE}: emergency broadcast not delivered, stopping actuators directly");
            actuators.emergency_stop_all(reason);
        }
    }

    fn subscribe_safety(self: &Arc<Self>) -> Result<(), ManagerError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self
            .bus
            .subscribe(topics::SYSTEM_SAFETY, move |ev: &Event| {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.on_safety_alarm(ev);
                }
            })
            .map_err(|e| {
                self.rollback();
                ManagerError::Spawn(format!("bus subscription failed: {e}"))
            })?;
        if let Some(old) = self.safety_subscription.lock().replace(id) {
            let _ = self.bus.unsubscribe(old);
        }
        Ok(())
    }

    fn on_safety_alarm(&self, ev: &Event) {
        let reason = match ev.payload() {
            Payload::Alarm { source, message, .. } => format!("{source}: {message}"),
            other => format!("{other:?}"),
        };
        if self.config.safety().enable_emergency_shutdown {
            self.emergency_stop(&reason);
        } else {
            warn!("{SOURCE}: safety alarm ignored (emergency shutdown disabled): {reason}");
        }
    }

    // ── Queries ──────────────────────────────────────────────

    /// All three managers are `Ready`.
    pub fn is_ready(&self) -> bool {
        let m = self.managers();
        m.monitor.is_ready() && m.sensors.is_ready() && m.actuators.is_ready()
    }

    pub fn stage_state(&self, stage: Stage) -> ManagerState {
        let m = self.managers();
        match stage {
            Stage::Config => self.config.state(),
            Stage::SystemMonitor => m.monitor.state(),
            Stage::SensorManager => m.sensors.state(),
            Stage::ActuatorManager => m.actuators.state(),
        }
    }

    pub fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().clone()
    }

    pub fn emergency_stop_count(&self) -> u32 {
        self.emergency_stops.load(Ordering::Relaxed)
    }

    pub fn status_summary(&self) -> StatusSummary {
        let m = self.managers();
        StatusSummary {
            device_type: self.capability.device_type().to_owned(),
            device_name: self.capability.device_name().to_owned(),
            firmware_version: self.capability.firmware_version().to_owned(),
            ready: self.is_ready(),
            stages: Stage::ORDER
                .iter()
                .map(|&s| (s.to_string(), self.stage_state(s).to_string()))
                .collect(),
            last_failure: self.last_failure(),
            sensors: m.sensors.sensor_names(),
            actuators: m.actuators.actuator_names(),
            active_actuators: m.actuators.active_actuators(),
            healthy: m.monitor.is_healthy(),
            emergency_stops: self.emergency_stop_count(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn capability(&self) -> &Arc<dyn DeviceCapability> {
        &self.capability
    }

    pub fn monitor(&self) -> Arc<SystemMonitor> {
        Arc::clone(&self.managers.read().monitor)
    }

    pub fn sensors(&self) -> Arc<SensorManager> {
        Arc::clone(&self.managers.read().sensors)
    }

    pub fn actuators(&self) -> Arc<ActuatorManager> {
        Arc::clone(&self.managers.read().actuators)
    }

    fn managers(&self) -> Managers {
        self.managers.read().clone()
    }
}
