//! ActuatorManager: the single registry of actuator instances.
//!
//! Actuators are built through the [`DeviceCapability`] factory and are
//! reachable only by name through this manager.  Lookups clone the `Arc`
//! out of the registry and release the lock before calling the driver, so
//! a slow write or a nested publish never holds the registry.
//!
//! The manager also listens for the command intents on `actuator.*` and
//! for `system.emergency`, and runs a 100 ms maintenance task that gives
//! time-based actuators their `update()` tick.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use super::{Lifecycle, Managed, ManagerState};
use crate::app::config_store::ConfigStore;
use crate::app::events::{Event, Payload, topics};
use crate::config::ActuatorConfig;
use crate::device::DeviceCapability;
use crate::drivers::task_pin::PeriodicTask;
use crate::drivers::{Actuator, nozzle};
use crate::error::{ActuatorError, BusError, ManagerError};
use crate::events::{EventBus, SubscriptionId};

const SOURCE: &str = "ActuatorManager";
const TASK_NAME: &str = "actuator-upd\0";
const TASK_STACK_KB: usize = 4;

pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

pub struct ActuatorManager {
    lifecycle: Lifecycle,
    config: Arc<ConfigStore>,
    capability: Option<Arc<dyn DeviceCapability>>,
    /// Registry in configuration order; names are unique.
    registry: RwLock<Vec<Arc<dyn Actuator>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl ActuatorManager {
    pub fn new(
        config: Arc<ConfigStore>,
        capability: Option<Arc<dyn DeviceCapability>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(SOURCE, bus),
            config,
            capability,
            registry: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    pub fn begin(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.lifecycle.transition(ManagerState::Initializing)?;

        let Some(capability) = self.capability.clone() else {
            self.lifecycle.fail(ManagerError::MissingCapability);
            return Err(ManagerError::MissingCapability);
        };

        let bus = self.lifecycle.bus();
        let mut started: Vec<Arc<dyn Actuator>> = Vec::new();
        for cfg in self.config.actuators().into_iter().filter(|c| c.enabled) {
            if started.iter().any(|a| a.name() == cfg.name) {
                warn!("ActuatorManager: duplicate actuator '{}' skipped", cfg.name);
                continue;
            }
            if let Ok(actuator) = start_actuator(capability.as_ref(), &cfg, bus) {
                started.push(actuator);
            }
        }

        if started.is_empty() {
            let err = ManagerError::NoInstances("actuators");
            self.lifecycle.fail(&err);
            return Err(err);
        }
        info!("ActuatorManager: {} actuator(s) up", started.len());
        *self.registry.write() = started;

        if let Err(e) = self.subscribe_intents() {
            self.release();
            let err = ManagerError::Spawn(format!("bus subscription failed: {e}"));
            self.lifecycle.fail(&err);
            return Err(err);
        }
        if let Err(e) = self.spawn_task() {
            self.release();
            self.lifecycle.fail(&e);
            return Err(e);
        }
        self.lifecycle.transition(ManagerState::Ready)
    }

    // ── Direct control ───────────────────────────────────────

    pub fn activate(&self, name: &str) -> Result<(), ActuatorError> {
        self.get(name)?.activate()
    }

    pub fn deactivate(&self, name: &str) -> Result<(), ActuatorError> {
        self.get(name)?.deactivate()
    }

    /// `false` for unknown names.
    pub fn is_active(&self, name: &str) -> bool {
        self.get(name).is_ok_and(|a| a.is_active())
    }

    pub fn toggle(&self, name: &str) -> Result<(), ActuatorError> {
        let actuator = self.get(name)?;
        if actuator.is_active() {
            actuator.deactivate()
        } else {
            actuator.activate()
        }
    }

    pub fn pulse(&self, name: &str, duration: Duration) -> Result<(), ActuatorError> {
        self.get(name)?.pulse(duration)
    }

    pub fn set_level(&self, name: &str, percent: f32) -> Result<(), ActuatorError> {
        self.get(name)?.set_level(percent)
    }

    pub fn level(&self, name: &str) -> Option<f32> {
        self.get(name).ok().and_then(|a| a.level())
    }

    /// Start a spray cycle on the nozzles `selector` resolves to; `None`
    /// means every nozzle.  Returns how many cycles were started.
    ///
    /// All matching nozzles are attempted; the first failure is returned.
    pub fn start_spray(&self, selector: Option<&str>) -> Result<usize, ActuatorError> {
        self.for_nozzles(selector, |n| n.activate())
    }

    pub fn stop_spray(&self, selector: Option<&str>) -> Result<usize, ActuatorError> {
        self.for_nozzles(selector, |n| n.deactivate())
    }

    /// Force every actuator to its safe state, preempting running cycles.
    ///
    /// Safe to call from any task at any time, in any manager state.
    /// Returns the number of actuators that failed to stop.
    pub fn emergency_stop_all(&self, reason: &str) -> usize {
        let actuators = self.snapshot();
        error!(
            "ActuatorManager: EMERGENCY STOP ({reason}), {} actuator(s)",
            actuators.len()
        );
        let mut failures = 0;
        for actuator in &actuators {
            if let Err(e) = actuator.emergency_stop() {
                failures += 1;
                error!("ActuatorManager: '{}' did not stop: {e}", actuator.name());
            }
        }
        self.lifecycle.bus().publish_new(
            topics::SYSTEM_ERROR,
            SOURCE,
            Payload::Emergency {
                reason: reason.to_owned(),
            },
        );
        failures
    }

    /// One maintenance tick for every actuator.
    pub fn update(&self) {
        for actuator in self.snapshot() {
            actuator.update();
        }
    }

    // ── Queries ──────────────────────────────────────────────

    pub fn active_actuators(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.name().to_owned())
            .collect()
    }

    pub fn actuator_names(&self) -> Vec<String> {
        self.registry.read().iter().map(|a| a.name().to_owned()).collect()
    }

    /// Nozzle names in configuration order; index `i` is selector `i + 1`.
    pub fn nozzle_names(&self) -> Vec<String> {
        self.nozzles().iter().map(|a| a.name().to_owned()).collect()
    }

    pub fn actuator_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Whether the `system.emergency` and intent handlers are registered.
    pub fn is_listening(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    pub fn kind_of(&self, name: &str) -> Option<String> {
        self.get(name).ok().map(|a| a.kind().to_owned())
    }

    // ── Internals ────────────────────────────────────────────

    fn get(&self, name: &str) -> Result<Arc<dyn Actuator>, ActuatorError> {
        self.registry
            .read()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
            .ok_or_else(|| ActuatorError::NotFound(name.to_owned()))
    }

    fn snapshot(&self) -> Vec<Arc<dyn Actuator>> {
        self.registry.read().clone()
    }

    fn nozzles(&self) -> Vec<Arc<dyn Actuator>> {
        self.registry
            .read()
            .iter()
            .filter(|a| a.kind() == nozzle::KIND)
            .cloned()
            .collect()
    }

    /// A nozzle name, or a 1-based index into [`nozzle_names`](Self::nozzle_names).
    fn resolve_nozzles(&self, selector: Option<&str>) -> Result<Vec<Arc<dyn Actuator>>, ActuatorError> {
        let nozzles = self.nozzles();
        let Some(sel) = selector.map(str::trim) else {
            if nozzles.is_empty() {
                return Err(ActuatorError::NotFound("nozzle".into()));
            }
            return Ok(nozzles);
        };
        if let Some(n) = nozzles.iter().find(|n| n.name() == sel) {
            return Ok(vec![Arc::clone(n)]);
        }
        sel.parse::<usize>()
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| nozzles.get(i))
            .map(|n| vec![Arc::clone(n)])
            .ok_or_else(|| ActuatorError::NotFound(sel.to_owned()))
    }

    fn for_nozzles(
        &self,
        selector: Option<&str>,
        op: impl Fn(&dyn Actuator) -> Result<(), ActuatorError>,
    ) -> Result<usize, ActuatorError> {
        let targets = self.resolve_nozzles(selector)?;
        let mut done = 0;
        let mut first_err = None;
        for nozzle in &targets {
            match op(nozzle.as_ref()) {
                Ok(()) => done += 1,
                Err(e) => {
                    warn!("ActuatorManager: nozzle '{}': {e}", nozzle.name());
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    fn subscribe_intents(self: &Arc<Self>) -> Result<(), BusError> {
        type Route = fn(&ActuatorManager, &Event);
        let routes: [(&str, Route); 6] = [
            (topics::ACTUATOR_RELAY_SET, Self::on_relay_set),
            (topics::ACTUATOR_RELAY_TOGGLE, Self::on_relay_toggle),
            (topics::ACTUATOR_SPRAY_START, Self::on_spray_start),
            (topics::ACTUATOR_SPRAY_STOP, Self::on_spray_stop),
            (topics::ACTUATOR_NOZZLE_ACTIVATE, Self::on_nozzle_activate),
            (topics::SYSTEM_EMERGENCY, Self::on_emergency),
        ];

        let bus = self.lifecycle.bus();
        let mut ids = Vec::with_capacity(routes.len());
        for (topic, route) in routes {
            let weak: Weak<Self> = Arc::downgrade(self);
            let subscribed = bus.subscribe(topic, move |ev: &Event| {
                if let Some(manager) = weak.upgrade() {
                    route(&manager, ev);
                }
            });
            match subscribed {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        let _ = bus.unsubscribe(id);
                    }
                    return Err(e);
                }
            }
        }
        *self.subscriptions.lock() = ids;
        Ok(())
    }

    fn on_relay_set(&self, ev: &Event) {
        match ev.payload() {
            Payload::ActuatorCommand {
                name,
                state: Some(on),
            } => {
                let result = if *on {
                    self.activate(name)
                } else {
                    self.deactivate(name)
                };
                log_intent(ev, result);
            }
            other => warn!("ActuatorManager: {} without a state: {other:?}", ev.topic()),
        }
    }

    fn on_relay_toggle(&self, ev: &Event) {
        match ev.payload() {
            Payload::ActuatorCommand { name, .. } => log_intent(ev, self.toggle(name)),
            other => warn!("ActuatorManager: {} without a name: {other:?}", ev.topic()),
        }
    }

    fn on_spray_start(&self, ev: &Event) {
        log_intent(ev, self.start_spray(spray_selector(ev)).map(|_| ()));
    }

    fn on_spray_stop(&self, ev: &Event) {
        log_intent(ev, self.stop_spray(spray_selector(ev)).map(|_| ()));
    }

    fn on_nozzle_activate(&self, ev: &Event) {
        let selector = spray_selector(ev).unwrap_or("1");
        log_intent(ev, self.start_spray(Some(selector)).map(|_| ()));
    }

    fn on_emergency(&self, ev: &Event) {
        let reason = match ev.payload() {
            Payload::Emergency { reason } => reason.as_str(),
            _ => "emergency broadcast",
        };
        self.emergency_stop_all(reason);
    }

    fn spawn_task(self: &Arc<Self>) -> Result<(), ManagerError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn(TASK_NAME, UPDATE_INTERVAL, TASK_STACK_KB, move || {
            let Some(manager) = weak.upgrade() else {
                return false;
            };
            manager.update();
            true
        })
        .map_err(|e| ManagerError::Spawn(e.to_string()))?;
        *self.task.lock() = Some(task);
        Ok(())
    }

    pub(super) fn unsubscribe_all(&self) {
        let ids = std::mem::take(&mut *self.subscriptions.lock());
        let bus = self.lifecycle.bus();
        for id in ids {
            let _ = bus.unsubscribe(id);
        }
    }

    /// Drive every actuator safe and empty the registry.
    fn release(&self) {
        self.unsubscribe_all();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
        let actuators = std::mem::take(&mut *self.registry.write());
        for actuator in actuators {
            actuator.shutdown();
        }
    }
}

impl Managed for ActuatorManager {
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
        self.release();
        let _ = self.lifecycle.transition(ManagerState::Shutdown);
    }
}

fn start_actuator(
    capability: &dyn DeviceCapability,
    config: &ActuatorConfig,
    bus: &Arc<EventBus>,
) -> Result<Arc<dyn Actuator>, ActuatorError> {
    let actuator = capability.create_actuator(config, bus).inspect_err(|e| {
        warn!("ActuatorManager: cannot create '{}' ({}): {e}", config.name, config.kind);
    })?;
    actuator.begin().inspect_err(|e| {
        warn!("ActuatorManager: '{}' failed to start: {e}", config.name);
    })?;
    Ok(actuator)
}

fn spray_selector(ev: &Event) -> Option<&str> {
    match ev.payload() {
        Payload::Spray { nozzle } => nozzle.as_deref(),
        _ => None,
    }
}

fn log_intent(ev: &Event, result: Result<(), ActuatorError>) {
    if let Err(e) = result {
        warn!("ActuatorManager: {} from {} failed: {e}", ev.topic(), ev.source());
    }
}
