//! Managers: owners of hardware-backed collections and their lifecycle.
//!
//! ```text
//!  Uninitialized ──▶ Initializing ──▶ Ready ◀──▶ Error
//!                         ▲                        │
//!                         └────────────────────────┘
//!        any state ──▶ Shutdown (terminal)
//! ```
//!
//! Every manager embeds a [`Lifecycle`], which rejects illegal transitions,
//! records the last failure and publishes `system.error` when a manager
//! faults.  A manager in `Error` stays there until it is explicitly
//! re-initialised or cleared.

pub mod actuator;
pub mod coordinator;
pub mod monitor;
pub mod sensor;

use core::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use parking_lot::Mutex;

use crate::app::events::{Payload, topics};
use crate::error::ManagerError;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Shutdown,
}

impl ManagerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn can_transition(self, to: Self) -> bool {
        use ManagerState::*;
        match (self, to) {
            (Shutdown, _) => false,
            (_, Shutdown) | (_, Error) => true,
            (Uninitialized, Initializing) | (Error, Initializing) => true,
            (Initializing, Ready) | (Error, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup stages sequenced by the coordinator, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    SystemMonitor,
    SensorManager,
    ActuatorManager,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Config,
        Stage::SystemMonitor,
        Stage::SensorManager,
        Stage::ActuatorManager,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "config",
            Self::SystemMonitor => "system monitor",
            Self::SensorManager => "sensor manager",
            Self::ActuatorManager => "actuator manager",
        })
    }
}

/// Read-side view every manager exposes to the coordinator.
pub trait Managed: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> ManagerState;

    fn is_ready(&self) -> bool {
        self.state() == ManagerState::Ready
    }

    fn last_error(&self) -> Option<String>;

    /// Stop background work and release hardware.  Idempotent.
    fn shutdown(&self);
}

// ── Lifecycle ────────────────────────────────────────────────

#[derive(Debug)]
struct LifecycleInner {
    state: ManagerState,
    last_error: Option<String>,
    ready_since: Option<Instant>,
}

pub struct Lifecycle {
    name: &'static str,
    bus: Arc<EventBus>,
    inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
    pub fn new(name: &'static str, bus: Arc<EventBus>) -> Self {
        Self {
            name,
            bus,
            inner: Mutex::new(LifecycleInner {
                state: ManagerState::Uninitialized,
                last_error: None,
                ready_since: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> ManagerState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ManagerState::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Time spent in `Ready` since the last successful initialisation.
    pub fn uptime(&self) -> Option<Duration> {
        self.inner.lock().ready_since.map(|t| t.elapsed())
    }

    pub fn transition(&self, to: ManagerState) -> Result<(), ManagerError> {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            if from == to {
                return Ok(());
            }
            if !from.can_transition(to) {
                return Err(ManagerError::InvalidTransition {
                    from: from.as_str(),
                    to: to.as_str(),
                });
            }
            inner.state = to;
            match to {
                ManagerState::Ready => {
                    inner.last_error = None;
                    inner.ready_since = Some(Instant::now());
                }
                ManagerState::Initializing | ManagerState::Shutdown => inner.ready_since = None,
                _ => {}
            }
            from
        };
        info!("{}: {from} -> {to}", self.name);
        Ok(())
    }

    /// Enter `Error`, remember `reason` and announce it on `system.error`.
    /// A shut-down manager stays shut down.
    pub fn fail(&self, reason: impl fmt::Display) {
        let reason = reason.to_string();
        {
            let mut inner = self.inner.lock();
            if inner.state == ManagerState::Shutdown {
                return;
            }
            inner.state = ManagerState::Error;
            inner.ready_since = None;
            inner.last_error = Some(reason.clone());
        }
        error!("{}: {reason}", self.name);
        self.bus
            .publish_new(topics::SYSTEM_ERROR, self.name, Payload::error(self.name, reason));
    }

    /// Supervisor acknowledgement: `Error` back to `Ready`.
    pub fn clear_error(&self) -> Result<(), ManagerError> {
        if self.state() != ManagerState::Error {
            return Err(ManagerError::InvalidTransition {
                from: self.state().as_str(),
                to: ManagerState::Ready.as_str(),
            });
        }
        self.transition(ManagerState::Ready)
    }
}
