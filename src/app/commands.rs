//! Inbound commands and the handler that turns them into bus intents.
//!
//! Commands arrive from the server API or the local display as JSON
//! objects `{id, type, action, params, source}`.  The handler maps each one
//! onto an `actuator.*` intent and answers with exactly one
//! [`StatusConfirmation`] on `command.status`, correlated by command id,
//! whether the command succeeded, is pending, or was rejected.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::time::uptime_secs;
use crate::app::events::{Event, Payload, topics};
use crate::app::ports::RestartPort;
use crate::drivers::task_pin::{Core, spawn_on_core};
use crate::error::{BusError, CommandError};
use crate::events::{EventBus, SubscriptionId};

const SOURCE: &str = "CommandHandler";

/// Delay between confirming `system.restart` and resetting the chip.
pub const RESTART_DELAY: Duration = Duration::from_millis(1000);

/// Relay addressed by the `lights` command family.
pub const LIGHTS_RELAY: &str = "lights";

/// Nozzle index used by `spray.cycle` without a `nozzle` parameter.
pub const DEFAULT_NOZZLE: u64 = 1;

// ── Wire types ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub id: String,
    /// Command family: `lights`, `spray`, `system`.
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Origin tag, e.g. `"api"` or `"display"`.
    #[serde(default)]
    pub source: String,
}

impl Command {
    pub fn new(id: &str, kind: &str, action: &str, source: &str) -> Self {
        Self {
            id: id.to_owned(),
            kind: kind.to_owned(),
            action: action.to_owned(),
            params: Value::Null,
            source: source.to_owned(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Decode a command, stamping `source` when the document has none.
    pub fn from_json(text: &str, source: &str) -> Result<Self, CommandError> {
        let mut cmd: Command =
            serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
        if cmd.source.is_empty() {
            cmd.source = source.to_owned();
        }
        Ok(cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Completed,
    Pending,
    Error,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Pending => "pending",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusConfirmation {
    pub command_id: String,
    pub status: CommandStatus,
    /// Seconds since boot.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Handler ──────────────────────────────────────────────────

pub struct CommandHandler {
    bus: Arc<EventBus>,
    restart: Arc<dyn RestartPort>,
    restart_delay: Duration,
    subscription: Mutex<Option<SubscriptionId>>,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl CommandHandler {
    pub fn new(bus: Arc<EventBus>, restart: Arc<dyn RestartPort>) -> Self {
        Self::with_restart_delay(bus, restart, RESTART_DELAY)
    }

    pub fn with_restart_delay(bus: Arc<EventBus>, restart: Arc<dyn RestartPort>, restart_delay: Duration) -> Self {
        Self {
            bus,
            restart,
            restart_delay,
            subscription: Mutex::new(None),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Listen on `command.received` for commands published by transports.
    pub fn begin(self: &Arc<Self>) -> Result<(), BusError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.bus.subscribe(topics::COMMAND_RECEIVED, move |ev: &Event| {
            let Some(handler) = weak.upgrade() else { return };
            match ev.payload() {
                Payload::Command(cmd) => {
                    handler.process(cmd);
                }
                other => warn!("CommandHandler: ignoring non-command payload {other:?}"),
            }
        })?;
        if let Some(old) = self.subscription.lock().replace(id) {
            let _ = self.bus.unsubscribe(old);
        }
        info!("CommandHandler listening on {}", topics::COMMAND_RECEIVED);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(id) = self.subscription.lock().take() {
            let _ = self.bus.unsubscribe(id);
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Execute `cmd` and publish its single confirmation.
    pub fn process(&self, cmd: &Command) -> StatusConfirmation {
        info!("Command {}.{} [{}] from {}", cmd.kind, cmd.action, cmd.id, cmd.source);
        let restart = cmd.kind == "system" && cmd.action == "restart";
        let confirmation = match self.dispatch(cmd) {
            Ok((status, message)) => self.confirm(&cmd.id, status, message),
            Err(e) => {
                warn!("Command [{}] failed: {e}", cmd.id);
                self.confirm(&cmd.id, CommandStatus::Error, e.to_string())
            }
        };
        if restart {
            self.schedule_restart();
        }
        confirmation
    }

    /// Decode and execute raw JSON.  Undecodable input still confirms
    /// `error`, under the id recovered from the document if there is one.
    pub fn process_json(&self, text: &str, source: &str) -> StatusConfirmation {
        match Command::from_json(text, source) {
            Ok(cmd) => self.process(&cmd),
            Err(e) => {
                let id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_owned))
                    .unwrap_or_default();
                warn!("Command from {source} rejected: {e}");
                self.confirm(&id, CommandStatus::Error, e.to_string())
            }
        }
    }

    fn dispatch(&self, cmd: &Command) -> Result<(CommandStatus, &'static str), CommandError> {
        let unknown_action = || CommandError::UnknownAction {
            kind: cmd.kind.clone(),
            action: cmd.action.clone(),
        };
        match (cmd.kind.as_str(), cmd.action.as_str()) {
            ("lights", "on" | "off") => {
                let state = cmd.action == "on";
                self.intent(
                    topics::ACTUATOR_RELAY_SET,
                    Payload::ActuatorCommand {
                        name: LIGHTS_RELAY.into(),
                        state: Some(state),
                    },
                )?;
                Ok((
                    CommandStatus::Completed,
                    if state { "Lights turned on" } else { "Lights turned off" },
                ))
            }
            ("lights", "toggle") => {
                self.intent(
                    topics::ACTUATOR_RELAY_TOGGLE,
                    Payload::ActuatorCommand {
                        name: LIGHTS_RELAY.into(),
                        state: None,
                    },
                )?;
                Ok((CommandStatus::Completed, "Lights toggled"))
            }
            // Schedules are acknowledged only; there is no wall clock to run them on.
            ("lights", "schedule") => Ok((CommandStatus::Pending, "Lighting schedule not implemented")),
            ("lights", _) => Err(unknown_action()),

            ("spray", "on") => {
                self.intent(topics::ACTUATOR_SPRAY_START, Payload::Spray { nozzle: None })?;
                Ok((CommandStatus::Completed, "Spray started"))
            }
            ("spray", "off") => {
                self.intent(topics::ACTUATOR_SPRAY_STOP, Payload::Spray { nozzle: None })?;
                Ok((CommandStatus::Completed, "Spray stopped"))
            }
            ("spray", "cycle") => {
                let nozzle = nozzle_param(&cmd.params);
                self.intent(topics::ACTUATOR_NOZZLE_ACTIVATE, Payload::Spray { nozzle: Some(nozzle) })?;
                Ok((CommandStatus::Completed, "Spray cycle started"))
            }
            ("spray", _) => Err(unknown_action()),

            ("system", "restart") => Ok((CommandStatus::Completed, "Restarting device")),
            ("system", _) => Err(unknown_action()),

            (kind, _) => Err(CommandError::UnknownKind(kind.to_owned())),
        }
    }

    /// Publish an intent; it only counts if some subscriber received it.
    fn intent(&self, topic: &str, payload: Payload) -> Result<(), CommandError> {
        match self.bus.try_publish(Event::new(topic, SOURCE, payload)) {
            Ok(0) => Err(CommandError::Undelivered(topic.to_owned())),
            Ok(_) => Ok(()),
            Err(e) => Err(CommandError::Undelivered(format!("{topic} ({e})"))),
        }
    }

    fn confirm(&self, id: &str, status: CommandStatus, message: impl Into<String>) -> StatusConfirmation {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if status == CommandStatus::Error {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let message: String = message.into();
        let confirmation = StatusConfirmation {
            command_id: id.to_owned(),
            status,
            timestamp: uptime_secs(),
            message: (!message.is_empty()).then_some(message),
        };
        self.bus.publish_new(
            topics::COMMAND_STATUS,
            SOURCE,
            Payload::Status(confirmation.clone()),
        );
        confirmation
    }

    fn schedule_restart(&self) {
        let port = Arc::clone(&self.restart);
        let delay = self.restart_delay;
        info!("Restart in {} ms", delay.as_millis());
        let spawned = spawn_on_core(Core::Pro, 3, 4, "restart\0", move || {
            std::thread::sleep(delay);
            port.restart();
        });
        if let Err(e) = spawned {
            warn!("Restart task spawn failed ({e}), restarting inline");
            std::thread::sleep(delay);
            self.restart.restart();
        }
    }
}

/// `params.nozzle` as a nozzle selector: a name, or a 1-based index.
fn nozzle_param(params: &Value) -> String {
    match params.get("nozzle") {
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(DEFAULT_NOZZLE).to_string(),
        _ => DEFAULT_NOZZLE.to_string(),
    }
}
