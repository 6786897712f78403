//! Unified error types for the AeroEnv firmware.
//!
//! Every subsystem has its own small enum so callers can match on the
//! failure they care about; the top-level [`Error`] wraps them all so the
//! binary can funnel any fault through a single `?` chain.

use core::fmt;

use crate::app::ports::{HalError, StorageError};
use crate::managers::Stage;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Config(ConfigError),
    Sensor(SensorError),
    Actuator(ActuatorError),
    Bus(BusError),
    Manager(ManagerError),
    Command(CommandError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::Actuator(e) => write!(f, "actuator: {e}"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::Manager(e) => write!(f, "manager: {e}"),
            Self::Command(e) => write!(f, "command: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The persisted document is not valid JSON for the config model.
    Parse(String),
    /// The document parsed but failed validation; carries the error list.
    Invalid(Vec<String>),
    /// The backing store could not be read or written.
    Storage(StorageError),
    /// Encoding the document failed.
    Serialize(String),
    /// An operation needs `begin()` to have succeeded first.
    NotInitialized,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "parse failed: {msg}"),
            Self::Invalid(errors) => write!(f, "invalid: {}", errors.join("; ")),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Serialize(msg) => write!(f, "serialize failed: {msg}"),
            Self::NotInitialized => write!(f, "config store not initialized"),
        }
    }
}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SensorError {
    /// The bus transaction with the sensor failed.
    Communication(HalError),
    /// A CRC or checksum did not match the received data.
    ChecksumMismatch,
    /// The converted value is outside the plausible range.
    OutOfRange(f32),
    /// `read` was called before a successful `begin`.
    NotInitialized,
    /// The capability does not know how to build this kind.
    UnsupportedKind(String),
    /// A sensor with this name is already registered.
    Duplicate(String),
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(e) => write!(f, "communication failed: {e}"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::OutOfRange(v) => write!(f, "reading out of range: {v:.2}"),
            Self::NotInitialized => write!(f, "sensor not initialized"),
            Self::UnsupportedKind(kind) => write!(f, "unsupported sensor kind '{kind}'"),
            Self::Duplicate(name) => write!(f, "sensor '{name}' already registered"),
        }
    }
}

impl From<HalError> for SensorError {
    fn from(e: HalError) -> Self {
        Self::Communication(e)
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

// ---------------------------------------------------------------------------
// Actuator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    /// A GPIO or PWM write to the output failed.
    HardwareWrite(HalError),
    /// No actuator with this name is registered.
    NotFound(String),
    /// The actuator does not support the requested operation.
    Unsupported(&'static str),
    /// A timed sequence is already running.
    Busy,
    /// The actuator was used before a successful `begin`.
    NotInitialized,
    /// The capability does not know how to build this kind.
    UnsupportedKind(String),
    /// The sequence task could not be started.
    Spawn(String),
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareWrite(e) => write!(f, "hardware write failed: {e}"),
            Self::NotFound(name) => write!(f, "actuator '{name}' not found"),
            Self::Unsupported(op) => write!(f, "operation '{op}' not supported"),
            Self::Busy => write!(f, "sequence already in progress"),
            Self::NotInitialized => write!(f, "actuator not initialized"),
            Self::UnsupportedKind(kind) => write!(f, "unsupported actuator kind '{kind}'"),
            Self::Spawn(msg) => write!(f, "sequence task spawn failed: {msg}"),
        }
    }
}

impl From<HalError> for ActuatorError {
    fn from(e: HalError) -> Self {
        Self::HardwareWrite(e)
    }
}

impl From<ActuatorError> for Error {
    fn from(e: ActuatorError) -> Self {
        Self::Actuator(e)
    }
}

// ---------------------------------------------------------------------------
// Event bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The registry lock was not acquired within the bounded wait.
    LockTimeout { topic: String },
    /// The topic is empty, malformed, or outside the stable namespace.
    InvalidTopic(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockTimeout { topic } => write!(f, "lock timeout on '{topic}'"),
            Self::InvalidTopic(topic) => write!(f, "invalid topic '{topic}'"),
        }
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

// ---------------------------------------------------------------------------
// Manager errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerError {
    /// `begin()` was called without a device capability provider.
    MissingCapability,
    /// Not a single sensor/actuator came up.
    NoInstances(&'static str),
    /// The lifecycle state machine rejected the transition.
    InvalidTransition { from: &'static str, to: &'static str },
    /// The manager could not read its configuration.
    Config(ConfigError),
    /// A coordinator stage failed; carries the stage and its cause.
    StartupFailed { stage: Stage, reason: String },
    /// A background task could not be spawned.
    Spawn(String),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCapability => write!(f, "no device capability provider"),
            Self::NoInstances(what) => write!(f, "no {what} initialized"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid lifecycle transition {from} -> {to}")
            }
            Self::Config(e) => write!(f, "config: {e}"),
            Self::StartupFailed { stage, reason } => {
                write!(f, "startup failed at {stage}: {reason}")
            }
            Self::Spawn(msg) => write!(f, "task spawn failed: {msg}"),
        }
    }
}

impl From<ConfigError> for ManagerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ManagerError> for Error {
    fn from(e: ManagerError) -> Self {
        Self::Manager(e)
    }
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    UnknownKind(String),
    UnknownAction { kind: String, action: String },
    /// The inbound text was not a command object.
    Malformed(String),
    /// The resulting intent reached no subscriber.
    Undelivered(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind(kind) => write!(f, "unknown command type '{kind}'"),
            Self::UnknownAction { kind, action } => {
                write!(f, "unknown action '{action}' for '{kind}'")
            }
            Self::Malformed(msg) => write!(f, "malformed command: {msg}"),
            Self::Undelivered(topic) => write!(f, "no handler received '{topic}'"),
        }
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
