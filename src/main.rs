//! AeroEnv Firmware: Main Entry Point
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │  EspHardware (GPIO/LEDC/ADC1/I²C)   NvsStorage   LogSink     │
//! │  PlatformProbe (heap, RSSI)         EspRestart               │
//! │                                                              │
//! │  ─────────────── Port Trait Boundary ──────────────────      │
//! │                                                              │
//! │  EventBus ◀──▶ DeviceCoordinator                             │
//! │                 ├─ ConfigStore                               │
//! │                 ├─ SystemMonitor                             │
//! │                 ├─ SensorManager   ─┐                        │
//! │                 └─ ActuatorManager ─┴─ EnvironmentalDevice   │
//! │  CommandHandler (command.received → actuator.* intents)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every manager runs its own task; this thread only boots the system and
//! then logs a periodic status line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::units::Hertz;
use log::{error, info, warn};

use aeroenv::adapters::hardware::EspHardware;
use aeroenv::adapters::log_sink::{DEFAULT_TOPICS, LogSink};
use aeroenv::adapters::nvs::NvsStorage;
use aeroenv::app::commands::CommandHandler;
use aeroenv::app::config_store::ConfigStore;
use aeroenv::app::ports::{HardwarePort, RestartPort};
use aeroenv::device::{DeviceCapability, EnvironmentalDevice};
use aeroenv::diagnostics::{self, CrashLog, PlatformProbe};
use aeroenv::error::Error;
use aeroenv::events::EventBus;
use aeroenv::managers::coordinator::DeviceCoordinator;
use aeroenv::pins;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

// ── Restart port ──────────────────────────────────────────────

struct EspRestart;

impl RestartPort for EspRestart {
    fn restart(&self) {
        warn!("Restarting");
        // SAFETY: esp_restart has no preconditions and does not return.
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  AeroEnv v{}                       ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    diagnostics::install_panic_handler();

    // ── 2. Peripherals ────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio21,
        peripherals.pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(pins::I2C_FREQ_HZ)),
    )?;
    let hw: Arc<dyn HardwarePort> = Arc::new(EspHardware::new(i2c));

    // ── 3. Bus and console ────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let _console = LogSink::attach(bus.clone(), &DEFAULT_TOPICS).map_err(Error::from)?;

    // ── 4. Device, configuration, managers ────────────────────
    let nvs = NvsStorage::new();
    let capability: Arc<dyn DeviceCapability> = Arc::new(EnvironmentalDevice::new(hw));
    let config = Arc::new(ConfigStore::new(
        Box::new(nvs.clone()),
        Some(capability.clone()),
        bus.clone(),
    ));
    let coordinator = Arc::new(DeviceCoordinator::new(
        bus.clone(),
        config,
        capability,
        Arc::new(PlatformProbe::new()),
    ));

    if let Err(e) = coordinator.begin() {
        // Rollback stopped every manager; command intake still starts so
        // requests get an error confirmation instead of silence.
        error!("Startup failed: {e}");
    }

    let mut crash_log = CrashLog::new();
    crash_log.init(&nvs);
    let crashes = crash_log.count(&nvs);
    if crashes > 0 {
        warn!("{crashes} crash record(s) stored");
        for entry in crash_log.entries(&nvs) {
            warn!("  crash at {}s: {}", entry.uptime_secs, entry.reason);
        }
    }
    coordinator.monitor().set_crash_count(crashes as u32);

    // ── 5. Command intake ─────────────────────────────────────
    let commands = Arc::new(CommandHandler::new(bus.clone(), Arc::new(EspRestart)));
    commands.begin().map_err(Error::from)?;

    info!("System ready.");

    // ── 6. Status loop ────────────────────────────────────────
    loop {
        std::thread::sleep(STATUS_INTERVAL);
        let status = coordinator.status_summary();
        let health = coordinator.monitor().health_status();
        info!(
            "status: ready={} health={} active={:?} commands={}/{} failed",
            status.ready,
            health.health.as_str(),
            status.active_actuators,
            commands.processed_count(),
            commands.failed_count()
        );
        for condition in &health.conditions {
            warn!("  {condition}");
        }
    }
}
