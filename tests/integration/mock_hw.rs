//! Simulated device rig for integration tests.
//!
//! Wires `SimHardware` → `EnvironmentalDevice` → `ConfigStore` →
//! `DeviceCoordinator` exactly the way `main` wires the real board, and
//! records bus traffic so tests can assert on the full event history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aeroenv::adapters::hardware::SimHardware;
use aeroenv::adapters::nvs::NvsStorage;
use aeroenv::app::config_store::{CONFIG_KEY, ConfigStore, NAMESPACE};
use aeroenv::app::events::{Event, Payload};
use aeroenv::app::ports::{HardwarePort, StoragePort, SystemProbe};
use aeroenv::config::DeviceConfig;
use aeroenv::device::{DeviceCapability, EnvironmentalDevice};
use aeroenv::events::EventBus;
use aeroenv::managers::coordinator::DeviceCoordinator;
use aeroenv::sensors::sht3x::encode_frame;
use parking_lot::Mutex;

/// 25 °C / 50 %RH in raw SHT3x units.
pub const NOMINAL_CLIMATE: (u16, u16) = (0x6666, 0x8000);

// ── Probe ─────────────────────────────────────────────────────

pub struct FixedProbe {
    pub free_heap: u32,
    pub rssi: Option<i8>,
}

impl SystemProbe for FixedProbe {
    fn free_heap(&self) -> u32 {
        self.free_heap
    }

    fn min_free_heap(&self) -> u32 {
        self.free_heap
    }

    fn wifi_rssi(&self) -> Option<i8> {
        self.rssi
    }
}

// ── Event recorder ────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn attach(bus: &EventBus, topics: &[&str]) -> Self {
        let recorder = Self::default();
        for topic in topics {
            let sink = recorder.events.clone();
            bus.subscribe(topic, move |ev: &Event| sink.lock().push(ev.clone()))
                .unwrap();
        }
        recorder
    }

    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.topic().to_owned()).collect()
    }

    pub fn payloads(&self, topic: &str) -> Vec<Payload> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic() == topic)
            .map(|e| e.payload().clone())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.events.lock().iter().filter(|e| e.topic() == topic).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

// ── Rig ───────────────────────────────────────────────────────

pub struct Rig {
    pub hw: Arc<SimHardware>,
    pub nvs: NvsStorage,
    pub bus: Arc<EventBus>,
    pub capability: Arc<dyn DeviceCapability>,
    pub config: Arc<ConfigStore>,
    pub coordinator: Arc<DeviceCoordinator>,
}

#[allow(dead_code)]
impl Rig {
    /// A board with the default configuration and healthy sensors.
    pub fn new() -> Self {
        Self::build(NvsStorage::new())
    }

    /// A board whose NVS already holds `doc`.
    pub fn with_config(doc: &DeviceConfig) -> Self {
        let mut nvs = NvsStorage::new();
        nvs.write(NAMESPACE, CONFIG_KEY, &serde_json::to_vec(doc).unwrap())
            .unwrap();
        Self::build(nvs)
    }

    fn build(nvs: NvsStorage) -> Self {
        let hw = Arc::new(SimHardware::new());
        hw.set_i2c_response(0x44, &encode_frame(NOMINAL_CLIMATE.0, NOMINAL_CLIMATE.1));
        hw.set_adc(aeroenv::pins::PRESSURE_ADC_GPIO, 1200);

        let capability: Arc<dyn DeviceCapability> =
            Arc::new(EnvironmentalDevice::new(Arc::clone(&hw) as Arc<dyn HardwarePort>));
        let bus = Arc::new(EventBus::new());
        let config = Arc::new(ConfigStore::new(
            Box::new(nvs.clone()),
            Some(capability.clone()),
            bus.clone(),
        ));
        let coordinator = Arc::new(DeviceCoordinator::new(
            bus.clone(),
            config.clone(),
            capability.clone(),
            Arc::new(FixedProbe {
                free_heap: 120_000,
                rssi: Some(-55),
            }),
        ));
        Self {
            hw,
            nvs,
            bus,
            capability,
            config,
            coordinator,
        }
    }

    /// Default configuration with the nozzle timings shortened to `ms`.
    pub fn fast_nozzle_config(&self, pressurize: u64, spray: u64, purge: u64) -> DeviceConfig {
        let mut doc = DeviceConfig {
            network: Default::default(),
            safety: self.capability.default_safety(),
            sensors: self.capability.default_sensors(),
            actuators: self.capability.default_actuators(),
        };
        for a in &mut doc.actuators {
            if a.kind == aeroenv::drivers::nozzle::KIND {
                a.pressurize_delay_ms = pressurize;
                a.pulse_width_ms = spray;
                a.purge_delay_ms = purge;
            }
        }
        doc
    }

    pub fn start(&self) {
        self.coordinator.begin().unwrap();
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}

/// Poll `cond` every 5 ms until it holds or `limit` passes.
#[allow(dead_code)]
pub fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
