//! Runtime diagnostics and crash logging.
//!
//! [`RuntimeMetrics`] is the snapshot the SystemMonitor publishes on
//! `system.metrics`.  [`PlatformProbe`] is the [`SystemProbe`] adapter that
//! samples heap and WiFi figures from ESP-IDF (synthetic values on host).
//!
//! Crashes are kept in a small NVS ring buffer under the `crash` namespace:
//! a panic hook writes the reason before the chip resets, and the next
//! boot reports how many entries are stored.

use serde::{Deserialize, Serialize};

use crate::app::ports::{StoragePort, SystemProbe};

// ── Metrics ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub uptime_secs: u64,
    pub free_heap: u32,
    pub min_free_heap: u32,
    /// `None` while the station is not associated.
    pub wifi_rssi: Option<i8>,
    pub events_published: u64,
    pub events_dropped: u64,
    pub handler_panics: u64,
    pub alarms_raised: u32,
    pub crash_count: u32,
}

/// Heap and link figures straight from the platform.
#[derive(Debug, Default)]
pub struct PlatformProbe;

impl PlatformProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "espidf")]
impl SystemProbe for PlatformProbe {
    fn free_heap(&self) -> u32 {
        // SAFETY: plain counter reads with no preconditions.
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }

    fn min_free_heap(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_minimum_free_heap_size() }
    }

    fn wifi_rssi(&self) -> Option<i8> {
        use esp_idf_svc::sys::*;
        // SAFETY: zeroed record is a valid out-parameter.
        let mut ap_info: wifi_ap_record_t = unsafe { core::mem::zeroed() };
        let ret = unsafe { esp_wifi_sta_get_ap_info(&mut ap_info) };
        (ret == ESP_OK).then_some(ap_info.rssi)
    }
}

#[cfg(not(target_os = "espidf"))]
impl SystemProbe for PlatformProbe {
    fn free_heap(&self) -> u32 {
        // Modest decay over uptime so long simulations see heap pressure.
        let base_free: u32 = 245_760;
        let decay = (self.uptime_ms() / 60_000) as u32 * 256;
        base_free.saturating_sub(decay)
    }

    fn min_free_heap(&self) -> u32 {
        (self.free_heap() as f32 * 0.85) as u32
    }

    fn wifi_rssi(&self) -> Option<i8> {
        Some(-60)
    }
}

// ── Crash log ────────────────────────────────────────────────

const CRASH_NAMESPACE: &str = "crash";
const CRASH_INDEX_KEY: &str = "crash_idx";
pub const CRASH_RING_SLOTS: usize = 4;
const REASON_MAX: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashEntry {
    pub uptime_secs: u64,
    pub reason: heapless::String<64>,
}

impl CrashEntry {
    pub fn new(uptime_secs: u64, reason: &str) -> Self {
        let mut r = heapless::String::new();
        let mut end = reason.len().min(REASON_MAX);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let _ = r.push_str(&reason[..end]);
        Self { uptime_secs, reason: r }
    }
}

/// Ring of the last [`CRASH_RING_SLOTS`] crash entries.
#[derive(Debug, Default)]
pub struct CrashLog {
    write_index: usize,
}

impl CrashLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume at the stored write index.
    pub fn init(&mut self, storage: &dyn StoragePort) {
        if let Ok(bytes) = storage.read(CRASH_NAMESPACE, CRASH_INDEX_KEY) {
            if let Ok(idx) = <[u8; 4]>::try_from(bytes.as_slice()) {
                self.write_index = u32::from_le_bytes(idx) as usize % CRASH_RING_SLOTS;
            }
        }
    }

    pub fn record(&mut self, storage: &mut dyn StoragePort, entry: &CrashEntry) {
        if let Ok(bytes) = serde_json::to_vec(entry) {
            let _ = storage.write(CRASH_NAMESPACE, &Self::slot_key(self.write_index), &bytes);
        }
        self.write_index = (self.write_index + 1) % CRASH_RING_SLOTS;
        let _ = storage.write(
            CRASH_NAMESPACE,
            CRASH_INDEX_KEY,
            &(self.write_index as u32).to_le_bytes(),
        );
    }

    pub fn entries(&self, storage: &dyn StoragePort) -> Vec<CrashEntry> {
        (0..CRASH_RING_SLOTS)
            .filter_map(|i| storage.read(CRASH_NAMESPACE, &Self::slot_key(i)).ok())
            .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
            .collect()
    }

    pub fn count(&self, storage: &dyn StoragePort) -> usize {
        (0..CRASH_RING_SLOTS)
            .filter(|i| storage.exists(CRASH_NAMESPACE, &Self::slot_key(*i)))
            .count()
    }

    pub fn clear(&mut self, storage: &mut dyn StoragePort) {
        for i in 0..CRASH_RING_SLOTS {
            let _ = storage.delete(CRASH_NAMESPACE, &Self::slot_key(i));
        }
        let _ = storage.delete(CRASH_NAMESPACE, CRASH_INDEX_KEY);
        self.write_index = 0;
    }

    fn slot_key(index: usize) -> String {
        format!("e{index}")
    }
}

/// Install a panic hook that logs the reason and, on device, persists it
/// to the crash ring.  Call once, after NVS is initialised.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };
        log::error!("PANIC: {reason}");

        #[cfg(target_os = "espidf")]
        {
            // No nvs_flash_init here: the session opened in main() is reused,
            // and a failed write before init is simply lost.
            let mut nvs = crate::adapters::nvs::NvsStorage::new();
            let mut crash_log = CrashLog::new();
            crash_log.init(&nvs);
            crash_log.record(&mut nvs, &CrashEntry::new(crate::adapters::time::uptime_secs(), reason));
        }
    }));
}
