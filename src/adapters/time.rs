//! Monotonic time since boot.
//!
//! - **`target_os = "espidf"`**: wraps `esp_timer_get_time()` from the
//!   ESP-IDF high-resolution timer (microsecond precision, monotonic).
//! - **`not(target_os = "espidf")`**: measures from the first call using
//!   `std::time::Instant`, for host-side testing and simulation.
//!
//! Readings and status confirmations carry these millisecond stamps; event
//! ordering itself uses `Instant` on the [`Event`](crate::app::events::Event).

/// Milliseconds since boot (monotonic).
#[cfg(target_os = "espidf")]
pub fn uptime_ms() -> u64 {
    (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000
}

/// Milliseconds since the first call (monotonic).
#[cfg(not(target_os = "espidf"))]
pub fn uptime_ms() -> u64 {
    boot_instant().elapsed().as_millis() as u64
}

/// Seconds since boot (monotonic).
pub fn uptime_secs() -> u64 {
    uptime_ms() / 1_000
}

#[cfg(not(target_os = "espidf"))]
fn boot_instant() -> std::time::Instant {
    static BOOT: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    *BOOT.get_or_init(std::time::Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_monotonic() {
        let a = uptime_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = uptime_ms();
        assert!(b >= a + 4, "expected {b} >= {a} + 4");
    }
}
