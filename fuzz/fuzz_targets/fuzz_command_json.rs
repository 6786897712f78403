//! Fuzz target: `CommandHandler::process_json`
//!
//! Feeds arbitrary text to the command intake and checks:
//! - No panics, whatever the input
//! - Exactly one `command.status` confirmation per call
//! - A confirmation for text that is not a command is always `error`
//!
//! cargo fuzz run fuzz_command_json

#![no_main]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aeroenv::app::commands::{Command, CommandHandler, CommandStatus};
use aeroenv::app::events::topics;
use aeroenv::app::ports::RestartPort;
use aeroenv::events::EventBus;
use libfuzzer_sys::fuzz_target;

struct NoRestart;

impl RestartPort for NoRestart {
    fn restart(&self) {}
}

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    let bus = Arc::new(EventBus::new());
    let statuses = Arc::new(AtomicUsize::new(0));
    let counter = statuses.clone();
    bus.subscribe(topics::COMMAND_STATUS, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    let handler = CommandHandler::with_restart_delay(bus, Arc::new(NoRestart), Duration::ZERO);
    let confirmation = handler.process_json(text, "fuzz");

    assert_eq!(statuses.load(Ordering::Relaxed), 1, "expected exactly one confirmation");
    if Command::from_json(text, "fuzz").is_err() {
        assert_eq!(confirmation.status, CommandStatus::Error);
    }
});
