//! Application core: configuration, commands and the event vocabulary.
//!
//! Everything here talks to hardware and flash only through the **port
//! traits** in [`ports`], so the whole layer runs under `cargo test` on
//! the host with simulated adapters.

pub mod commands;
pub mod config_store;
pub mod events;
pub mod ports;
