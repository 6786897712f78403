//! AeroEnv firmware library.
//!
//! Exposes the controller core for integration testing and for the device
//! binary.  All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module, with in-memory
//! simulations standing in on the host.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod drivers;
pub mod error;
pub mod events;
pub mod managers;
pub mod pins;
pub mod sensors;
