//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements     | Connects to                    |
//! |------------|----------------|--------------------------------|
//! | `hardware` | HardwarePort   | ESP32 GPIO, ADC1, LEDC, I²C    |
//! | `log_sink` | bus subscriber | Serial log output              |
//! | `nvs`      | StoragePort    | NVS / in-memory store          |
//! | `time`     | -              | ESP32 system timer             |

pub mod hardware;
pub mod log_sink;
pub mod nvs;
pub mod time;
