//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! against the simulated board.  All tests run on the host (x86_64) with
//! no real hardware required.

mod bus_tests;
mod command_tests;
mod config_tests;
mod coordinator_tests;
mod emergency_tests;
mod mock_hw;
mod nozzle_timing_tests;
