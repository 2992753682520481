// logsieve - platform/mod.rs
//
// Platform abstraction layer: config directories and system memory readings.
// Dependencies: util, core value types, directories crate.
// Must NOT depend on: app.

pub mod config;
pub mod memory;
