//! Multi-device motion-tracker recorder
//! Discovers BLE motion trackers, keeps a selected set of them connected and records
//! their decoded telemetry to per-device CSV files while buffering it for live display.

pub mod config;
pub mod core;
pub mod logging;
pub mod utils;
