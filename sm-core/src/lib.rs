//! Core library for the Skymonitor control service.
//!
//! Domain logic shared by the daemon: configuration, derived weather
//! indicators, durable state snapshots and the local probes (CPU
//! temperature, AllSky camera status file).
//! Network I/O and actuator control live in sm-daemon.

pub mod allsky;
pub mod indicators;
pub mod persistence;
pub mod settings;
pub mod system;

pub use allsky::{read_allsky_data, AllskyData};
pub use indicators::{calculate_indicators, dew_point, heat_index, Indicators};
pub use persistence::save_state_snapshot;
pub use settings::{load_settings, DataSource, Settings};
pub use system::cpu_temperature;

// Re-export the wire-level data model; the snapshot shape is part of the API
// contract and lives in sm-protocol.
pub use sm_protocol::Snapshot;

/// Round to 1 decimal place (reported temperatures/humidity).
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to 2 decimal places (derived indicators).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
