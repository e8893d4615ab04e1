//! Settings for the control service.
//!
//! Settings are owned by an external collaborator (the dashboard writes the
//! JSON file); the daemon reads them fresh every control cycle and treats
//! them as an immutable value per cycle. A missing or unparsable file falls
//! back to compiled defaults so the control loop never stalls on bad config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Which sensor source strategy the deployment uses. Exactly one is active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    Http,
    Serial,
}

/// Control service configuration.
///
/// Field defaults mirror the dashboard's settings form; unknown keys in the
/// file are ignored, missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_raining_threshold")]
    pub raining_threshold: f64,
    #[serde(default = "default_ambient_temp_threshold")]
    pub ambient_temp_threshold: f64,
    #[serde(default = "default_dewpoint_threshold")]
    pub dewpoint_threshold: f64,
    #[serde(default = "default_cpu_temp_threshold")]
    pub cpu_temp_threshold: f64,
    /// Control loop cadence in seconds.
    #[serde(default = "default_sleep_time")]
    pub sleep_time: f64,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_endpoint")]
    pub primary_endpoint: String,
    #[serde(default = "default_endpoint")]
    pub fallback_endpoint: String,
    /// Consecutive primary fetch failures before switching to fallback.
    #[serde(default = "default_primary_failure_threshold")]
    pub primary_failure_threshold: u32,
    #[serde(default = "default_max_data_age_seconds")]
    pub max_data_age_seconds: f64,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: f64,
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: f64,
    /// How long to stay on the fallback endpoint before re-probing primary.
    #[serde(default = "default_fallback_retry_interval_seconds")]
    pub fallback_retry_interval_seconds: f64,
    /// Minimum time the heater must stay off between activations.
    #[serde(default = "default_heater_min_off_time_seconds")]
    pub heater_min_off_time_seconds: f64,
    #[serde(default)]
    pub data_source: DataSource,
    #[serde(default = "default_serial_port_json")]
    pub serial_port_json: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Status file written by the AllSky capture software.
    #[serde(default = "default_allsky_data_file")]
    pub allsky_data_file: String,
}

fn default_raining_threshold() -> f64 {
    100.0
}

fn default_ambient_temp_threshold() -> f64 {
    20.0
}

fn default_dewpoint_threshold() -> f64 {
    2.0
}

fn default_cpu_temp_threshold() -> f64 {
    65.0
}

fn default_sleep_time() -> f64 {
    10.0
}

fn default_control_port() -> u16 {
    5001
}

fn default_endpoint() -> String {
    "https://meetjestad.net/data/?type=sensors&ids=580&format=json&limit=1".to_string()
}

fn default_primary_failure_threshold() -> u32 {
    3
}

fn default_max_data_age_seconds() -> f64 {
    300.0
}

fn default_http_timeout_seconds() -> f64 {
    2.0
}

fn default_retry_backoff_seconds() -> f64 {
    2.0
}

fn default_fallback_retry_interval_seconds() -> f64 {
    300.0
}

fn default_heater_min_off_time_seconds() -> f64 {
    600.0
}

fn default_serial_port_json() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_allsky_data_file() -> String {
    "/home/pi/allsky/tmp/allskydata.json".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        // Round-trip through an empty object so every field takes its serde
        // default; keeps Default and deserialization in lockstep.
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!())
    }
}

/// Load settings from the given path, falling back to defaults on any
/// failure. Never returns an error: bad configuration must not stop the
/// safety loop.
pub fn load_settings(path: &Path) -> Settings {
    if !path.exists() {
        info!("Settings file not found at {:?}, using defaults", path);
        return Settings::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read settings file {:?}: {} - using defaults", path, e);
            return Settings::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Error decoding settings file {:?}: {} - using defaults", path, e);
            Settings::default()
        }
    }
}
