//! Shared wire types for the Skymonitor control API.
//!
//! The control daemon exposes a small local HTTP surface (`/status`,
//! `/health`, `/actuators`) consumed by the dashboard UI. The JSON shapes in
//! this crate are the contract for that surface: field names and enum
//! spellings are fixed and must not change without coordinating with the UI.

use serde::{Deserialize, Serialize};

/// Maximum accepted HTTP request size in bytes (8KB)
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

// ============================================================================
// Snapshot
// ============================================================================

/// One normalized sensor reading plus derived indicators for a single cycle.
///
/// Constructed fresh each fetch cycle and never mutated once handed to the
/// safety controller; the next cycle supersedes it. All numeric fields are
/// optional: absence means "not measured", never zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub valid: bool,
    pub errors: Vec<String>,
    pub received_timestamp: String,
    pub measurement_timestamp: Option<String>,
    pub age_seconds: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub dew_point: Option<f64>,
    pub heat_index: Option<f64>,
    pub raining: Option<f64>,
    pub wind: Option<f64>,
    pub sky_temperature: Option<f64>,
    pub ambient_temperature: Option<f64>,
    pub sqm_ir: Option<f64>,
    pub sqm_full: Option<f64>,
    pub sqm_visible: Option<f64>,
    pub sqm_lux: Option<f64>,
    pub camera_temp: Option<f64>,
    pub star_count: Option<i64>,
    pub day_or_night: Option<String>,
    pub cloud_coverage: Option<f64>,
    pub cloud_coverage_indicator: Option<f64>,
    pub brightness: Option<f64>,
    pub bortle: Option<f64>,
    pub cpu_temperature: Option<f64>,
}

impl Snapshot {
    /// Create an empty, invalid snapshot stamped with the receive time.
    pub fn new(received_timestamp: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: Vec::new(),
            received_timestamp: received_timestamp.into(),
            measurement_timestamp: None,
            age_seconds: None,
            temperature: None,
            humidity: None,
            dew_point: None,
            heat_index: None,
            raining: None,
            wind: None,
            sky_temperature: None,
            ambient_temperature: None,
            sqm_ir: None,
            sqm_full: None,
            sqm_visible: None,
            sqm_lux: None,
            camera_temp: None,
            star_count: None,
            day_or_night: None,
            cloud_coverage: None,
            cloud_coverage_indicator: None,
            brightness: None,
            bortle: None,
            cpu_temperature: None,
        }
    }

    /// Record a fetch/parse error against this snapshot.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// A snapshot is usable for control decisions only when the required
    /// fields are present and the data (if its age is known) is fresh.
    pub fn is_usable(&self, max_age_seconds: f64) -> bool {
        if !self.valid {
            return false;
        }
        if self.temperature.is_none() || self.humidity.is_none() {
            return false;
        }
        match self.age_seconds {
            Some(age) => age <= max_age_seconds,
            None => true,
        }
    }
}

// ============================================================================
// Control State Enums
// ============================================================================

/// Controller mode as exposed via the API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMode {
    Initializing,
    Normal,
    Fallback,
    Stale,
    Error,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Initializing => "INITIALIZING",
            ControlMode::Normal => "NORMAL",
            ControlMode::Fallback => "FALLBACK",
            ControlMode::Stale => "STALE",
            ControlMode::Error => "ERROR",
        }
    }
}

/// Logical relay state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    pub fn from_bool(on: bool) -> Self {
        if on { RelayState::On } else { RelayState::Off }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, RelayState::On)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::On => "ON",
            RelayState::Off => "OFF",
        }
    }
}

/// Whether an actuator follows the safety state machine or an operator force.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActuatorMode {
    Auto,
    Manual,
}

/// Operator override for a single actuator. AUTO follows the state machine;
/// forced states are still subject to hard safety vetoes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    #[default]
    Auto,
    ForceOn,
    ForceOff,
}

impl OverrideMode {
    pub fn actuator_mode(&self) -> ActuatorMode {
        match self {
            OverrideMode::Auto => ActuatorMode::Auto,
            _ => ActuatorMode::Manual,
        }
    }
}

// ============================================================================
// Actuator Commands (POST /actuators)
// ============================================================================

/// A single actuator command string from the API body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Auto,
    On,
    Off,
}

impl ActuatorCommand {
    /// Parse a command string ("on" | "off" | "auto", case-insensitive).
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.to_ascii_lowercase().as_str() {
            "auto" => Ok(ActuatorCommand::Auto),
            "on" => Ok(ActuatorCommand::On),
            "off" => Ok(ActuatorCommand::Off),
            other => Err(format!("Invalid command: {}", other)),
        }
    }

    pub fn override_mode(&self) -> OverrideMode {
        match self {
            ActuatorCommand::Auto => OverrideMode::Auto,
            ActuatorCommand::On => OverrideMode::ForceOn,
            ActuatorCommand::Off => OverrideMode::ForceOff,
        }
    }
}

/// Body of `POST /actuators`. Each field is independent; an invalid value in
/// one does not prevent the other from being applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActuatorRequest {
    #[serde(default)]
    pub fan: Option<String>,
    #[serde(default)]
    pub heater: Option<String>,
}

/// Per-field acknowledgement in the `/actuators` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActuatorAck {
    Applied {
        mode: ActuatorMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<RelayState>,
        message: String,
    },
    Rejected {
        error: String,
    },
}

/// Actually-applied actuator state, reported after the override has been
/// re-evaluated through the safety logic (so vetoes are visible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedState {
    pub fan_status: RelayState,
    pub heater_status: RelayState,
    pub fan_mode: ActuatorMode,
    pub heater_mode: ActuatorMode,
}

/// Response body of `POST /actuators`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorResponse {
    pub fan: Option<ActuatorAck>,
    pub heater: Option<ActuatorAck>,
    pub applied_state: AppliedState,
}

// ============================================================================
// Status and Health (GET /status, GET /health)
// ============================================================================

/// Response body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub snapshot: Option<Snapshot>,
    pub age_seconds: Option<f64>,
    pub mode: ControlMode,
    pub fan_status: RelayState,
    pub heater_status: RelayState,
    pub fan_mode: ActuatorMode,
    pub heater_mode: ActuatorMode,
    pub last_error: Option<String>,
    pub cycle_count: u64,
    pub uptime_seconds: f64,
}

/// Response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub mode: ControlMode,
    pub active_endpoint: String,
    pub uptime_seconds: f64,
}

// ============================================================================
// Persisted State
// ============================================================================

/// Durable state record written every 10th cycle for crash diagnostics.
/// Never reloaded into live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub snapshot: Snapshot,
    pub mode: ControlMode,
    pub timestamp: String,
}
