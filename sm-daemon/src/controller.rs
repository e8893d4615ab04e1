//! Safety controller.
//!
//! Owns the mutable control state and the rules that decide fan and heater
//! relay targets each cycle. The single hard rule: whenever the controller
//! cannot trust its data, the outcome is fan ON, heater OFF. Everything else
//! (thresholds, manual overrides, endpoint fallback) layers on top of that.

use chrono::{DateTime, Utc};
use sm_core::{
    calculate_indicators, cpu_temperature, dew_point, heat_index, read_allsky_data, round2,
    Settings,
};
use std::path::Path;
use sm_protocol::{ActuatorMode, ControlMode, OverrideMode, RelayState, Snapshot};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Camera sensors start adding noise above this housing temperature.
const CAMERA_TEMP_LIMIT: f64 = 25.0;

/// Ambient temperature above which the dew heater is never allowed on.
const HEATER_MAX_AMBIENT: f64 = 30.0;

/// Extra headroom over the normal thresholds before a manual fan-OFF
/// override is refused.
const OVERRIDE_MARGIN: f64 = 10.0;

/// Mutable control-service state, shared between the control loop and the
/// API server behind an async mutex.
pub struct ControlState {
    pub snapshot: Option<Snapshot>,
    pub mode: ControlMode,
    pub fan_status: RelayState,
    pub heater_status: RelayState,
    pub fan_override: OverrideMode,
    pub heater_override: OverrideMode,
    pub last_heater_off_time: Option<DateTime<Utc>>,
    pub primary_failure_count: u32,
    pub last_primary_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cycle_count: u64,
    pub control_start_time: DateTime<Utc>,
}

pub type SharedState = Arc<Mutex<ControlState>>;

impl ControlState {
    /// Fresh state in the fail-safe posture: fan ON, heater OFF, no data yet.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            snapshot: None,
            mode: ControlMode::Initializing,
            fan_status: RelayState::On,
            heater_status: RelayState::Off,
            fan_override: OverrideMode::Auto,
            heater_override: OverrideMode::Auto,
            last_heater_off_time: None,
            primary_failure_count: 0,
            last_primary_attempt: None,
            last_error: None,
            cycle_count: 0,
            control_start_time: now,
        }
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.control_start_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn fan_mode(&self) -> ActuatorMode {
        self.fan_override.actuator_mode()
    }

    pub fn heater_mode(&self) -> ActuatorMode {
        self.heater_override.actuator_mode()
    }

    /// Pick the endpoint for this cycle. In FALLBACK mode the primary is
    /// re-probed only after the configured retry interval has elapsed.
    pub fn select_endpoint(&self, settings: &Settings, now: DateTime<Utc>) -> (String, bool) {
        let mut use_primary = true;

        if self.mode == ControlMode::Fallback {
            if let Some(last_attempt) = self.last_primary_attempt {
                let elapsed = (now - last_attempt).num_milliseconds() as f64 / 1000.0;
                if elapsed >= settings.fallback_retry_interval_seconds {
                    info!("Retrying primary endpoint after fallback interval");
                } else {
                    use_primary = false;
                }
            }
        }

        let endpoint = if use_primary {
            settings.primary_endpoint.clone()
        } else {
            settings.fallback_endpoint.clone()
        };
        (endpoint, use_primary)
    }

    /// Record a successful fetch from the given endpoint.
    pub fn record_fetch_success(&mut self, used_primary: bool) {
        if used_primary {
            self.mode = ControlMode::Normal;
            self.primary_failure_count = 0;
        } else {
            self.mode = ControlMode::Fallback;
        }
        self.last_error = None;
    }

    /// Record a failed fetch. Consecutive primary failures past the threshold
    /// switch the controller into FALLBACK mode.
    pub fn record_fetch_failure(
        &mut self,
        used_primary: bool,
        now: DateTime<Utc>,
        settings: &Settings,
    ) {
        if used_primary {
            self.primary_failure_count += 1;
            self.last_primary_attempt = Some(now);
            warn!(
                "Primary endpoint failed (count: {})",
                self.primary_failure_count
            );

            if self.primary_failure_count >= settings.primary_failure_threshold {
                error!("Primary failure threshold exceeded, switching to fallback");
                self.mode = ControlMode::Fallback;
            }
        } else {
            error!("Fallback endpoint also failed");
        }

        self.last_error = Some("Sensor data fetch failed or invalid".to_string());
    }
}

/// Decide fan and heater targets for the current cycle and update the
/// reported statuses.
///
/// When the snapshot is absent, invalid or past the configured data age this
/// returns the fail-safe pair immediately; manual overrides are deliberately
/// not consulted in that branch, because an override without trustworthy
/// data is exactly the case the fail-safe exists for.
pub fn apply_safety_logic(
    state: &mut ControlState,
    settings: &Settings,
    now: DateTime<Utc>,
) -> (bool, bool) {
    let (temp, dp, cpu_temp, camera_temp, raining) = match &state.snapshot {
        Some(s) if s.is_usable(settings.max_data_age_seconds) => (
            s.temperature,
            s.dew_point,
            s.cpu_temperature,
            s.camera_temp,
            s.raining,
        ),
        _ => {
            warn!("Invalid or stale snapshot - enforcing safe defaults (fan ON, heater OFF)");
            state.mode = ControlMode::Stale;
            state.fan_status = RelayState::On;
            state.heater_status = RelayState::Off;
            return (true, false);
        }
    };

    let dew_risk = matches!(
        (temp, dp),
        (Some(t), Some(d)) if t < d + settings.dewpoint_threshold
    );

    let fan_on = match state.fan_override {
        OverrideMode::Auto => {
            let cpu_hot = cpu_temp.is_some_and(|v| v > settings.cpu_temp_threshold);
            let camera_hot = camera_temp.is_some_and(|v| v > CAMERA_TEMP_LIMIT);
            let ambient_hot = temp.is_some_and(|v| v > settings.ambient_temp_threshold);
            cpu_hot || camera_hot || ambient_hot || dew_risk
        }
        OverrideMode::ForceOn => true,
        OverrideMode::ForceOff => {
            let mut fan_on = false;
            if let Some(cpu) = cpu_temp {
                if cpu > settings.cpu_temp_threshold + OVERRIDE_MARGIN {
                    fan_on = true;
                    warn!("Fan manual override rejected: CPU temp critical ({}C)", cpu);
                }
            }
            if let Some(t) = temp {
                if t > settings.ambient_temp_threshold + OVERRIDE_MARGIN {
                    fan_on = true;
                    warn!("Fan manual override rejected: ambient temp critical ({}C)", t);
                }
            }
            fan_on
        }
    };

    let min_off_elapsed = match state.last_heater_off_time {
        None => true,
        Some(off_at) => {
            let elapsed = (now - off_at).num_milliseconds() as f64 / 1000.0;
            elapsed >= settings.heater_min_off_time_seconds
        }
    };

    let heater_on = match state.heater_override {
        OverrideMode::Auto => {
            let no_rain = raining.map_or(true, |r| r == 0.0);
            dew_risk && no_rain && min_off_elapsed
        }
        OverrideMode::ForceOff => false,
        OverrideMode::ForceOn => {
            let mut heater_on = true;
            if raining.is_some_and(|r| r > 0.0) {
                heater_on = false;
                warn!("Heater manual override rejected: rain detected");
            }
            if temp.is_some_and(|t| t > HEATER_MAX_AMBIENT) {
                heater_on = false;
                warn!(
                    "Heater manual override rejected: temp too high ({:?}C)",
                    temp
                );
            }
            if heater_on && !min_off_elapsed {
                heater_on = false;
                warn!(
                    "Heater manual override rejected: min off time not met (< {}s)",
                    settings.heater_min_off_time_seconds
                );
            }
            heater_on
        }
    };

    // Track the ON -> OFF transition for the minimum-off-time window
    if !heater_on && state.heater_status == RelayState::On {
        state.last_heater_off_time = Some(now);
    }

    state.fan_status = RelayState::from_bool(fan_on);
    state.heater_status = RelayState::from_bool(heater_on);

    (fan_on, heater_on)
}

/// Enrich a fetched snapshot with dew point, heat index, sky indicators and
/// the local probes (CPU temperature, AllSky camera file). Failures leave
/// the affected field absent.
pub fn compute_derived_values(snapshot: &mut Snapshot, settings: &Settings) {
    if let (Some(temp), Some(humidity)) = (snapshot.temperature, snapshot.humidity) {
        if (0.0..=100.0).contains(&humidity) {
            match dew_point(temp, humidity) {
                Ok(dp) => snapshot.dew_point = Some(round2(dp)),
                Err(e) => warn!("Failed to compute dew point: {}", e),
            }
            match heat_index(temp, humidity) {
                Ok(hi) => snapshot.heat_index = Some(hi),
                Err(e) => warn!("Failed to compute heat index: {}", e),
            }
        }
    }

    // Stations without a dedicated ambient probe use the air temperature
    let ambient = snapshot.ambient_temperature.or(snapshot.temperature);
    let indicators = calculate_indicators(ambient, snapshot.sky_temperature, snapshot.sqm_lux);
    snapshot.cloud_coverage = indicators.cloud_coverage.map(round2);
    snapshot.cloud_coverage_indicator = indicators.cloud_coverage_indicator.map(round2);
    snapshot.brightness = indicators.brightness.map(round2);
    snapshot.bortle = indicators.bortle.map(round2);

    let allsky = read_allsky_data(Path::new(&settings.allsky_data_file));
    snapshot.camera_temp = allsky.camera_temp;
    snapshot.star_count = allsky.star_count;
    snapshot.day_or_night = allsky.day_or_night;

    if let Some(cpu) = cpu_temperature() {
        snapshot.cpu_temperature = Some(cpu);
    }
}
