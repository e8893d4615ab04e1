//! Host sensor probes.

use std::path::Path;
use tracing::warn;

const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// CPU temperature in Celsius, rounded to 2 decimals, or None if the thermal
/// zone cannot be read (non-Linux hosts, mock deployments).
pub fn cpu_temperature() -> Option<f64> {
    cpu_temperature_from(Path::new(THERMAL_ZONE_PATH))
}

fn cpu_temperature_from(path: &Path) -> Option<f64> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to fetch CPU temperature from {:?}: {}", path, e);
            return None;
        }
    };

    // Kernel reports millidegrees Celsius
    match contents.trim().parse::<f64>() {
        Ok(millidegrees) => Some(crate::round2(millidegrees / 1000.0)),
        Err(e) => {
            warn!("Failed to parse CPU temperature {:?}: {}", contents.trim(), e);
            None
        }
    }
}
