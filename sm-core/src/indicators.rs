//! Derived weather indicators.
//!
//! Pure functions computing dew point, heat index, cloud coverage, sky
//! brightness and Bortle class from raw snapshot fields. Math-domain
//! failures (non-positive humidity or lux, zero ambient temperature) are
//! reported instead of producing NaN/inf so a single bad field never poisons
//! a control cycle.

use sm_error::{Result, SkymonitorError};
use tracing::warn;

// Magnus formula constants
const MAGNUS_B: f64 = 17.62;
const MAGNUS_C: f64 = 243.12;

/// Cloud coverage, sky brightness and Bortle class for one snapshot.
/// All fields absent when any input was missing or out of domain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Indicators {
    pub cloud_coverage: Option<f64>,
    pub cloud_coverage_indicator: Option<f64>,
    pub brightness: Option<f64>,
    pub bortle: Option<f64>,
}

/// Dew point in Celsius via the Magnus formula.
///
/// Humidity must lie in (0, 100]: `ln` of a non-positive ratio is undefined.
pub fn dew_point(temperature: f64, humidity: f64) -> Result<f64> {
    if !(humidity > 0.0 && humidity <= 100.0) {
        return Err(SkymonitorError::math_domain(
            "dew_point",
            format!("humidity {} outside (0, 100]", humidity),
        ));
    }

    let gamma = (MAGNUS_B * temperature) / (MAGNUS_C + temperature) + (humidity / 100.0).ln();
    Ok((MAGNUS_C * gamma) / (MAGNUS_B - gamma))
}

/// Heat index in Celsius, rounded to 1 decimal place.
///
/// Standard Steadman/Rothfusz formulation: the simple approximation is used
/// below the regression's validity range, the full regression with
/// low-humidity and high-humidity adjustments above it.
pub fn heat_index(temperature: f64, humidity: f64) -> Result<f64> {
    if !(0.0..=100.0).contains(&humidity) {
        return Err(SkymonitorError::math_domain(
            "heat_index",
            format!("humidity {} outside [0, 100]", humidity),
        ));
    }

    let t = temperature * 9.0 / 5.0 + 32.0;
    let rh = humidity;

    let simple = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);
    let hi_f = if (simple + t) / 2.0 < 80.0 {
        simple
    } else {
        let mut hi = -42.379 + 2.04901523 * t + 10.14333127 * rh
            - 0.22475541 * t * rh
            - 6.83783e-3 * t * t
            - 5.481717e-2 * rh * rh
            + 1.22874e-3 * t * t * rh
            + 8.5282e-4 * t * rh * rh
            - 1.99e-6 * t * t * rh * rh;

        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 2.0);
        }
        hi
    };

    let hi_c = (hi_f - 32.0) * 5.0 / 9.0;
    Ok(crate::round1(hi_c))
}

/// Compute cloud coverage, sky brightness and Bortle class.
///
/// Requires all three inputs present, a non-zero ambient temperature and a
/// positive lux reading; otherwise every indicator is absent and the specific
/// offending input is logged.
pub fn calculate_indicators(
    ambient_temperature: Option<f64>,
    sky_temperature: Option<f64>,
    sqm_lux: Option<f64>,
) -> Indicators {
    let ambient = match ambient_temperature {
        Some(v) => v,
        None => {
            warn!("Indicators skipped: missing ambient_temperature");
            return Indicators::default();
        }
    };
    let sky = match sky_temperature {
        Some(v) => v,
        None => {
            warn!("Indicators skipped: missing sky_temperature");
            return Indicators::default();
        }
    };
    let lux = match sqm_lux {
        Some(v) => v,
        None => {
            warn!("Indicators skipped: missing sqm_lux");
            return Indicators::default();
        }
    };

    if ambient == 0.0 {
        warn!("Indicators skipped: ambient_temperature is zero (cloud coverage undefined)");
        return Indicators::default();
    }
    if lux <= 0.0 {
        warn!("Indicators skipped: sqm_lux {} not positive (log10 undefined)", lux);
        return Indicators::default();
    }

    let cloud_coverage = (sky - ambient) / ambient;
    let cloud_coverage_indicator = ambient - sky;
    let brightness = 22.0 - 2.512 * lux.log10();
    let bortle = 1539.7 * 2.7_f64.powf(-0.28 * brightness);

    Indicators {
        cloud_coverage: Some(cloud_coverage),
        cloud_coverage_indicator: Some(cloud_coverage_indicator),
        brightness: Some(brightness),
        bortle: Some(bortle),
    }
}
