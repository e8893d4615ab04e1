//! AllSky camera probe.
//!
//! The AllSky capture software drops a JSON status file on local disk. The
//! controller reads it each cycle for the camera housing temperature (which
//! feeds the fan rules), the day/night flag and the star count. Like the CPU
//! temperature probe, any failure just leaves the fields absent.

use std::path::Path;
use tracing::warn;

/// Camera fields read from the AllSky status file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllskyData {
    pub camera_temp: Option<f64>,
    pub star_count: Option<i64>,
    pub day_or_night: Option<String>,
}

/// Read the AllSky status file at `path`. Every field absent on failure.
pub fn read_allsky_data(path: &Path) -> AllskyData {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("AllSky data file not readable at {:?}: {}", path, e);
            return AllskyData::default();
        }
    };

    let data: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!("Invalid AllSky data in {:?}: {}", path, e);
            return AllskyData::default();
        }
    };

    let camera_temp = number_field(&data, "AS_TEMPERATURE_C").map(f64::trunc);
    let day_or_night = data
        .get("DAY_OR_NIGHT")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    // Star counts only mean anything at night; daytime reads as zero
    let star_count = if day_or_night.as_deref() == Some("NIGHT") {
        number_field(&data, "AS_STARCOUNT")
            .map(|v| v as i64)
            .or(Some(0))
    } else {
        Some(0)
    };

    AllskyData {
        camera_temp,
        star_count,
        day_or_night,
    }
}

/// AllSky serializes most values as strings; accept both spellings.
fn number_field(data: &serde_json::Value, key: &str) -> Option<f64> {
    match data.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_allsky(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json).unwrap();
        file
    }

    #[test]
    fn test_night_data() {
        let file = write_allsky(
            r#"{"AS_TEMPERATURE_C": "21", "DAY_OR_NIGHT": "NIGHT", "AS_STARCOUNT": "137"}"#,
        );
        let data = read_allsky_data(file.path());
        assert_eq!(data.camera_temp, Some(21.0));
        assert_eq!(data.day_or_night.as_deref(), Some("NIGHT"));
        assert_eq!(data.star_count, Some(137));
    }

    #[test]
    fn test_day_star_count_is_zero() {
        let file = write_allsky(
            r#"{"AS_TEMPERATURE_C": 27.8, "DAY_OR_NIGHT": "DAY", "AS_STARCOUNT": "42"}"#,
        );
        let data = read_allsky_data(file.path());
        // Fractional camera temps are truncated like the capture software's
        assert_eq!(data.camera_temp, Some(27.0));
        assert_eq!(data.star_count, Some(0));
    }

    #[test]
    fn test_night_without_star_count() {
        let file = write_allsky(r#"{"DAY_OR_NIGHT": "NIGHT"}"#);
        let data = read_allsky_data(file.path());
        assert_eq!(data.camera_temp, None);
        assert_eq!(data.star_count, Some(0));
    }

    #[test]
    fn test_missing_file() {
        let data = read_allsky_data(Path::new("/nonexistent/allskydata.json"));
        assert_eq!(data, AllskyData::default());
    }

    #[test]
    fn test_garbage_contents() {
        let file = write_allsky("{not json");
        let data = read_allsky_data(file.path());
        assert_eq!(data, AllskyData::default());
    }
}
