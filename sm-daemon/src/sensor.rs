//! Sensor data sources.
//!
//! Two strategies produce the same normalized [`Snapshot`]: an HTTP poller
//! (primary deployment) and a legacy line-delimited JSON serial reader. Only
//! one is active per deployment, selected by `Settings::data_source`.
//!
//! Both are pure with respect to controller state: they return a snapshot
//! with `valid` and an accumulated error list, and the safety controller
//! decides what to do with it.

use chrono::{DateTime, Utc};
use sm_core::{round1, Settings, Snapshot};
use sm_error::{Result, SkymonitorError};
use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::http;

/// Fetch attempts per cycle before giving up.
const MAX_RETRIES: u32 = 3;

/// Idle wait between serial polls when the device has no pending line.
const SERIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fetch a snapshot using the strategy configured in settings.
pub async fn fetch_snapshot(endpoint: &str, settings: &Settings) -> Snapshot {
    match settings.data_source {
        sm_core::DataSource::Http => fetch_sensor_data_http(endpoint, settings).await,
        sm_core::DataSource::Serial => fetch_sensor_data_serial(settings).await,
    }
}

/// Fetch sensor data via HTTP with bounded retries and backoff.
pub async fn fetch_sensor_data_http(endpoint: &str, settings: &Settings) -> Snapshot {
    let mut snapshot = Snapshot::new(Utc::now().to_rfc3339());
    let timeout = Duration::from_secs_f64(settings.http_timeout_seconds.max(0.1));
    let backoff = settings.retry_backoff_seconds.max(0.0);

    for attempt in 0..MAX_RETRIES {
        match attempt_http(endpoint, timeout, settings, &mut snapshot).await {
            Ok(()) => {
                info!(
                    "HTTP fetch successful: temp={:?}, humid={:?}, age={:?}s",
                    snapshot.temperature, snapshot.humidity, snapshot.age_seconds
                );
                return snapshot;
            }
            Err(e) => {
                snapshot.push_error(e.to_string());
                warn!(
                    "HTTP fetch failed (attempt {}/{}): {}",
                    attempt + 1,
                    MAX_RETRIES,
                    e
                );
            }
        }

        if attempt + 1 < MAX_RETRIES {
            tokio::time::sleep(Duration::from_secs_f64(backoff * (attempt + 1) as f64)).await;
        }
    }

    snapshot.valid = false;
    error!(
        "HTTP fetch failed after {} attempts: {:?}",
        MAX_RETRIES, snapshot.errors
    );
    snapshot
}

async fn attempt_http(
    endpoint: &str,
    timeout: Duration,
    settings: &Settings,
    snapshot: &mut Snapshot,
) -> Result<()> {
    let response = http::http_get(endpoint, timeout).await?;

    if !(200..300).contains(&response.status) {
        return Err(SkymonitorError::Http(format!(
            "HTTP status {}",
            response.status
        )));
    }

    let data: serde_json::Value = serde_json::from_slice(&response.body)?;
    let record = data
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| SkymonitorError::Http("Empty or invalid JSON response".into()))?;

    apply_record(snapshot, record, settings.max_data_age_seconds, Utc::now())
}

/// Fetch sensor data from the legacy serial device (line-delimited JSON).
pub async fn fetch_sensor_data_serial(settings: &Settings) -> Snapshot {
    let mut snapshot = Snapshot::new(Utc::now().to_rfc3339());
    let port = settings.serial_port_json.clone();
    // Serial has no per-attempt retries; the whole wait reuses the HTTP
    // retry budget as its overall bound.
    let overall = Duration::from_secs_f64(
        (settings.http_timeout_seconds * MAX_RETRIES as f64).max(0.5),
    );
    let max_age = settings.max_data_age_seconds;

    let read_result =
        tokio::task::spawn_blocking(move || read_serial_record(Path::new(&port), overall)).await;

    match read_result {
        Ok(Ok(record)) => {
            if let Err(e) = apply_record(&mut snapshot, &record, max_age, Utc::now()) {
                snapshot.valid = false;
                snapshot.push_error(e.to_string());
                warn!("Serial record rejected: {}", e);
            } else {
                info!(
                    "Serial fetch successful: temp={:?}, humid={:?}",
                    snapshot.temperature, snapshot.humidity
                );
            }
        }
        Ok(Err(e)) => {
            snapshot.push_error(e.to_string());
            warn!("Serial fetch failed: {}", e);
        }
        Err(e) => {
            snapshot.push_error(format!("Serial read task panicked: {}", e));
            error!("Serial read task panicked: {}", e);
        }
    }

    snapshot
}

/// Blocking line reader: skip noise until a JSON object arrives or the
/// deadline passes. Undecodable bytes are tolerated (lossy decode) and lines
/// that fail JSON parsing are skipped.
fn read_serial_record(port: &Path, overall: Duration) -> Result<serde_json::Value> {
    let file = std::fs::File::open(port)
        .map_err(|e| SkymonitorError::Serial(format!("open {:?}: {}", port, e)))?;
    let mut reader = std::io::BufReader::new(file);

    let deadline = Instant::now() + overall;
    let mut raw: Vec<u8> = Vec::with_capacity(512);

    while Instant::now() < deadline {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|e| SkymonitorError::Serial(format!("read {:?}: {}", port, e)))?;

        if n == 0 {
            // No pending data on the device
            std::thread::sleep(SERIAL_POLL_INTERVAL);
            continue;
        }

        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => debug!("Skipping non-object serial line"),
            Err(e) => debug!("Skipping undecodable serial line: {}", e),
        }
    }

    Err(SkymonitorError::Timeout(format!(
        "no JSON line from {:?} within {:?}",
        port, overall
    )))
}

/// Numeric field that may arrive as a JSON number or numeric string.
fn number_field(record: &serde_json::Value, key: &str) -> Option<f64> {
    match record.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalize one raw sensor record into the snapshot.
///
/// Requires temperature and humidity; validates data age against
/// `max_age_seconds` when a measurement timestamp is present. Optional
/// fields are copied through when the record carries them.
fn apply_record(
    snapshot: &mut Snapshot,
    record: &serde_json::Value,
    max_age_seconds: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    let temperature = number_field(record, "temperature");
    let humidity = number_field(record, "humidity");

    if temperature.is_none() || humidity.is_none() {
        return Err(SkymonitorError::MissingField(
            "temperature or humidity".into(),
        ));
    }

    if let Some(ts) = record.get("timestamp").and_then(|v| v.as_str()) {
        match DateTime::parse_from_rfc3339(ts) {
            Ok(measured) => {
                let measured = measured.with_timezone(&Utc);
                snapshot.measurement_timestamp = Some(measured.to_rfc3339());
                let age = (now - measured).num_milliseconds() as f64 / 1000.0;
                snapshot.age_seconds = Some(age);

                if age > max_age_seconds {
                    return Err(SkymonitorError::StaleData {
                        age_seconds: age,
                        max_age_seconds,
                    });
                }
            }
            // Unparsable timestamps are recorded but not fatal; the reading
            // itself is still usable.
            Err(e) => snapshot.push_error(format!("Timestamp parse error: {}", e)),
        }
    }

    snapshot.temperature = temperature.map(round1);
    snapshot.humidity = humidity.map(round1);
    snapshot.valid = true;

    snapshot.raining = number_field(record, "rain").or_else(|| number_field(record, "rain_intensity"));
    if let Some(wind) = number_field(record, "wind_speed") {
        snapshot.wind = Some(wind);
    }

    // Sky-quality fields from the ESP all-in-one sensor head
    snapshot.sky_temperature = number_field(record, "sky_temperature").or(snapshot.sky_temperature);
    snapshot.ambient_temperature =
        number_field(record, "ambient_temperature").or(snapshot.ambient_temperature);
    snapshot.sqm_lux = number_field(record, "sqm_lux").or(snapshot.sqm_lux);
    snapshot.sqm_ir = number_field(record, "sqm_ir").or(snapshot.sqm_ir);
    snapshot.sqm_full = number_field(record, "sqm_full").or(snapshot.sqm_full);
    snapshot.sqm_visible = number_field(record, "sqm_visible").or(snapshot.sqm_visible);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fresh_timestamp() -> String {
        Utc::now().to_rfc3339()
    }

    #[test]
    fn test_apply_record_happy_path() {
        let record = serde_json::json!({
            "temperature": 20.55,
            "humidity": 49.96,
            "timestamp": fresh_timestamp(),
            "wind_speed": 3.2,
            "rain": 0,
        });
        let mut snapshot = Snapshot::new(fresh_timestamp());

        apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap();

        assert!(snapshot.valid);
        assert_eq!(snapshot.temperature, Some(20.6));
        assert_eq!(snapshot.humidity, Some(50.0));
        assert_eq!(snapshot.wind, Some(3.2));
        assert_eq!(snapshot.raining, Some(0.0));
        assert!(snapshot.age_seconds.unwrap() < 5.0);
    }

    #[test]
    fn test_apply_record_string_numbers() {
        // Some station firmware serializes readings as strings
        let record = serde_json::json!({"temperature": "18.3", "humidity": "72"});
        let mut snapshot = Snapshot::new(fresh_timestamp());

        apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap();
        assert_eq!(snapshot.temperature, Some(18.3));
        assert_eq!(snapshot.humidity, Some(72.0));
    }

    #[test]
    fn test_apply_record_missing_required() {
        let record = serde_json::json!({"temperature": 20.0});
        let mut snapshot = Snapshot::new(fresh_timestamp());

        let err = apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("temperature or humidity"));
        assert!(!snapshot.valid);
    }

    #[test]
    fn test_apply_record_stale_data() {
        let old = (Utc::now() - chrono::Duration::seconds(400)).to_rfc3339();
        let record = serde_json::json!({
            "temperature": 20.0,
            "humidity": 50.0,
            "timestamp": old,
        });
        let mut snapshot = Snapshot::new(fresh_timestamp());

        let err = apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap_err();
        assert!(matches!(err, SkymonitorError::StaleData { .. }));
        assert!(!snapshot.valid);
        // Age is still recorded for diagnostics
        assert!(snapshot.age_seconds.unwrap() > 300.0);
    }

    #[test]
    fn test_apply_record_bad_timestamp_not_fatal() {
        let record = serde_json::json!({
            "temperature": 20.0,
            "humidity": 50.0,
            "timestamp": "yesterday-ish",
        });
        let mut snapshot = Snapshot::new(fresh_timestamp());

        apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap();
        assert!(snapshot.valid);
        assert!(snapshot.errors[0].contains("Timestamp parse error"));
    }

    #[test]
    fn test_apply_record_rain_intensity_alias() {
        let record = serde_json::json!({
            "temperature": 20.0,
            "humidity": 50.0,
            "rain_intensity": 120,
        });
        let mut snapshot = Snapshot::new(fresh_timestamp());
        apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap();
        assert_eq!(snapshot.raining, Some(120.0));
    }

    #[test]
    fn test_apply_record_sky_fields() {
        let record = serde_json::json!({
            "temperature": 20.5,
            "humidity": 50.0,
            "sky_temperature": 15.5,
            "ambient_temperature": 20.5,
            "sqm_lux": 200.0,
        });
        let mut snapshot = Snapshot::new(fresh_timestamp());
        apply_record(&mut snapshot, &record, 300.0, Utc::now()).unwrap();
        assert_eq!(snapshot.sky_temperature, Some(15.5));
        assert_eq!(snapshot.ambient_temperature, Some(20.5));
        assert_eq!(snapshot.sqm_lux, Some(200.0));
    }

    #[test]
    fn test_read_serial_record_skips_noise() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "raining,120").unwrap();
        file.write_all(&[0xff, 0xfe, b'\n']).unwrap();
        writeln!(file, "{{\"temperature\": 12.5, \"humidity\": 80}}").unwrap();
        file.flush().unwrap();

        let record =
            read_serial_record(file.path(), Duration::from_millis(500)).unwrap();
        assert_eq!(record["temperature"], 12.5);
    }

    #[test]
    fn test_read_serial_record_times_out_on_noise_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json at all").unwrap();
        file.flush().unwrap();

        let err = read_serial_record(file.path(), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, SkymonitorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fetch_http_exhausts_retries() {
        let mut settings = Settings::default();
        settings.retry_backoff_seconds = 0.0;
        settings.http_timeout_seconds = 0.5;

        let snapshot = fetch_sensor_data_http("http://127.0.0.1:1/", &settings).await;
        assert!(!snapshot.valid);
        assert_eq!(snapshot.errors.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_http_loopback_success() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = format!(
                    "[{{\"temperature\": 20.5, \"humidity\": 50, \"timestamp\": \"{}\"}}]",
                    Utc::now().to_rfc3339()
                );
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let settings = Settings::default();
        let url = format!("http://127.0.0.1:{}/data", addr.port());
        let snapshot = fetch_sensor_data_http(&url, &settings).await;

        assert!(snapshot.valid, "errors: {:?}", snapshot.errors);
        assert_eq!(snapshot.temperature, Some(20.5));
        assert_eq!(snapshot.humidity, Some(50.0));
        assert!(snapshot.age_seconds.unwrap() < 10.0);
    }
}
