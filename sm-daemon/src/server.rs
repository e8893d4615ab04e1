//! Local status/control API.
//!
//! A small hardened HTTP/1.1 surface on the loopback interface: `GET /status`,
//! `GET /health` and `POST /actuators`. Hardening follows the usual local
//! daemon rules: loopback bind only, a connection cap, size-bounded request
//! reads and per-connection read/write timeouts.

use chrono::{DateTime, Utc};
use sm_core::load_settings;
use sm_error::{Result, SkymonitorError};
use sm_protocol::{
    ActuatorAck, ActuatorCommand, ActuatorMode, ActuatorRequest, ActuatorResponse, AppliedState,
    ControlMode, HealthResponse, RelayState, StatusResponse, MAX_REQUEST_SIZE,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::controller::{apply_safety_logic, SharedState};
use crate::relay::RelayDriver;

/// Maximum concurrent API connections.
const MAX_CONNECTIONS: usize = 64;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Everything a request handler needs.
#[derive(Clone)]
pub struct ApiContext {
    pub state: SharedState,
    pub relay: Arc<RelayDriver>,
    pub settings_path: PathBuf,
}

/// Serve the API until ctrl-c.
pub async fn run_server(port: u16, ctx: ApiContext) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| SkymonitorError::generic(format!("bind 127.0.0.1:{}: {}", port, e)))?;

    info!("Status API listening on 127.0.0.1:{}", port);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if ACTIVE_CONNECTIONS.load(Ordering::SeqCst) >= MAX_CONNECTIONS {
                            warn!("Connection limit reached, rejecting {}", peer);
                            continue;
                        }
                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_client(stream, ctx).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
        }
    }
}

async fn handle_client(stream: TcpStream, ctx: ApiContext) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (status, body) = match timeout(READ_TIMEOUT, read_request(&mut reader)).await {
        Ok(Ok(request)) => route(&ctx, &request).await,
        Ok(Err(e)) => (400, serde_json::json!({ "error": e.to_string() }).to_string()),
        Err(_) => (
            408,
            serde_json::json!({ "error": "Request read timed out" }).to_string(),
        ),
    };

    let response = format_response(status, &body);
    if timeout(WRITE_TIMEOUT, write_half.write_all(response.as_bytes()))
        .await
        .is_err()
    {
        warn!("Response write timed out");
    }
}

/// A parsed API request.
#[derive(Debug)]
struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

/// Read one HTTP request: request line, headers, optional sized body.
/// Bodies beyond `MAX_REQUEST_SIZE` are refused outright.
async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| SkymonitorError::Protocol("empty request line".into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| SkymonitorError::Protocol("missing request path".into()))?
        .to_string();

    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    SkymonitorError::Protocol(format!("invalid content-length: {}", value.trim()))
                })?;
            }
        }
    }

    if content_length > MAX_REQUEST_SIZE {
        return Err(SkymonitorError::MessageTooLarge {
            size: content_length,
            max_size: MAX_REQUEST_SIZE,
        });
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(Request { method, path, body })
}

async fn route(ctx: &ApiContext, request: &Request) -> (u16, String) {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/status") => (200, status_body(ctx).await),
        ("GET", "/health") => (200, health_body(ctx).await),
        ("POST", "/actuators") => actuators_body(ctx, &request.body).await,
        _ => (
            404,
            serde_json::json!({ "error": "Not found" }).to_string(),
        ),
    }
}

async fn status_body(ctx: &ApiContext) -> String {
    let state = ctx.state.lock().await;
    let now = Utc::now();

    let age_seconds = state.snapshot.as_ref().and_then(|snap| {
        DateTime::parse_from_rfc3339(&snap.received_timestamp)
            .ok()
            .map(|received| (now - received.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0)
    });

    let response = StatusResponse {
        snapshot: state.snapshot.clone(),
        age_seconds,
        mode: state.mode,
        fan_status: state.fan_status,
        heater_status: state.heater_status,
        fan_mode: state.fan_mode(),
        heater_mode: state.heater_mode(),
        last_error: state.last_error.clone(),
        cycle_count: state.cycle_count,
        uptime_seconds: state.uptime_seconds(now),
    };

    serde_json::to_string(&response).unwrap_or_else(|e| {
        serde_json::json!({ "error": format!("serialization failed: {}", e) }).to_string()
    })
}

async fn health_body(ctx: &ApiContext) -> String {
    let state = ctx.state.lock().await;
    let active_endpoint = if state.mode == ControlMode::Normal {
        "primary"
    } else {
        "fallback"
    };

    let response = HealthResponse {
        status: "running".to_string(),
        mode: state.mode,
        active_endpoint: active_endpoint.to_string(),
        uptime_seconds: state.uptime_seconds(Utc::now()),
    };

    serde_json::to_string(&response).unwrap_or_else(|e| {
        serde_json::json!({ "error": format!("serialization failed: {}", e) }).to_string()
    })
}

async fn actuators_body(ctx: &ApiContext, body: &[u8]) -> (u16, String) {
    let request: ActuatorRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(_) => {
            return (
                400,
                serde_json::json!({ "error": "No JSON data provided" }).to_string(),
            )
        }
    };

    if request.fan.is_none() && request.heater.is_none() {
        return (
            400,
            serde_json::json!({ "error": "No JSON data provided" }).to_string(),
        );
    }

    // Settings come off disk before the lock; only the decision and relay
    // write sit in the critical section
    let settings = load_settings(&ctx.settings_path);

    let mut state = ctx.state.lock().await;

    let fan_ack = request.fan.as_deref().map(|raw| {
        match ActuatorCommand::parse(raw) {
            Ok(command) => {
                state.fan_override = command.override_mode();
                warn!("Fan set to {:?} via API", command);
                fan_ack_for(command)
            }
            Err(_) => ActuatorAck::Rejected {
                error: format!("Invalid fan command: {}", raw.to_ascii_lowercase()),
            },
        }
    });

    let heater_ack = request.heater.as_deref().map(|raw| {
        match ActuatorCommand::parse(raw) {
            Ok(command) => {
                state.heater_override = command.override_mode();
                warn!("Heater set to {:?} via API", command);
                heater_ack_for(command)
            }
            Err(_) => ActuatorAck::Rejected {
                error: format!("Invalid heater command: {}", raw.to_ascii_lowercase()),
            },
        }
    });

    // Re-run the safety logic immediately so the caller sees vetoes applied
    let (fan_on, heater_on) = apply_safety_logic(&mut state, &settings, Utc::now());
    ctx.relay.set_relays(fan_on, heater_on);

    let response = ActuatorResponse {
        fan: fan_ack,
        heater: heater_ack,
        applied_state: AppliedState {
            fan_status: state.fan_status,
            heater_status: state.heater_status,
            fan_mode: state.fan_mode(),
            heater_mode: state.heater_mode(),
        },
    };

    match serde_json::to_string(&response) {
        Ok(json) => (200, json),
        Err(e) => (
            500,
            serde_json::json!({ "error": e.to_string() }).to_string(),
        ),
    }
}

fn fan_ack_for(command: ActuatorCommand) -> ActuatorAck {
    match command {
        ActuatorCommand::Auto => ActuatorAck::Applied {
            mode: ActuatorMode::Auto,
            state: None,
            message: "Fan set to AUTO mode".to_string(),
        },
        ActuatorCommand::On => ActuatorAck::Applied {
            mode: ActuatorMode::Manual,
            state: Some(RelayState::On),
            message: "Fan manually set ON".to_string(),
        },
        ActuatorCommand::Off => ActuatorAck::Applied {
            mode: ActuatorMode::Manual,
            state: Some(RelayState::Off),
            message: "Fan manually set OFF (will be validated for safety)".to_string(),
        },
    }
}

fn heater_ack_for(command: ActuatorCommand) -> ActuatorAck {
    match command {
        ActuatorCommand::Auto => ActuatorAck::Applied {
            mode: ActuatorMode::Auto,
            state: None,
            message: "Heater set to AUTO mode".to_string(),
        },
        ActuatorCommand::On => ActuatorAck::Applied {
            mode: ActuatorMode::Manual,
            state: Some(RelayState::On),
            message: "Heater manually set ON (safety rules apply)".to_string(),
        },
        ActuatorCommand::Off => ActuatorAck::Applied {
            mode: ActuatorMode::Manual,
            state: Some(RelayState::Off),
            message: "Heater manually set OFF".to_string(),
        },
    }
}

fn format_response(status: u16, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControlState;
    use sm_protocol::{OverrideMode, Snapshot};
    use tokio::sync::Mutex;

    fn test_context() -> (ApiContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ApiContext {
            state: Arc::new(Mutex::new(ControlState::new(Utc::now()))),
            relay: Arc::new(RelayDriver::Noop),
            settings_path: dir.path().join("settings.json"),
        };
        (ctx, dir)
    }

    async fn parse(raw: &[u8]) -> Result<Request> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_read_request_get() {
        let request = parse(b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/status");
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_read_request_post_with_body() {
        let body = r#"{"fan": "on"}"#;
        let raw = format!(
            "POST /actuators HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let request = parse(raw.as_bytes()).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, body.as_bytes());
    }

    #[tokio::test]
    async fn test_read_request_rejects_oversized_body() {
        let raw = format!(
            "POST /actuators HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_SIZE + 1
        );
        let err = parse(raw.as_bytes()).await.unwrap_err();
        assert!(matches!(err, SkymonitorError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_status_route() {
        let (ctx, _dir) = test_context();
        {
            let mut state = ctx.state.lock().await;
            let mut snap = Snapshot::new(Utc::now().to_rfc3339());
            snap.valid = true;
            snap.temperature = Some(12.0);
            snap.humidity = Some(60.0);
            state.snapshot = Some(snap);
            state.mode = ControlMode::Normal;
            state.cycle_count = 7;
        }

        let request = Request {
            method: "GET".into(),
            path: "/status".into(),
            body: Vec::new(),
        };
        let (status, body) = route(&ctx, &request).await;
        assert_eq!(status, 200);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["mode"], "NORMAL");
        assert_eq!(value["cycle_count"], 7);
        assert_eq!(value["fan_mode"], "AUTO");
        assert_eq!(value["snapshot"]["temperature"], 12.0);
        assert!(value["age_seconds"].as_f64().unwrap() < 5.0);
    }

    #[tokio::test]
    async fn test_health_route_reports_endpoint() {
        let (ctx, _dir) = test_context();
        let request = Request {
            method: "GET".into(),
            path: "/health".into(),
            body: Vec::new(),
        };

        let (status, body) = route(&ctx, &request).await;
        assert_eq!(status, 200);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "running");
        // Not in NORMAL mode yet
        assert_eq!(value["active_endpoint"], "fallback");

        ctx.state.lock().await.mode = ControlMode::Normal;
        let (_, body) = route(&ctx, &request).await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["active_endpoint"], "primary");
    }

    #[tokio::test]
    async fn test_actuators_sets_override_and_reports_applied_state() {
        let (ctx, _dir) = test_context();

        let (status, body) = actuators_body(&ctx, br#"{"fan": "on"}"#).await;
        assert_eq!(status, 200);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["fan"]["mode"], "MANUAL");
        assert_eq!(value["fan"]["state"], "ON");
        assert!(value["heater"].is_null());
        // No valid snapshot: the fail-safe still wins over the override
        assert_eq!(value["applied_state"]["fan_status"], "ON");
        assert_eq!(value["applied_state"]["heater_status"], "OFF");
        assert_eq!(value["applied_state"]["fan_mode"], "MANUAL");

        let state = ctx.state.lock().await;
        assert_eq!(state.fan_override, OverrideMode::ForceOn);
    }

    #[tokio::test]
    async fn test_actuators_invalid_command_rejected_per_field() {
        let (ctx, _dir) = test_context();

        let (status, body) =
            actuators_body(&ctx, br#"{"fan": "toggle", "heater": "auto"}"#).await;
        assert_eq!(status, 200);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["fan"]["error"], "Invalid fan command: toggle");
        assert_eq!(value["heater"]["mode"], "AUTO");

        let state = ctx.state.lock().await;
        // The invalid fan command left the override untouched
        assert_eq!(state.fan_override, OverrideMode::Auto);
        assert_eq!(state.heater_override, OverrideMode::Auto);
    }

    #[tokio::test]
    async fn test_actuators_veto_uses_settings_file() {
        let (ctx, _dir) = test_context();
        std::fs::write(&ctx.settings_path, r#"{"cpu_temp_threshold": 10.0}"#).unwrap();

        {
            let mut state = ctx.state.lock().await;
            let mut snap = Snapshot::new(Utc::now().to_rfc3339());
            snap.valid = true;
            snap.temperature = Some(15.0);
            snap.humidity = Some(40.0);
            snap.dew_point = Some(2.0);
            snap.cpu_temperature = Some(30.0);
            state.snapshot = Some(snap);
        }

        // A 30C CPU is only critical against the file's 10C threshold, so a
        // vetoed manual OFF proves the handler read the settings file
        let (status, body) = actuators_body(&ctx, br#"{"fan": "off"}"#).await;
        assert_eq!(status, 200);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["applied_state"]["fan_status"], "ON");
        assert_eq!(value["applied_state"]["fan_mode"], "MANUAL");
    }

    #[tokio::test]
    async fn test_actuators_requires_json_body() {
        let (ctx, _dir) = test_context();

        let (status, body) = actuators_body(&ctx, b"").await;
        assert_eq!(status, 400);
        assert!(body.contains("No JSON data provided"));

        let (status, _) = actuators_body(&ctx, b"{}").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (ctx, _dir) = test_context();
        let request = Request {
            method: "GET".into(),
            path: "/nope".into(),
            body: Vec::new(),
        };
        let (status, _) = route(&ctx, &request).await;
        assert_eq!(status, 404);
    }

    #[test]
    fn test_format_response_framing() {
        let response = format_response(200, "{\"ok\":true}");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 11\r\n"));
        assert!(response.ends_with("{\"ok\":true}"));
    }
}
