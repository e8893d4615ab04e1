//! Minimal HTTP client for sensor endpoints.
//!
//! The sensor endpoints are single-record JSON GETs on the local network, so
//! this speaks just enough HTTP/1.0 over a tokio TCP stream: one request,
//! status line + headers, unchunked body, connection closed by the server.
//! Responses are size-bounded and the whole exchange runs under one timeout.

use sm_error::{Result, SkymonitorError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Maximum accepted response size (256 KB)
const MAX_RESPONSE_SIZE: usize = 256 * 1024;

/// A fetched HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Split an `http://` URL into (host, port, path-with-query).
///
/// TLS endpoints are rejected: there is no TLS stack in this daemon, and the
/// sensor sources it is pointed at live on the LAN.
pub fn parse_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| SkymonitorError::InvalidEndpoint {
            url: url.to_string(),
            reason: "only http:// endpoints are supported".to_string(),
        })?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    if authority.is_empty() {
        return Err(SkymonitorError::InvalidEndpoint {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| SkymonitorError::InvalidEndpoint {
                    url: url.to_string(),
                    reason: format!("invalid port: {}", port_str),
                })?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };

    Ok((host, port, path.to_string()))
}

/// Perform a GET request against `url`, bounded by `total_timeout`.
pub async fn http_get(url: &str, total_timeout: Duration) -> Result<HttpResponse> {
    let (host, port, path) = parse_url(url)?;

    timeout(total_timeout, get_inner(&host, port, &path))
        .await
        .map_err(|_| SkymonitorError::Timeout(format!("GET {}", url)))?
}

async fn get_inner(host: &str, port: u16, path: &str) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| SkymonitorError::Http(format!("connect {}:{}: {}", host, port, e)))?;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nAccept: application/json\r\nUser-Agent: skymonitord/{}\r\nConnection: close\r\n\r\n",
        path,
        host,
        env!("CARGO_PKG_VERSION"),
    );

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| SkymonitorError::Http(format!("request write failed: {}", e)))?;

    // Server closes the connection after a HTTP/1.0 exchange; read to EOF
    // with a size bound.
    let mut raw = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| SkymonitorError::Http(format!("response read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        if raw.len() + n > MAX_RESPONSE_SIZE {
            return Err(SkymonitorError::MessageTooLarge {
                size: raw.len() + n,
                max_size: MAX_RESPONSE_SIZE,
            });
        }
        raw.extend_from_slice(&buf[..n]);
    }

    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| SkymonitorError::Http("malformed response: no header terminator".into()))?;

    let head = String::from_utf8_lossy(&raw[..header_end]);
    let status_line = head
        .lines()
        .next()
        .ok_or_else(|| SkymonitorError::Http("empty response".into()))?;

    // "HTTP/1.x 200 OK"
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            SkymonitorError::Http(format!("malformed status line: {}", status_line))
        })?;

    Ok(HttpResponse {
        status,
        body: raw[header_end..].to_vec(),
    })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_url_forms() {
        assert_eq!(
            parse_url("http://skymonitor.local/json").unwrap(),
            ("skymonitor.local".to_string(), 80, "/json".to_string())
        );
        assert_eq!(
            parse_url("http://10.0.0.5:8080/data?limit=1").unwrap(),
            ("10.0.0.5".to_string(), 8080, "/data?limit=1".to_string())
        );
        assert_eq!(
            parse_url("http://host").unwrap(),
            ("host".to_string(), 80, "/".to_string())
        );
    }

    #[test]
    fn test_parse_url_rejects_https_and_garbage() {
        assert!(parse_url("https://meetjestad.net/data").is_err());
        assert!(parse_url("ftp://host/x").is_err());
        assert!(parse_url("http://").is_err());
        assert!(parse_url("http://host:notaport/").is_err());
    }

    #[test]
    fn test_parse_response() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n[{\"a\":1}]";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"[{\"a\":1}]");

        let raw = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 503);
        assert!(resp.body.is_empty());

        assert!(parse_response(b"garbage with no headers").is_err());
    }

    #[tokio::test]
    async fn test_loopback_get() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n[{\"temperature\": 20.5}]",
                )
                .await
                .unwrap();
        });

        let url = format!("http://127.0.0.1:{}/data", addr.port());
        let resp = http_get(&url, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.status, 200);
        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value[0]["temperature"], 20.5);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Port 1 on localhost is never listening in the test environment
        let err = http_get("http://127.0.0.1:1/", Duration::from_secs(2)).await;
        assert!(err.is_err());
    }
}
