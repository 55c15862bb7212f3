//! Minimal HTTP/1.1 client over the Firecracker API Unix-domain socket.
//!
//! Firecracker's control API is a tiny, fully-local REST surface (a handful
//! of `PUT`/`PATCH` calls with small JSON bodies). Rather than drag in a
//! general-purpose HTTP client stack for it, requests are framed by hand
//! directly over the socket — the same "positional, explicit, nothing
//! fancy" posture the driver uses for shelling out to `mkfs`/`mount`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{Instant, sleep};

use crate::error::{HypervisorError, HypervisorResult};

/// Client for one Firecracker instance's API socket.
#[derive(Clone)]
pub struct ApiClient {
    sock_path: PathBuf,
}

impl ApiClient {
    pub fn new(sock_path: PathBuf) -> Self {
        Self { sock_path }
    }

    /// Poll for the API socket to appear and accept a connection.
    pub async fn wait_for_ready(&self, timeout: Duration) -> HypervisorResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if UnixStream::connect(&self.sock_path).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HypervisorError::ApiNotReady(self.sock_path.clone()));
            }
            sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn put<T: Serialize>(&self, path: impl Into<String>, body: &T) -> HypervisorResult<()> {
        self.request("PUT", path.into(), Some(body)).await
    }

    pub async fn patch<T: Serialize>(&self, path: impl Into<String>, body: &T) -> HypervisorResult<()> {
        self.request("PATCH", path.into(), Some(body)).await
    }

    pub async fn get(&self, path: impl Into<String>) -> HypervisorResult<Value> {
        self.request_with_response("GET", path.into(), Option::<&()>::None)
            .await
    }

    async fn request<T: Serialize>(
        &self,
        method: &'static str,
        path: String,
        body: Option<&T>,
    ) -> HypervisorResult<()> {
        self.request_with_response(method, path, body).await?;
        Ok(())
    }

    async fn request_with_response<T: Serialize>(
        &self,
        method: &'static str,
        path: String,
        body: Option<&T>,
    ) -> HypervisorResult<Value> {
        let payload = match body {
            Some(b) => serde_json::to_vec(b)?,
            None => Vec::new(),
        };

        let mut stream = UnixStream::connect(&self.sock_path).await?;
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
        if !payload.is_empty() {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", payload.len()));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;
        stream.write_all(&payload).await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;

        let (status, body) = parse_http_response(&raw).ok_or_else(|| {
            HypervisorError::MalformedResponse(String::from_utf8_lossy(&raw).into_owned())
        })?;

        if !(200..300).contains(&status) {
            return Err(HypervisorError::Api {
                method,
                path,
                detail: String::from_utf8_lossy(body).into_owned(),
            });
        }

        if body.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_slice(body)?)
        }
    }
}

/// Parse a raw HTTP/1.1 response into `(status_code, body_bytes)`.
///
/// Firecracker always closes the connection after one response (we send
/// `Connection: close`), so the body is simply everything after the blank
/// line — no chunked-transfer-encoding handling is needed.
fn parse_http_response(raw: &[u8]) -> Option<(u16, &[u8])> {
    let header_end = find_subslice(raw, b"\r\n\r\n")?;
    let header = std::str::from_utf8(raw.get(..header_end)?).ok()?;
    let body = raw.get(header_end + 4..)?;

    let status_line = header.lines().next()?;
    let mut parts = status_line.split_whitespace();
    parts.next()?; // HTTP/1.1
    let status: u16 = parts.next()?.parse().ok()?;
    Some((status, body))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response_with_body() {
        let raw = b"HTTP/1.1 204 No Content\r\nServer: Firecracker\r\n\r\n";
        let (status, body) = parse_http_response(raw).unwrap_or_else(|| panic!("parse failed"));
        assert_eq!(status, 204);
        assert!(body.is_empty());
    }

    #[test]
    fn parses_response_with_json_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"ok\":true}\r\n";
        let (status, body) = parse_http_response(raw).unwrap_or_else(|| panic!("parse failed"));
        assert_eq!(status, 200);
        let value: Value = serde_json::from_slice(&body[..11]).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn parses_error_status() {
        let raw = b"HTTP/1.1 400 Bad Request\r\n\r\n{\"fault_message\":\"bad\"}";
        let (status, body) = parse_http_response(raw).unwrap_or_else(|| panic!("parse failed"));
        assert_eq!(status, 400);
        assert!(String::from_utf8_lossy(body).contains("bad"));
    }

    #[test]
    fn rejects_malformed_response() {
        assert!(parse_http_response(b"garbage, no header terminator").is_none());
    }
}
