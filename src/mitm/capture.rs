//! Traffic capture - one structured record per decoded exchange
//!
//! Records are emitted as JSON on the `relayscope::capture` tracing target,
//! so they can be routed independently of the proxy's own diagnostics.
//! Sensitive header values are always redacted.

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Tracing target carrying capture records
pub const CAPTURE_TARGET: &str = "relayscope::capture";

/// Headers whose values never appear in a capture record
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

const REDACTED: &str = "[REDACTED]";

/// One decoded request/response pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Client leg version, e.g. `HTTP/2`
    pub client_version: String,
    /// Destination leg version
    pub server_version: String,
    pub status_code: u16,
    pub request_size: usize,
    pub response_size: usize,
    pub duration_ms: u64,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
}

impl CaptureRecord {
    pub fn new(
        host: &str,
        port: u16,
        request: &Request<Bytes>,
        response: &Response<Bytes>,
        elapsed: Duration,
    ) -> Self {
        Self {
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            method: request.method().to_string(),
            host: host.to_string(),
            port,
            path: request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            client_version: String::new(),
            server_version: String::new(),
            status_code: response.status().as_u16(),
            request_size: request.body().len(),
            response_size: response.body().len(),
            duration_ms: elapsed.as_millis() as u64,
            request_headers: redact_headers(request.headers()),
            response_headers: redact_headers(response.headers()),
        }
    }

    pub fn with_versions(mut self, client: &str, server: &str) -> Self {
        self.client_version = client.to_string();
        self.server_version = server.to_string();
        self
    }

    /// Emit on the capture target
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => info!(
                target: CAPTURE_TARGET,
                host = %self.host,
                status = self.status_code,
                record = %json,
                "exchange captured"
            ),
            Err(e) => info!(target: CAPTURE_TARGET, error = %e, "capture record not serializable"),
        }
    }
}

/// Flatten headers, redacting sensitive values
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}
