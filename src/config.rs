use anyhow::{Context, Result};
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{Credentials, ProxyAuth};
use crate::mitm::certificate_authority::CaConfig;
use crate::upstream::{UpstreamDescriptor, UpstreamError};

/// Configuration problems; fatal before any connection is accepted
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Listening port is required")]
    MissingPort,

    #[error("Username and password must be configured together")]
    IncompleteCredentials,

    #[error("Invalid upstream: {0}")]
    InvalidUpstream(#[from] UpstreamError),

    #[error("Worker slot count must be greater than zero")]
    ZeroConnections,

    #[error("Invalid passthrough target '{0}' (expected host:port)")]
    InvalidPassthrough(String),

    #[error("Listener TLS needs both a certificate and a key path")]
    IncompleteListenerTls,
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!(
                "Invalid log format '{}'. Must be 'text' or 'json'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listener
    pub host: String,
    pub port: Option<u16>,

    // Admission
    pub username: Option<String>,
    pub password: Option<String>,
    pub ip_whitelist: Vec<IpAddr>,
    pub disable_verify: bool,

    // Next hop
    pub upstream: Option<String>,
    pub local_addr: Option<IpAddr>,
    pub passthrough: Option<String>,

    // Interception
    pub capture: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub upstream_tls_verify: bool,

    // Listener TLS
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub server_name: String,

    // Limits
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_connections: usize,

    pub log_format: LogFormat,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: None,
            username: None,
            password: None,
            ip_whitelist: Vec::new(),
            disable_verify: false,
            upstream: None,
            local_addr: None,
            passthrough: None,
            capture: false,
            ca_cert_path: None,
            ca_key_path: None,
            upstream_tls_verify: false,
            tls_cert_path: None,
            tls_key_path: None,
            server_name: "localhost".to_string(),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 65535,
            log_format: LogFormat::Text,
        }
    }
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_whitelist(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.ip_whitelist.extend(ips);
        self
    }

    pub fn with_disable_verify(mut self, disable: bool) -> Self {
        self.disable_verify = disable;
        self
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_local_addr(mut self, addr: IpAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn with_passthrough(mut self, target: impl Into<String>) -> Self {
        self.passthrough = Some(target.into());
        self
    }

    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_ca_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(cert.into());
        self.ca_key_path = Some(key.into());
        self
    }

    pub fn with_listener_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls_cert_path = Some(cert.into());
        self.tls_key_path = Some(key.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_upstream_tls_verify(mut self, verify: bool) -> Self {
        self.upstream_tls_verify = verify;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = ProxyConfig::default();

        let host = env::var("PROXY_HOST").unwrap_or(defaults.host);
        let port = env::var("PROXY_PORT")
            .context("PROXY_PORT environment variable is required")?
            .parse()
            .context("Invalid PROXY_PORT")?;

        let username = non_empty_var("PROXY_USERNAME");
        let password = non_empty_var("PROXY_PASSWORD");

        let ip_whitelist = match non_empty_var("PROXY_IP_WHITELIST") {
            Some(raw) => parse_ip_list(&raw).context("Invalid PROXY_IP_WHITELIST")?,
            None => Vec::new(),
        };

        let local_addr = non_empty_var("PROXY_LOCAL_ADDR")
            .map(|raw| raw.parse())
            .transpose()
            .context("Invalid PROXY_LOCAL_ADDR")?;

        let dial_timeout_secs: u64 = env::var("PROXY_DIAL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid PROXY_DIAL_TIMEOUT_SECS")?;
        let handshake_timeout_secs: u64 = env::var("PROXY_TLS_HANDSHAKE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid PROXY_TLS_HANDSHAKE_TIMEOUT_SECS")?;
        let max_connections = env::var("PROXY_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "65535".to_string())
            .parse()
            .context("Invalid PROXY_MAX_CONNECTIONS")?;

        let log_format = env::var("PROXY_LOG_FORMAT")
            .unwrap_or_else(|_| "text".to_string())
            .parse()
            .context("Invalid PROXY_LOG_FORMAT")?;

        let config = ProxyConfig {
            host,
            port: Some(port),
            username,
            password,
            ip_whitelist,
            disable_verify: env_flag("PROXY_DISABLE_VERIFY")?,
            upstream: non_empty_var("PROXY_UPSTREAM"),
            local_addr,
            passthrough: non_empty_var("PROXY_PASSTHROUGH"),
            capture: env_flag("PROXY_CAPTURE")?,
            ca_cert_path: non_empty_var("PROXY_CA_CERT_PATH").map(PathBuf::from),
            ca_key_path: non_empty_var("PROXY_CA_KEY_PATH").map(PathBuf::from),
            upstream_tls_verify: env_flag("PROXY_UPSTREAM_TLS_VERIFY")?,
            tls_cert_path: non_empty_var("PROXY_TLS_CERT_PATH").map(PathBuf::from),
            tls_key_path: non_empty_var("PROXY_TLS_KEY_PATH").map(PathBuf::from),
            server_name: non_empty_var("PROXY_SERVER_NAME").unwrap_or(defaults.server_name),
            dial_timeout: Duration::from_secs(dial_timeout_secs),
            handshake_timeout: Duration::from_secs(handshake_timeout_secs),
            max_connections,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no connection could be served under
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.port.is_none() {
            return Err(ConfigError::MissingPort);
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::IncompleteCredentials);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(ConfigError::IncompleteListenerTls);
        }
        self.upstream_descriptor()?;
        self.passthrough_target()?;
        Ok(())
    }

    /// `host:port` the listener binds
    pub fn listen_addr(&self) -> std::result::Result<String, ConfigError> {
        let port = self.port.ok_or(ConfigError::MissingPort)?;
        Ok(crate::conn::format_authority(&self.host, port))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    pub fn proxy_auth(&self) -> ProxyAuth {
        ProxyAuth::new(
            self.credentials(),
            self.ip_whitelist.iter().copied(),
            self.disable_verify,
        )
    }

    pub fn upstream_descriptor(&self) -> std::result::Result<Option<UpstreamDescriptor>, ConfigError> {
        match self.upstream.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Ok(Some(UpstreamDescriptor::parse(raw)?)),
            None => Ok(None),
        }
    }

    /// Fixed `(host, port)` for passthrough mode
    pub fn passthrough_target(&self) -> std::result::Result<Option<(String, u16)>, ConfigError> {
        let raw = match self.passthrough.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let invalid = || ConfigError::InvalidPassthrough(raw.to_string());
        let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(Some((host.to_string(), port)))
    }

    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            cert_path: self.ca_cert_path.clone(),
            key_path: self.ca_key_path.clone(),
            ..Default::default()
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> Result<bool> {
    match non_empty_var(name) {
        None => Ok(false),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("Invalid {} '{}'. Must be true or false", name, raw)),
        },
    }
}

fn parse_ip_list(raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("'{}' is not an IP address", s)))
        .collect()
}
