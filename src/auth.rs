// Proxy Authentication Module
// Basic credentials (Proxy-Authorization / SOCKS5 username-password) and source-IP whitelist

use base64::{engine::general_purpose, Engine as _};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing proxy authorization header")]
    MissingHeader,

    #[error("Invalid authorization format (expected: Basic <base64>)")]
    InvalidFormat,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Peer {0} is not whitelisted")]
    PeerNotAllowed(IpAddr),
}

/// Username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic base64(username:password)`
    pub fn basic_header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()))
    }

    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }

    /// Decode a `Basic` authorization value into credentials
    pub fn from_basic_header(value: &str) -> Result<Self, AuthError> {
        let (scheme, encoded) = value
            .trim()
            .split_once(' ')
            .ok_or(AuthError::InvalidFormat)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::InvalidFormat);
        }

        let decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthError::InvalidFormat)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidFormat)?;
        let (username, password) = decoded.split_once(':').ok_or(AuthError::InvalidFormat)?;

        Ok(Self::new(username, password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Admission policy for clients of the proxy
///
/// A client is admitted when verification is disabled, when its source IP is
/// whitelisted, or when it presents the configured credentials. Read-only after
/// construction.
#[derive(Debug, Clone, Default)]
pub struct ProxyAuth {
    credentials: Option<Credentials>,
    whitelist: HashSet<IpAddr>,
    disabled: bool,
}

impl ProxyAuth {
    pub fn new(
        credentials: Option<Credentials>,
        whitelist: impl IntoIterator<Item = IpAddr>,
        disabled: bool,
    ) -> Self {
        Self {
            credentials,
            whitelist: whitelist.into_iter().map(canonical_ip).collect(),
            disabled,
        }
    }

    /// Admit everyone (trusted-environment mode)
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Default::default()
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_whitelisted(&self, peer: IpAddr) -> bool {
        self.whitelist.contains(&canonical_ip(peer))
    }

    /// Admitted without presenting credentials
    pub fn admits_without_credentials(&self, peer: IpAddr) -> bool {
        self.disabled || self.is_whitelisted(peer)
    }

    /// Check an HTTP client, given its `Proxy-Authorization` value
    pub fn authorize_http(&self, peer: IpAddr, header: Option<&str>) -> Result<(), AuthError> {
        if self.admits_without_credentials(peer) {
            return Ok(());
        }

        let expected = match &self.credentials {
            Some(expected) => expected,
            None => return Err(AuthError::PeerNotAllowed(peer)),
        };

        let presented = Credentials::from_basic_header(header.ok_or(AuthError::MissingHeader)?)?;
        if presented == *expected {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Check a SOCKS5 username/password subnegotiation
    pub fn authorize_socks(&self, username: &[u8], password: &[u8]) -> Result<(), AuthError> {
        match &self.credentials {
            Some(expected) if expected.matches(username, password) => Ok(()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

/// Thread-safe admission policy (shared across connection tasks)
pub type SharedProxyAuth = Arc<ProxyAuth>;

// IPv4-mapped IPv6 peers (dual-stack listeners) compare equal to their IPv4 form
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
