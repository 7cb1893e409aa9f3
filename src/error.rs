//! Proxy error taxonomy
//!
//! Each stage has its own error type; `ProxyError` is what a connection task
//! ends with. Configuration errors are fatal at construction time, everything
//! else only ends the owning connection.

use crate::auth::AuthError;
use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::dialer::DialError;
use crate::http_head::HeadError;
use crate::mitm::error::MitmError;
use crate::mitm::interceptor::InterceptionError;
use crate::socks5::SocksError;
use crate::upstream::UpstreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Malformed HTTP request: {0}")]
    Head(#[from] HeadError),

    #[error("SOCKS5 protocol error: {0}")]
    Socks(#[from] SocksError),

    #[error("Upstream selection failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("TLS interception failed: {0}")]
    Interception(#[from] InterceptionError),

    #[error("Certificate error: {0}")]
    Mitm(#[from] MitmError),

    #[error("Bridge failed: {0}")]
    Bridge(#[from] BridgeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection cancelled")]
    Cancelled,
}

impl ProxyError {
    /// Rejections reported to the client over the wire, not proxy faults
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Auth(_) | ProxyError::Socks(SocksError::AuthFailed)
                | ProxyError::Socks(SocksError::NoAcceptableMethod)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
