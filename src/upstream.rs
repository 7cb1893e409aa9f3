//! Upstream (next hop) resolution
//!
//! Precedence, highest first:
//! 1. an explicit upstream URL supplied with the request
//! 2. the resolver callback
//! 3. the statically configured upstream
//! 4. none (direct dial)

use crate::auth::Credentials;
use crate::conn::{format_authority, RequestTarget};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported upstream scheme: {0} (expected http or socks5)")]
    UnsupportedScheme(String),

    #[error("Upstream resolver failed: {0}")]
    Resolver(String),
}

/// Kind of chained proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Socks5,
}

impl UpstreamScheme {
    fn default_port(self) -> u16 {
        match self {
            UpstreamScheme::Http => 80,
            UpstreamScheme::Socks5 => 1080,
        }
    }
}

/// Parsed upstream proxy URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDescriptor {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl UpstreamDescriptor {
    /// Parse `http://[user:pass@]host[:port]` or `socks5://[user:pass@]host[:port]`
    pub fn parse(raw: &str) -> Result<Self, UpstreamError> {
        let invalid = |reason: String| UpstreamError::InvalidUrl {
            url: redact(raw),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" => UpstreamScheme::Http,
            "socks5" => UpstreamScheme::Socks5,
            other => return Err(UpstreamError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| scheme.default_port());

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials::new(
                percent_decode(url.username()),
                percent_decode(url.password().unwrap_or_default()),
            ))
        };

        Ok(Self {
            scheme,
            host,
            port,
            credentials,
        })
    }

    pub fn address(&self) -> String {
        format_authority(&self.host, self.port)
    }
}

impl FromStr for UpstreamDescriptor {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UpstreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Socks5 => "socks5",
        };
        match &self.credentials {
            Some(c) => write!(f, "{}://{}:***@{}", scheme, c.username, self.address()),
            None => write!(f, "{}://{}", scheme, self.address()),
        }
    }
}

// Userinfo stays percent-encoded in `Url`
fn percent_decode(s: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
}

fn redact(raw: &str) -> String {
    match raw.rsplit_once('@') {
        Some((_, rest)) => format!("***@{}", rest),
        None => raw.to_string(),
    }
}

/// Boxed future returned by resolvers
pub type ResolveFuture = Pin<Box<dyn Future<Output = Result<Option<String>, UpstreamError>> + Send>>;

/// Per-request upstream selection supplied by the embedding application
///
/// Returning `Ok(None)` falls through to the static upstream (or direct dial).
pub trait UpstreamResolver: Send + Sync {
    fn resolve(&self, target: RequestTarget, peer: SocketAddr) -> ResolveFuture;
}

impl<F> UpstreamResolver for F
where
    F: Fn(&RequestTarget, SocketAddr) -> Result<Option<String>, UpstreamError> + Send + Sync,
{
    fn resolve(&self, target: RequestTarget, peer: SocketAddr) -> ResolveFuture {
        let result = self(&target, peer);
        Box::pin(async move { result })
    }
}

/// Applies the upstream precedence rules
#[derive(Clone, Default)]
pub struct UpstreamSelector {
    resolver: Option<Arc<dyn UpstreamResolver>>,
    fixed: Option<UpstreamDescriptor>,
}

impl UpstreamSelector {
    pub fn new(
        resolver: Option<Arc<dyn UpstreamResolver>>,
        fixed: Option<UpstreamDescriptor>,
    ) -> Self {
        Self { resolver, fixed }
    }

    pub fn fixed(&self) -> Option<&UpstreamDescriptor> {
        self.fixed.as_ref()
    }

    /// Pick the next hop for one request (`None` = direct)
    pub async fn select(
        &self,
        explicit: Option<&str>,
        target: &RequestTarget,
        peer: SocketAddr,
    ) -> Result<Option<UpstreamDescriptor>, UpstreamError> {
        if let Some(raw) = explicit.filter(|s| !s.is_empty()) {
            return UpstreamDescriptor::parse(raw).map(Some);
        }

        if let Some(resolver) = &self.resolver {
            if let Some(raw) = resolver.resolve(target.clone(), peer).await? {
                if !raw.is_empty() {
                    let upstream = UpstreamDescriptor::parse(&raw)?;
                    debug!(target = %target, upstream = %upstream, "Resolver selected upstream");
                    return Ok(Some(upstream));
                }
            }
        }

        Ok(self.fixed.clone())
    }
}

impl fmt::Debug for UpstreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSelector")
            .field("resolver", &self.resolver.is_some())
            .field("fixed", &self.fixed)
            .finish()
    }
}
