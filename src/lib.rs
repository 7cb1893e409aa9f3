//! Relayscope - transparent intercepting forward proxy
//!
//! Relayscope accepts HTTP, HTTPS and SOCKS5 proxy clients on a single port,
//! forwards their traffic directly or through a chained HTTP/SOCKS5 upstream,
//! and can decrypt HTTPS with forged certificates so registered hooks see every
//! request, response and WebSocket frame.
//!
//! ## Features
//!
//! - **Protocol sniffing**: SOCKS5 and HTTP(S) proxy clients share one listener
//! - **TLS interception**: per-hostname certificates forged and cached on demand
//! - **HTTP/1.1 & HTTP/2 bridging**: each leg negotiates its own version via ALPN
//! - **WebSocket inspection**: frames pass through an optional callback in order
//! - **Upstream chaining**: `http://` and `socks5://` next hops, static or per request
//! - **Admission**: Basic credentials, SOCKS5 username/password, IP whitelist
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relayscope::{Hooks, ProxyConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new("127.0.0.1", 8080).with_credentials("user", "pass");
//!     let hooks = Hooks::new().with_capture(true);
//!
//!     let server = ProxyServer::bind(config, hooks, None).await?;
//!     println!("listening on {}", server.local_addr());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `sniff` - first-byte dispatch to the SOCKS5 or HTTP handler
//! - `auth` / `upstream` / `dialer` - admission, next-hop selection, leg dialing
//! - `session` - resolve, dial, intercept and bridge one connection
//! - `mitm` - certificate forging, TLS interception, decoded HTTP and WebSocket legs
//! - `bridge` - raw copy or decoded bridging between the two legs
//! - `server` - listener, worker slots, lifecycle

// Core proxy modules
pub mod config;
pub mod error;
pub mod logger;
pub mod server;
pub mod session;

// Connection handling
pub mod conn;
pub mod http_head;
pub mod sniff;
pub mod socks5;

// Admission and next hop
pub mod auth;
pub mod dialer;
pub mod upstream;

// Interception and bridging
pub mod bridge;
pub mod mitm;

// TLS utilities
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::{ConfigError, LogFormat, ProxyConfig};

/// Errors
pub use error::ProxyError;

/// Server lifecycle
pub use server::{ProxyServer, ServerStats};

/// Connection state
pub use conn::{ConnectionState, HttpVersion, RequestTarget, Scheme, WebSocketOptions, WrappedConnection};

/// Admission and next hop
pub use auth::{AuthError, Credentials, ProxyAuth};
pub use upstream::{ResolveFuture, UpstreamDescriptor, UpstreamError, UpstreamResolver, UpstreamScheme};

/// MITM types and functionality
pub use mitm::{
    // Certificate generation
    CaConfig,
    CaptureRecord,
    CertificateAuthority,
    // Hooks
    Direction,
    ForgedCertificate,
    FrameInspector,
    FrameKind,
    Hooks,
    HostIdentifier,
    InterceptionError,
    MitmError,
    // Interception
    MitmInterceptor,
    RequestInspector,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
