//! MITM (Man-in-the-Middle) interception module
//!
//! - Certificate Authority with per-hostname forged leaves and their cache
//! - TLS configuration for both interception legs
//! - The TLS Interception Leg itself
//! - Decoded HTTP/1.1 and HTTP/2 serving of the client leg
//! - WebSocket frame relaying
//! - Inspection hooks and traffic capture

pub mod capture;
pub mod cert_cache;
pub mod certificate_authority;
pub mod error;
pub mod http1_mitm;
pub mod http2_mitm;
pub mod inspect;
pub mod interceptor;
pub mod tls_config;
pub mod upstream_client;
pub mod websocket;

// Re-export main types
pub use capture::{CaptureRecord, CAPTURE_TARGET};
pub use cert_cache::CertCache;
pub use certificate_authority::{CaConfig, CertificateAuthority, ForgedCertificate, HostIdentifier};
pub use error::MitmError;
pub use http1_mitm::{serve_http1, WebSocketUpgrade};
pub use http2_mitm::{serve_http2, H2Error, Http2Config};
pub use inspect::{Direction, FrameInspector, FrameKind, Hooks, RequestInspector};
pub use interceptor::{InterceptionError, MitmInterceptor};
pub use tls_config::{ClientTlsConfig, TlsConfigError, UpstreamTlsConfig};
pub use upstream_client::{Exchange, UpstreamClient};
