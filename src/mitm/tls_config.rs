//! TLS Configuration for the interception legs
//!
//! - Client-facing TLS (proxy ← client) with forged certificates
//! - Upstream TLS (proxy → destination), verifying or not
//!
//! Both sides speak TLS 1.2 and 1.3 and negotiate HTTP versions with ALPN.
//! The ring provider is selected explicitly so no process-wide default has
//! to be installed.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::conn::HttpVersion;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// ALPN list for a leg; WebSocket legs only speak HTTP/1.1
pub fn alpn_protocols(preferred: HttpVersion, websocket: bool) -> Vec<Vec<u8>> {
    if websocket {
        return vec![ALPN_HTTP1.to_vec()];
    }
    match preferred {
        HttpVersion::Http2 => vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()],
        HttpVersion::Http1 => vec![ALPN_HTTP1.to_vec(), ALPN_H2.to_vec()],
    }
}

/// Client-facing TLS config (proxy acts as server with a forged cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build a server config serving `cert_chain`
    ///
    /// `alpn` is in server preference order; rustls picks the first entry the
    /// client also offers.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        alpn: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = alpn;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client toward the destination)
///
/// Holds one rustls config per ALPN profile so per-connection setup is a
/// cheap `Arc` clone.
pub struct UpstreamTlsConfig {
    default: Arc<ClientConfig>,
    websocket: Arc<ClientConfig>,
    verify: bool,
}

impl UpstreamTlsConfig {
    /// `verify = false` accepts any destination certificate
    pub fn new(verify: bool) -> Result<Self, TlsConfigError> {
        Self::with_roots(verify, None)
    }

    /// Verify against `roots` instead of the webpki bundle
    pub fn with_roots(verify: bool, roots: Option<RootCertStore>) -> Result<Self, TlsConfigError> {
        let build = |websocket: bool| -> Result<Arc<ClientConfig>, TlsConfigError> {
            let builder = ClientConfig::builder_with_provider(provider())
                .with_protocol_versions(&[&TLS12, &TLS13])
                .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

            let mut config = if verify {
                let root_store = match &roots {
                    Some(store) => store.clone(),
                    None => {
                        let mut store = RootCertStore::empty();
                        store.extend(TLS_SERVER_ROOTS.iter().cloned());
                        store
                    }
                };
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            } else {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider())))
                    .with_no_client_auth()
            };

            config.alpn_protocols = alpn_protocols(HttpVersion::Http2, websocket);
            Ok(Arc::new(config))
        };

        let config = Self {
            default: build(false)?,
            websocket: build(true)?,
            verify,
        };

        debug!(verify, "Upstream TLS config created");
        Ok(config)
    }

    /// Get rustls ClientConfig for a leg
    pub fn client_config(&self, websocket: bool) -> Arc<ClientConfig> {
        if websocket {
            Arc::clone(&self.websocket)
        } else {
            Arc::clone(&self.default)
        }
    }

    pub fn verifies(&self) -> bool {
        self.verify
    }
}

/// Parse hostname into ServerName for SNI
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
    let trimmed = hostname.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(trimmed.to_owned())
        .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", hostname, e)))
}

/// Verifier used when upstream verification is off. Signatures are still
/// checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
