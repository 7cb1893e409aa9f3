//! MITM Interceptor - TLS Interception Leg
//!
//! Interception flow for one tunneled connection:
//! 1. Read the client's ClientHello without answering it (SNI, ALPN offer)
//! 2. Handshake with the real destination first, offering what the client
//!    offered, and harvest the destination's certificate names
//! 3. Forge (or reuse) a leaf for the requested hostname and finish the
//!    client handshake, preferring the destination's negotiated version
//! 4. Hand both decrypted legs, each with its own negotiated state, back to
//!    the caller for bridging

use crate::conn::{HttpVersion, WrappedConnection};
use crate::mitm::certificate_authority::{subject_names_from_der, CertificateAuthority};
use crate::mitm::error::MitmError;
use crate::mitm::tls_config::{
    alpn_protocols, parse_server_name, ClientTlsConfig, TlsConfigError, UpstreamTlsConfig,
    ALPN_H2,
};
use rustls::server::Acceptor;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interception errors
#[derive(Debug, Error)]
pub enum InterceptionError {
    #[error("MITM error: {0}")]
    MitmError(#[from] MitmError),

    #[error("TLS configuration failed: {0}")]
    TlsConfig(#[from] TlsConfigError),

    #[error("Client TLS handshake failed: {0}")]
    ClientHandshakeFailed(#[source] io::Error),

    #[error("Upstream TLS handshake failed: {0}")]
    UpstreamHandshakeFailed(#[source] io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Interception cancelled")]
    Cancelled,
}

/// MITM Interceptor
pub struct MitmInterceptor {
    /// Certificate authority forging client-facing leaves
    ca: Arc<CertificateAuthority>,

    /// Destination-facing TLS settings
    upstream_tls: Arc<UpstreamTlsConfig>,

    /// Per-handshake deadline (each leg separately)
    handshake_timeout: Duration,
}

impl MitmInterceptor {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        upstream_tls: Arc<UpstreamTlsConfig>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            ca,
            upstream_tls,
            handshake_timeout,
        }
    }

    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Terminate TLS on both legs
    ///
    /// `client` must be positioned at the ClientHello; `server` is the dialed
    /// destination leg, still carrying ciphertext.
    pub async fn intercept(
        &self,
        client: WrappedConnection,
        server: WrappedConnection,
        cancel: &CancellationToken,
    ) -> Result<(WrappedConnection, WrappedConnection), InterceptionError> {
        let client_state = client.state().clone();
        let server_state = server.state().clone();
        let peer = client.peer();

        // 1. ClientHello
        let start = self
            .bounded(
                "client hello",
                LazyConfigAcceptor::new(Acceptor::default(), client),
                cancel,
            )
            .await?
            .map_err(InterceptionError::ClientHandshakeFailed)?;

        let hello = start.client_hello();
        let sni = hello.server_name().map(str::to_string);
        let client_offers_h2 = hello
            .alpn()
            .map(|mut offers| offers.any(|p| p == ALPN_H2))
            .unwrap_or(false);

        let hostname = sni.unwrap_or_else(|| server_state.host().to_string());

        debug!(
            target_host = %hostname,
            client_offers_h2,
            "Client hello received, connecting to destination"
        );

        // 2. Destination handshake
        let connector =
            TlsConnector::from(self.upstream_tls.client_config(!client_offers_h2));
        let server_name = parse_server_name(&hostname)?;
        let server_tls = self
            .bounded(
                "destination TLS handshake",
                connector.connect(server_name, server),
                cancel,
            )
            .await?
            .map_err(InterceptionError::UpstreamHandshakeFailed)?;

        let (server_version, harvested) = {
            let session = server_tls.get_ref().1;
            let harvested = session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|leaf| subject_names_from_der(leaf.as_ref()))
                .unwrap_or_default();
            (HttpVersion::from_alpn(session.alpn_protocol()), harvested)
        };

        // 3. Client handshake with a leaf mirroring the destination's names
        let forged = self.ca.get_or_forge_with_names(&hostname, &harvested).await?;
        let tls_config = ClientTlsConfig::new(
            forged.cert_chain(),
            forged.private_key(),
            alpn_protocols(server_version, false),
        )?;

        let client_tls = self
            .bounded(
                "client TLS handshake",
                start.into_stream(tls_config.server_config()),
                cancel,
            )
            .await?
            .map_err(InterceptionError::ClientHandshakeFailed)?;

        let client_version = HttpVersion::from_alpn(client_tls.get_ref().1.alpn_protocol());

        debug!(
            target_host = %hostname,
            client_version = ?client_version,
            server_version = ?server_version,
            "TLS interception established"
        );

        // 4. Decrypted legs
        let mut client_leg =
            WrappedConnection::new(client_tls, client_state.with_http_version(client_version));
        if let Some(peer) = peer {
            client_leg = client_leg.with_peer(peer);
        }
        let server_leg =
            WrappedConnection::new(server_tls, server_state.with_http_version(server_version));

        Ok((client_leg, server_leg))
    }

    async fn bounded<F: Future>(
        &self,
        stage: &'static str,
        future: F,
        cancel: &CancellationToken,
    ) -> Result<F::Output, InterceptionError> {
        tokio::select! {
            result = tokio::time::timeout(self.handshake_timeout, future) => {
                result.map_err(|_| InterceptionError::Timeout(stage))
            }
            _ = cancel.cancelled() => Err(InterceptionError::Cancelled),
        }
    }
}
