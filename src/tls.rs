//! Listener-side TLS
//!
//! Clients may speak TLS to the proxy itself (an HTTPS proxy). The proxy's own
//! certificate comes from PEM files, or is forged for the configured server
//! name when none are provided.

use crate::conn::WrappedConnection;
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::error::MitmError;
use crate::mitm::tls_config::{ClientTlsConfig, ALPN_HTTP1};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Load TLS certificates and private key from files
pub fn load_certs_and_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), MitmError> {
    let cert_file = File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader).collect::<Result<_, _>>()?;

    if certs.is_empty() {
        return Err(MitmError::CertParseFailed(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)?.ok_or_else(|| {
        MitmError::CertParseFailed(format!("No private key found in {}", key_path.display()))
    })?;

    Ok((certs, key))
}

/// TLS acceptor for connections addressed to the proxy itself
#[derive(Clone)]
pub struct ListenerTls {
    acceptor: TlsAcceptor,
}

impl ListenerTls {
    fn from_parts(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, MitmError> {
        // The proxy protocol itself is HTTP/1.1
        let config = ClientTlsConfig::new(chain, key, vec![ALPN_HTTP1.to_vec()])
            .map_err(|e| MitmError::tls_config(e.to_string()))?;
        Ok(Self {
            acceptor: TlsAcceptor::from(config.server_config()),
        })
    }

    pub fn from_pem(cert_path: &Path, key_path: &Path) -> Result<Self, MitmError> {
        let (chain, key) = load_certs_and_key(cert_path, key_path)?;
        Self::from_parts(chain, key)
    }

    /// Serve a leaf forged for `server_name`
    pub async fn forged(ca: &CertificateAuthority, server_name: &str) -> Result<Self, MitmError> {
        let forged = ca.get_or_forge(server_name).await?;
        Self::from_parts(forged.cert_chain(), forged.private_key())
    }

    /// Terminate TLS, keeping the connection's state and peer
    pub async fn accept(
        &self,
        conn: WrappedConnection,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> io::Result<WrappedConnection> {
        let state = conn.state().clone();
        let peer = conn.peer();

        let tls = tokio::select! {
            result = tokio::time::timeout(timeout, self.acceptor.accept(conn)) => {
                result.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "listener TLS handshake timed out"))??
            }
            _ = cancel.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
            }
        };

        let wrapped = WrappedConnection::new(tls, state);
        Ok(match peer {
            Some(peer) => wrapped.with_peer(peer),
            None => wrapped,
        })
    }
}
