//! Per-connection pipeline shared by the HTTP and SOCKS5 handlers
//!
//! resolve upstream → dial → (HTTPS with hooks) intercept → bridge

use crate::auth::SharedProxyAuth;
use crate::bridge;
use crate::conn::{RequestTarget, Scheme, WrappedConnection};
use crate::dialer::Dialer;
use crate::error::{ProxyError, Result};
use crate::mitm::http2_mitm::Http2Config;
use crate::mitm::inspect::Hooks;
use crate::mitm::interceptor::MitmInterceptor;
use crate::sniff::is_tls_handshake;
use crate::upstream::UpstreamSelector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Listener-level state every connection task reads
pub struct SessionContext {
    pub auth: SharedProxyAuth,
    pub selector: UpstreamSelector,
    pub dialer: Dialer,
    pub hooks: Hooks,
    /// Present when TLS interception is possible
    pub interceptor: Option<Arc<MitmInterceptor>>,
    pub h2_config: Http2Config,
    pub handshake_timeout: Duration,
}

impl SessionContext {
    /// Resolve the next hop and dial the destination leg
    pub async fn open(
        &self,
        target: &RequestTarget,
        explicit_upstream: Option<&str>,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<WrappedConnection> {
        let upstream = self.selector.select(explicit_upstream, target, peer).await?;

        debug!(
            peer = %peer,
            target = %target,
            upstream = upstream.as_ref().map(|u| u.to_string()).unwrap_or_else(|| "direct".to_string()),
            "Dialing destination"
        );

        let stream = self.dialer.connect(target, upstream.as_ref(), cancel).await?;
        Ok(WrappedConnection::from_stream(stream, target.state()))
    }

    /// Relay an established tunnel (CONNECT or SOCKS5)
    ///
    /// With hooks, the first tunneled byte decides the scheme: a TLS handshake
    /// record means HTTPS, anything else plain HTTP. Without hooks the tunnel
    /// is copied at once, so destinations that speak first are relayed.
    pub async fn tunnel(
        &self,
        mut client: WrappedConnection,
        server: WrappedConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.hooks.is_active() {
            let stats = bridge::copy_bidirectional(client, server, cancel).await?;
            debug!(
                bytes_up = stats.client_to_server,
                bytes_down = stats.server_to_client,
                "Tunnel finished"
            );
            return Ok(());
        }

        let first = tokio::select! {
            first = client.peek_byte() => first,
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        let first = match first {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Client closed tunnel before sending data");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let scheme = if is_tls_handshake(first) {
            Scheme::Https
        } else {
            Scheme::Http
        };

        let client_state = client.state().clone().with_scheme(scheme);
        let server_state = server.state().clone().with_scheme(scheme);
        self.forward(
            client.with_state(client_state),
            server.with_state(server_state),
            cancel,
        )
        .await
    }

    /// Intercept if needed, then bridge
    pub async fn forward(
        &self,
        client: WrappedConnection,
        server: WrappedConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let intercept = client.state().scheme() == Scheme::Https && self.hooks.is_active();

        let (client, server) = match (&self.interceptor, intercept) {
            (Some(interceptor), true) => interceptor.intercept(client, server, cancel).await?,
            _ => (client, server),
        };

        bridge::run(client, server, &self.hooks, &self.h2_config, cancel).await?;
        Ok(())
    }
}
