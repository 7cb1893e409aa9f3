//! Proxy server: listener, accept loop and the HTTP(S) proxy handler
//!
//! One task per accepted connection, bounded by a worker-slot semaphore. Each
//! task owns a child of the server's cancellation token; a failing connection
//! only ends its own task.

use crate::auth::AuthError;
use crate::bridge;
use crate::config::ProxyConfig;
use crate::conn::{ConnectionState, RequestTarget, Scheme, WrappedConnection};
use crate::dialer::Dialer;
use crate::error::{ProxyError, Result};
use crate::http_head::{
    connection_established, error_reply, proxy_auth_required, read_request_head, HeadError,
    RequestHead,
};
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::http2_mitm::Http2Config;
use crate::mitm::inspect::Hooks;
use crate::mitm::interceptor::{InterceptionError, MitmInterceptor};
use crate::mitm::tls_config::UpstreamTlsConfig;
use crate::session::SessionContext;
use crate::sniff::{is_tls_handshake, sniff, ConnectionKind};
use crate::socks5;
use crate::tls::ListenerTls;
use crate::upstream::{UpstreamResolver, UpstreamSelector};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection counters
#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub active: u64,
    pub failed: u64,
}

/// Decrements `active` however the connection task ends
struct ActiveGuard(Arc<Counters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// State shared by every connection task
struct Shared {
    session: SessionContext,
    listener_tls: ListenerTls,
    passthrough: Option<RequestTarget>,
    counters: Arc<Counters>,
}

pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl ProxyServer {
    /// Validate the configuration, bind the listener and build the CA
    pub async fn bind(
        config: ProxyConfig,
        hooks: Hooks,
        resolver: Option<Arc<dyn UpstreamResolver>>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr()?).await?;
        let local_addr = listener.local_addr()?;

        let capture = hooks.capture || config.capture;
        let hooks = hooks.with_capture(capture);

        let ca = Arc::new(CertificateAuthority::new(config.ca_config())?);
        let upstream_tls = Arc::new(
            UpstreamTlsConfig::new(config.upstream_tls_verify).map_err(InterceptionError::from)?,
        );
        let interceptor = Arc::new(MitmInterceptor::new(
            Arc::clone(&ca),
            upstream_tls,
            config.handshake_timeout,
        ));

        let listener_tls = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => ListenerTls::from_pem(cert, key)?,
            _ => ListenerTls::forged(&ca, &config.server_name).await?,
        };

        let dialer = Dialer::new(config.dial_timeout)
            .with_local_addr(config.local_addr)
            .with_listen_port(local_addr.port());

        let session = SessionContext {
            auth: Arc::new(config.proxy_auth()),
            selector: UpstreamSelector::new(resolver, config.upstream_descriptor()?),
            dialer,
            hooks,
            interceptor: Some(interceptor),
            h2_config: Http2Config::default(),
            handshake_timeout: config.handshake_timeout,
        };

        let passthrough = config
            .passthrough_target()?
            .map(|(host, port)| RequestTarget::new(Scheme::Http, host, port));

        if config.disable_verify {
            warn!("Client verification is DISABLED. Every peer is admitted without credentials.");
        }

        info!(
            addr = %local_addr,
            upstream = config.upstream.is_some(),
            passthrough = passthrough.is_some(),
            capture,
            "Proxy listening"
        );

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                session,
                listener_tls,
                passthrough,
                counters: Arc::new(Counters::default()),
            }),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Root CA clients can import to trust intercepted sessions
    pub fn root_cert_pem(&self) -> Option<String> {
        self.shared
            .session
            .interceptor
            .as_ref()
            .map(|i| i.certificate_authority().root_cert_pem())
    }

    pub fn stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        ServerStats {
            accepted: counters.accepted.load(Ordering::Relaxed),
            active: counters.active.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting and cancel every connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the accept loop has exited
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Accept loop; returns after `shutdown()`
    pub async fn run(&self) -> Result<()> {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            let (stream, peer) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            let _ = stream.set_nodelay(true);
            let counters = Arc::clone(&self.shared.counters);
            counters.accepted.fetch_add(1, Ordering::Relaxed);
            counters.active.fetch_add(1, Ordering::Relaxed);

            let shared = Arc::clone(&self.shared);
            let cancel = self.shutdown.child_token();

            tokio::spawn(async move {
                let _permit = permit;
                let _active = ActiveGuard(Arc::clone(&counters));

                let result = shared.serve(stream, peer, &cancel).await;
                cancel.cancel();

                match result {
                    Ok(()) => debug!(peer = %peer, "Connection closed"),
                    Err(ProxyError::Cancelled) => debug!(peer = %peer, "Connection cancelled"),
                    Err(e) if e.is_auth_failure() => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = %peer, error = %e, "Client rejected");
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %peer, error = %e, "Connection failed");
                    }
                }
            });
        }

        info!(addr = %self.local_addr, "Proxy stopped accepting");
        self.closed.cancel();
        Ok(())
    }
}

impl Shared {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) -> Result<()> {
        let state = ConnectionState::new(Scheme::Http, peer.ip().to_string(), peer.port());
        let mut client = WrappedConnection::new(stream, state).with_peer(peer);

        if let Some(target) = &self.passthrough {
            return self.passthrough(client, peer, target, cancel).await;
        }

        let sniffed = tokio::time::timeout(self.session.handshake_timeout, sniff(client.stream_mut()));
        let kind = tokio::select! {
            result = sniffed => match result {
                Ok(kind) => kind?,
                Err(_) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data from client").into())
                }
            },
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        debug!(peer = %peer, kind = ?kind, "Sniffed connection");

        match kind {
            ConnectionKind::Socks5 => socks5::handle(client, peer, &self.session, cancel).await,
            ConnectionKind::HttpProxy => self.handle_http(client, peer, cancel).await,
        }
    }

    async fn passthrough(
        &self,
        client: WrappedConnection,
        peer: SocketAddr,
        target: &RequestTarget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.session.auth.admits_without_credentials(peer.ip()) {
            return Err(AuthError::PeerNotAllowed(peer.ip()).into());
        }

        let server = self.session.dialer.connect(target, None, cancel).await?;
        let server = WrappedConnection::from_stream(server, target.state());
        bridge::copy_bidirectional(client, server, cancel).await?;
        Ok(())
    }

    async fn handle_http(
        &self,
        mut client: WrappedConnection,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let first = client.peek_byte().await?;
        if is_tls_handshake(first) {
            debug!(peer = %peer, "Terminating listener TLS");
            client = self
                .listener_tls
                .accept(client, self.session.handshake_timeout, cancel)
                .await?;
        }

        let head = self.read_head(&mut client, cancel).await?;
        let proto = head.proto();
        let target = head.target()?;

        if let Err(e) = self
            .session
            .auth
            .authorize_http(peer.ip(), head.proxy_authorization())
        {
            client
                .stream_mut()
                .write_all(proxy_auth_required(proto).as_bytes())
                .await?;
            return Err(e.into());
        }

        if !head.is_connect() && target.scheme == Scheme::Https {
            client
                .stream_mut()
                .write_all(error_reply(proto, StatusCode::BAD_REQUEST).as_bytes())
                .await?;
            return Err(HeadError::InvalidTarget(format!(
                "{} requires CONNECT",
                target
            ))
            .into());
        }

        debug!(peer = %peer, method = %head.method, target = %target, "Proxy request");

        let server = match self.session.open(&target, None, peer, cancel).await {
            Ok(server) => server,
            Err(e) => {
                let _ = client
                    .stream_mut()
                    .write_all(error_reply(proto, StatusCode::BAD_GATEWAY).as_bytes())
                    .await;
                return Err(e);
            }
        };

        let mut client_state = target.state();
        if let Some(options) = head.websocket_options() {
            client_state = client_state.with_websocket(options);
        }

        if head.is_connect() {
            client
                .stream_mut()
                .write_all(connection_established(proto).as_bytes())
                .await?;
            return self
                .session
                .tunnel(client.with_state(client_state), server, cancel)
                .await;
        }

        // The destination sees the request as if it were sent to it directly
        client.stream_mut().unread(&head.encode_origin_form(&target));
        self.session
            .forward(client.with_state(client_state), server, cancel)
            .await
    }

    async fn read_head(&self, client: &mut WrappedConnection, cancel: &CancellationToken) -> Result<RequestHead> {
        let read = read_request_head(client.stream_mut());
        tokio::select! {
            result = tokio::time::timeout(self.session.handshake_timeout, read) => match result {
                Ok(head) => Ok(head?),
                Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "request head timed out").into()),
            },
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        }
    }
}
