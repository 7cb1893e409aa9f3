//! Protocol Bridge
//!
//! Picks how bytes move between the two legs of a session, keyed by each
//! leg's negotiated HTTP version and the registered hooks:
//!
//! | client | server | hooks need decoding | mode |
//! |---|---|---|---|
//! | same version | same version | no | raw copy |
//! | HTTP/1.1 | HTTP/1.1 | yes | hyper server ↔ hyper client |
//! | HTTP/1.1 | HTTP/2 | always | hyper server ↔ h2 client |
//! | HTTP/2 | HTTP/1.1 | always | h2 server ↔ hyper client (serialized) |
//! | HTTP/2 | HTTP/2 | yes | h2 server ↔ h2 client |

use crate::conn::{HttpVersion, RequestTarget, WrappedConnection};
use crate::mitm::http1_mitm::{serve_http1, WebSocketUpgrade};
use crate::mitm::http2_mitm::{serve_http2, H2Error, Http2Config};
use crate::mitm::inspect::Hooks;
use crate::mitm::upstream_client::{Exchange, UpstreamClient};
use crate::mitm::websocket;
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP/1.1 error: {0}")]
    Http1(#[from] hyper::Error),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] H2Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Bridge cancelled")]
    Cancelled,
}

/// How a session is bridged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// Byte-for-byte copy in both directions
    RawCopy,
    /// Decode requests/responses on both legs
    Inspect {
        client: HttpVersion,
        server: HttpVersion,
    },
}

impl BridgeMode {
    pub fn select(hooks: &Hooks, client: HttpVersion, server: HttpVersion) -> Self {
        if hooks.needs_decoding(client, server) {
            BridgeMode::Inspect { client, server }
        } else {
            BridgeMode::RawCopy
        }
    }
}

/// Bytes moved by a raw copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

/// Bridge two legs until the session ends
pub async fn run(
    client: WrappedConnection,
    server: WrappedConnection,
    hooks: &Hooks,
    h2_config: &Http2Config,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let client_version = client.state().http_version();
    let server_version = server.state().http_version();
    let mode = BridgeMode::select(hooks, client_version, server_version);

    debug!(
        target_host = %server.state().host(),
        mode = ?mode,
        "Bridging legs"
    );

    match mode {
        BridgeMode::RawCopy => {
            let stats = copy_bidirectional(client, server, cancel).await?;
            debug!(
                bytes_up = stats.client_to_server,
                bytes_down = stats.server_to_client,
                "Raw copy finished"
            );
            Ok(())
        }
        BridgeMode::Inspect { client: client_v, .. } => {
            let state = server.state();
            let target = RequestTarget::new(state.scheme(), state.host(), state.port());

            let upstream = UpstreamClient::handshake(server, h2_config, cancel).await?;
            let exchange = Arc::new(Exchange::new(upstream, target, hooks.clone(), client_v));

            match client_v {
                HttpVersion::Http2 => {
                    serve_http2(client, exchange, h2_config, cancel).await?;
                    Ok(())
                }
                HttpVersion::Http1 => match serve_http1(client, exchange, cancel).await? {
                    Some(upgrade) => run_websocket(upgrade, hooks, cancel).await,
                    None => Ok(()),
                },
            }
        }
    }
}

async fn run_websocket(
    upgrade: WebSocketUpgrade,
    hooks: &Hooks,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let client = TokioIo::new(upgrade.client.await?);
    let server = TokioIo::new(upgrade.server.await?);

    match &hooks.frames {
        Some(inspector) => {
            websocket::tunnel(client, server, &upgrade.options, inspector.as_ref(), cancel).await
        }
        None => {
            copy_bidirectional(client, server, cancel).await?;
            Ok(())
        }
    }
}

/// Copy both directions on separate tasks until either finishes
///
/// A finished direction cancels the tunnel scope, which stops the other; the
/// caller waits on that scope rather than on both copies.
pub async fn copy_bidirectional<A, B>(
    a: A,
    b: B,
    cancel: &CancellationToken,
) -> io::Result<CopyStats>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let tunnel = cancel.child_token();
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let up = tokio::spawn(copy_one_way(a_read, b_write, tunnel.clone()));
    let down = tokio::spawn(copy_one_way(b_read, a_write, tunnel.clone()));

    tunnel.cancelled().await;

    let (up, down) = tokio::join!(up, down);
    let up = up.map_err(io::Error::other)?;
    let down = down.map_err(io::Error::other)?;

    Ok(CopyStats {
        client_to_server: up?,
        server_to_client: down?,
    })
}

async fn copy_one_way<R, W>(mut reader: R, mut writer: W, tunnel: CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => result,
        _ = tunnel.cancelled() => Ok(0),
    };
    let _ = writer.shutdown().await;
    tunnel.cancel();

    match result {
        // Resets after the peer is done are the normal end of a tunnel
        Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe) => Ok(0),
        other => other,
    }
}
