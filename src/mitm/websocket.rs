//! WebSocket Tunnel
//!
//! Re-frames both upgraded legs with tokio-tungstenite and relays data
//! messages in two loops, one per direction, passing each through the frame
//! inspector before forwarding. Control frames are answered per leg by
//! tungstenite itself; a close frame is forwarded and ends the tunnel.

use super::inspect::{Direction, FrameInspector, FrameKind};
use crate::bridge::BridgeError;
use crate::conn::WebSocketOptions;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Relay frames between an upgraded client leg and destination leg
pub async fn tunnel<C, S>(
    client: C,
    server: S,
    options: &WebSocketOptions,
    inspector: &dyn FrameInspector,
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(
        protocol = ?options.protocol,
        extensions = ?options.extensions,
        "WebSocket tunnel started"
    );

    let client_ws = WebSocketStream::from_raw_socket(client, Role::Server, None).await;
    let server_ws = WebSocketStream::from_raw_socket(server, Role::Client, None).await;

    let (mut client_tx, mut client_rx) = client_ws.split();
    let (mut server_tx, mut server_rx) = server_ws.split();

    let result = tokio::select! {
        result = relay(&mut client_rx, &mut server_tx, Direction::ClientToServer, inspector) => result,
        result = relay(&mut server_rx, &mut client_tx, Direction::ServerToClient, inspector) => result,
        _ = cancel.cancelled() => Ok(()),
    };

    let _ = client_tx.close().await;
    let _ = server_tx.close().await;

    debug!("WebSocket tunnel closed");
    result
}

async fn relay<R, W>(
    rx: &mut R,
    tx: &mut W,
    direction: Direction,
    inspector: &dyn FrameInspector,
) -> Result<(), BridgeError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => return closed_ok(e),
        };

        match message {
            Message::Text(text) => {
                inspector.on_frame(direction, FrameKind::Text, text.as_bytes());
                tx.send(Message::Text(text)).await.or_else(closed_ok)?;
            }
            Message::Binary(data) => {
                inspector.on_frame(direction, FrameKind::Binary, &data[..]);
                tx.send(Message::Binary(data)).await.or_else(closed_ok)?;
            }
            Message::Close(frame) => {
                debug!(%direction, "WebSocket close frame relayed");
                let _ = tx.send(Message::Close(frame)).await;
                break;
            }
            // Answered by tungstenite on each leg
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(())
}

fn closed_ok(error: WsError) -> Result<(), BridgeError> {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Ok(()),
        WsError::Protocol(
            tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => Ok(()),
        other => Err(BridgeError::WebSocket(other)),
    }
}
