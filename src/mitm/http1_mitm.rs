//! HTTP/1.1 client leg
//!
//! Serves the client with hyper's HTTP/1.1 server (keep-alive, upgrades) and
//! round-trips each request through the destination leg. When both legs agree
//! on a WebSocket upgrade, the pending upgrades are handed back to the caller
//! once hyper releases the connection.

use super::inspect::{bad_gateway, is_websocket_request};
use super::upstream_client::Exchange;
use crate::bridge::BridgeError;
use crate::conn::{WebSocketOptions, WrappedConnection};
use bytes::Bytes;
use http::header::{HeaderName, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Both halves of an accepted WebSocket upgrade
pub struct WebSocketUpgrade {
    pub client: OnUpgrade,
    pub server: OnUpgrade,
    pub options: WebSocketOptions,
}

/// Serve the client leg over HTTP/1.1
///
/// Returns the upgrade pair when the session switched to WebSocket, `None`
/// when the client simply closed.
pub async fn serve_http1(
    client: WrappedConnection,
    exchange: Arc<Exchange>,
    cancel: &CancellationToken,
) -> Result<Option<WebSocketUpgrade>, BridgeError> {
    let (upgrade_tx, mut upgrade_rx) = mpsc::channel::<WebSocketUpgrade>(1);

    let service = service_fn(move |request: Request<Incoming>| {
        let exchange = Arc::clone(&exchange);
        let upgrade_tx = upgrade_tx.clone();
        async move { Ok::<_, Infallible>(handle_request(request, exchange, upgrade_tx).await) }
    });

    let connection = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(client), service)
        .with_upgrades();

    tokio::select! {
        result = connection => result?,
        _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
    }

    Ok(upgrade_rx.try_recv().ok())
}

async fn handle_request(
    mut request: Request<Incoming>,
    exchange: Arc<Exchange>,
    upgrades: mpsc::Sender<WebSocketUpgrade>,
) -> Response<Full<Bytes>> {
    let client_upgrade = if is_websocket_request(&request) {
        Some(hyper::upgrade::on(&mut request))
    } else {
        None
    };

    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read client request body");
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return response;
        }
    };

    let (response, server_upgrade) = match exchange.forward(Request::from_parts(parts, body)).await {
        Ok(result) => result,
        Err(e) => {
            warn!(target_host = %exchange.target().host, error = %e, "Destination round trip failed");
            return bad_gateway(&e.to_string()).map(Full::new);
        }
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let (Some(client), Some(server)) = (client_upgrade, server_upgrade) {
            let options = negotiated_options(response.headers());
            debug!(
                target_host = %exchange.target().host,
                protocol = ?options.protocol,
                "WebSocket upgrade accepted"
            );
            let _ = upgrades.try_send(WebSocketUpgrade {
                client,
                server,
                options,
            });
        }
    }

    response.map(Full::new)
}

/// Subprotocol and extensions the destination accepted
pub fn negotiated_options(headers: &HeaderMap) -> WebSocketOptions {
    let value = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    WebSocketOptions {
        protocol: value(SEC_WEBSOCKET_PROTOCOL),
        extensions: value(SEC_WEBSOCKET_EXTENSIONS),
    }
}
