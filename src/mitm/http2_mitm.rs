//! HTTP/2 client leg
//!
//! Serves the client over HTTP/2 with the `h2` crate and round-trips every
//! stream through the destination leg (HTTP/2 or HTTP/1.1). Each stream runs
//! in its own task so a slow exchange does not hold up its siblings; request
//! and response bodies are buffered with flow-control capacity released as
//! data arrives.
//!
//! ## Limitations
//!
//! - **Server push NOT supported**: push promises are never sent to the client
//! - **No extended CONNECT**: WebSockets over HTTP/2 are not tunneled

use super::upstream_client::Exchange;
use super::inspect::bad_gateway;
use crate::conn::WrappedConnection;
use bytes::{Bytes, BytesMut};
use h2::RecvStream;
use http::{Request, Response};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP/2 configuration
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Initial flow control window (per stream) - default: 64KB
    pub initial_window_size: u32,

    /// Connection-level window - default: 1MB
    pub initial_connection_window_size: u32,

    /// Max concurrent streams accepted from the client - default: 100
    pub max_concurrent_streams: u32,

    /// Max frame size - default: 16KB
    pub max_frame_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: 65535,                // 64KB
            initial_connection_window_size: 1_048_576, // 1MB
            max_concurrent_streams: 100,
            max_frame_size: 16384, // 16KB
        }
    }
}

impl Http2Config {
    pub(crate) fn server_builder(&self) -> h2::server::Builder {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_frame_size(self.max_frame_size);
        builder
    }

    pub(crate) fn client_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.initial_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .enable_push(false);
        builder
    }
}

/// HTTP/2 errors
#[derive(Debug, Error)]
pub enum H2Error {
    #[error("Client handshake failed: {0}")]
    ClientHandshakeFailed(#[source] h2::Error),

    #[error("Upstream handshake failed: {0}")]
    UpstreamHandshakeFailed(#[source] h2::Error),

    #[error("Accept stream failed: {0}")]
    AcceptFailed(#[source] h2::Error),

    #[error("Upstream request failed: {0}")]
    UpstreamRequestFailed(#[source] h2::Error),

    #[error("Upstream response failed: {0}")]
    UpstreamResponseFailed(#[source] h2::Error),

    #[error("Client response failed: {0}")]
    ClientResponseFailed(#[source] h2::Error),

    #[error("Body transfer failed: {0}")]
    BodyFailed(#[source] h2::Error),
}

/// Serve the client leg over HTTP/2 until it closes or `cancel` fires
pub async fn serve_http2(
    client: WrappedConnection,
    exchange: Arc<Exchange>,
    config: &Http2Config,
    cancel: &CancellationToken,
) -> Result<(), H2Error> {
    let host = client.state().host().to_string();

    let mut connection = tokio::select! {
        result = config.server_builder().handshake::<_, Bytes>(client) => {
            result.map_err(H2Error::ClientHandshakeFailed)?
        }
        _ = cancel.cancelled() => return Ok(()),
    };

    debug!(target_host = %host, "HTTP/2 client handshake complete");

    let mut streams = JoinSet::new();
    let mut stream_count = 0u64;

    let result = loop {
        let next = tokio::select! {
            next = connection.accept() => next,
            _ = cancel.cancelled() => break Ok(()),
        };

        match next {
            Some(Ok((request, respond))) => {
                stream_count += 1;
                let stream_id = stream_count;
                let exchange = Arc::clone(&exchange);

                streams.spawn(async move {
                    let start = Instant::now();
                    match proxy_stream(request, respond, exchange).await {
                        Ok(()) => debug!(
                            stream_id,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "HTTP/2 stream completed"
                        ),
                        Err(e) => debug!(stream_id, error = %e, "HTTP/2 stream error"),
                    }
                });
            }
            Some(Err(e)) => {
                if e.reason() == Some(h2::Reason::NO_ERROR) {
                    debug!("HTTP/2 graceful shutdown (NO_ERROR)");
                    break Ok(());
                }
                break Err(H2Error::AcceptFailed(e));
            }
            None => break Ok(()),
        }
    };

    // In-flight streams still need the connection polled to finish
    tokio::select! {
        _ = async { while streams.join_next().await.is_some() {} } => {}
        _ = std::future::poll_fn(|cx| connection.poll_closed(cx)) => {}
        _ = cancel.cancelled() => {}
    }
    streams.abort_all();
    while streams.join_next().await.is_some() {}

    debug!(target_host = %host, stream_count, "HTTP/2 client leg closed");
    result
}

/// Round-trip one client stream
async fn proxy_stream(
    request: Request<RecvStream>,
    respond: h2::server::SendResponse<Bytes>,
    exchange: Arc<Exchange>,
) -> Result<(), H2Error> {
    let (parts, mut recv_body) = request.into_parts();
    let body = collect_body(&mut recv_body).await?;
    let request = Request::from_parts(parts, body);

    let response = match exchange.forward(request).await {
        Ok((response, _)) => response,
        Err(e) => {
            warn!(target_host = %exchange.target().host, error = %e, "Destination round trip failed");
            bad_gateway(&e.to_string())
        }
    };

    send_response(respond, response)
}

/// Buffer an h2 body, returning flow-control capacity as chunks arrive
pub(crate) async fn collect_body(body: &mut RecvStream) -> Result<Bytes, H2Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(H2Error::BodyFailed)?;
        body.flow_control()
            .release_capacity(chunk.len())
            .map_err(H2Error::BodyFailed)?;
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn send_response(
    mut respond: h2::server::SendResponse<Bytes>,
    response: Response<Bytes>,
) -> Result<(), H2Error> {
    let (parts, body) = response.into_parts();
    let end_of_stream = body.is_empty();

    let mut send = respond
        .send_response(Response::from_parts(parts, ()), end_of_stream)
        .map_err(H2Error::ClientResponseFailed)?;

    if !end_of_stream {
        send.reserve_capacity(body.len());
        send.send_data(body, true)
            .map_err(H2Error::ClientResponseFailed)?;
    }
    Ok(())
}
