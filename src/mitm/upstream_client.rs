//! Destination-leg client and the decoded exchange
//!
//! [`UpstreamClient`] performs protocol-neutral round trips
//! (`Request<Bytes>` → `Response<Bytes>`) over the destination leg, whichever
//! HTTP version it negotiated. HTTP/1.1 exchanges are serialized because that
//! leg has no multiplexing; HTTP/2 exchanges share one connection.
//!
//! [`Exchange`] wraps a round trip with the inspection hooks, header
//! normalisation for each leg and traffic capture.

use super::capture::CaptureRecord;
use super::http2_mitm::{collect_body, H2Error, Http2Config};
use super::inspect::{
    is_websocket_request, prepare_request, prepare_response, strip_compression_offer, Hooks,
};
use crate::bridge::BridgeError;
use crate::conn::{HttpVersion, RequestTarget, WrappedConnection};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sender half of the destination leg
pub enum UpstreamClient {
    Http1(Mutex<http1::SendRequest<Full<Bytes>>>),
    Http2(h2::client::SendRequest<Bytes>),
}

impl UpstreamClient {
    /// Handshake on the destination leg using its negotiated version
    ///
    /// The connection driver runs in a task bound to `cancel`.
    pub async fn handshake(
        server: WrappedConnection,
        config: &Http2Config,
        cancel: &CancellationToken,
    ) -> Result<Self, BridgeError> {
        let host = server.state().host().to_string();

        match server.state().http_version() {
            HttpVersion::Http1 => {
                let (sender, connection) = http1::Builder::new()
                    .handshake::<_, Full<Bytes>>(TokioIo::new(server))
                    .await?;

                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        result = connection.with_upgrades() => {
                            if let Err(e) = result {
                                debug!(target_host = %host, error = %e, "HTTP/1.1 destination connection error");
                            }
                        }
                        _ = cancel.cancelled() => {}
                    }
                });

                Ok(Self::Http1(Mutex::new(sender)))
            }
            HttpVersion::Http2 => {
                let (sender, connection) = config
                    .client_builder()
                    .handshake::<_, Bytes>(server)
                    .await
                    .map_err(H2Error::UpstreamHandshakeFailed)?;

                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        result = connection => {
                            if let Err(e) = result {
                                debug!(target_host = %host, error = %e, "HTTP/2 destination connection error");
                            }
                        }
                        _ = cancel.cancelled() => {}
                    }
                });

                Ok(Self::Http2(sender))
            }
        }
    }

    pub fn version(&self) -> HttpVersion {
        match self {
            Self::Http1(_) => HttpVersion::Http1,
            Self::Http2(_) => HttpVersion::Http2,
        }
    }

    /// One buffered round trip
    ///
    /// A `101 Switching Protocols` answer on HTTP/1.1 comes back with an empty
    /// body and the pending upgrade of the destination leg.
    pub async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<(Response<Bytes>, Option<OnUpgrade>), BridgeError> {
        match self {
            Self::Http1(sender) => {
                let mut sender = sender.lock().await;
                sender.ready().await?;

                let mut response = sender.send_request(request.map(Full::new)).await?;

                if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                    let upgrade = hyper::upgrade::on(&mut response);
                    let (parts, _) = response.into_parts();
                    return Ok((Response::from_parts(parts, Bytes::new()), Some(upgrade)));
                }

                let (parts, body) = response.into_parts();
                let body = body.collect().await?.to_bytes();
                Ok((Response::from_parts(parts, body), None))
            }
            Self::Http2(sender) => {
                let mut sender = sender
                    .clone()
                    .ready()
                    .await
                    .map_err(H2Error::UpstreamRequestFailed)?;

                let (parts, body) = request.into_parts();
                let end_of_stream = body.is_empty();
                let (response_future, mut send_body) = sender
                    .send_request(Request::from_parts(parts, ()), end_of_stream)
                    .map_err(H2Error::UpstreamRequestFailed)?;

                if !end_of_stream {
                    send_body.reserve_capacity(body.len());
                    send_body
                        .send_data(body, true)
                        .map_err(H2Error::UpstreamRequestFailed)?;
                }

                let response = response_future
                    .await
                    .map_err(H2Error::UpstreamResponseFailed)?;
                let (parts, mut recv_body) = response.into_parts();
                let body = collect_body(&mut recv_body).await?;
                Ok((Response::from_parts(parts, body), None))
            }
        }
    }
}

/// Decoded request/response exchange between two legs
pub struct Exchange {
    upstream: UpstreamClient,
    target: RequestTarget,
    hooks: Hooks,
    client_version: HttpVersion,
}

impl Exchange {
    pub fn new(
        upstream: UpstreamClient,
        target: RequestTarget,
        hooks: Hooks,
        client_version: HttpVersion,
    ) -> Self {
        Self {
            upstream,
            target,
            hooks,
            client_version,
        }
    }

    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Inspect, forward, inspect again and re-encode for the client leg
    pub async fn forward(
        &self,
        mut request: Request<Bytes>,
    ) -> Result<(Response<Bytes>, Option<OnUpgrade>), BridgeError> {
        let started = Instant::now();
        let server_version = self.upstream.version();

        if let Some(inspector) = &self.hooks.request {
            inspector.on_request(&mut request);
        }

        let mut outbound = copy_request(&request);
        if self.hooks.frames.is_some() && is_websocket_request(&outbound) {
            strip_compression_offer(outbound.headers_mut());
        }
        prepare_request(&mut outbound, &self.target, server_version);

        debug!(
            method = %request.method(),
            uri = %request.uri(),
            client_version = ?self.client_version,
            server_version = ?server_version,
            "Forwarding decoded request"
        );

        let (mut response, upgrade) = self.upstream.round_trip(outbound).await?;

        if let Some(inspector) = &self.hooks.request {
            inspector.on_response(&request, &mut response);
        }
        prepare_response(&mut response, request.method(), self.client_version);

        if self.hooks.capture {
            CaptureRecord::new(
                &self.target.host,
                self.target.port,
                &request,
                &response,
                started.elapsed(),
            )
            .with_versions(version_label(self.client_version), version_label(server_version))
            .emit();
        }

        Ok((response, upgrade))
    }
}

fn version_label(version: HttpVersion) -> &'static str {
    match version {
        HttpVersion::Http1 => "HTTP/1.1",
        HttpVersion::Http2 => "HTTP/2",
    }
}

// Extensions are connection-local and are not carried over
fn copy_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}
