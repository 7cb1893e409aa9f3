//! Inspection hooks
//!
//! Callbacks the embedding application registers to observe or rewrite
//! decoded traffic, plus the header normalisation applied when a decoded
//! message is re-encoded for the other leg.

use crate::conn::{HttpVersion, RequestTarget};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use std::fmt;
use std::sync::Arc;

/// Frame direction inside a WebSocket tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client → destination
    ClientToServer,
    /// Destination → client
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToServer => "send",
            Direction::ServerToClient => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket data message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Request/response callback, invoked with fully buffered messages
///
/// `on_request` may rewrite the request before it is forwarded;
/// `on_response` may rewrite the response before it reaches the client.
pub trait RequestInspector: Send + Sync {
    fn on_request(&self, _request: &mut Request<Bytes>) {}

    fn on_response(&self, request: &Request<Bytes>, response: &mut Response<Bytes>);
}

/// WebSocket frame callback
///
/// Runs synchronously on the relay path, so a slow callback throttles the
/// tunnel.
pub trait FrameInspector: Send + Sync {
    fn on_frame(&self, direction: Direction, kind: FrameKind, payload: &[u8]);
}

impl<F> FrameInspector for F
where
    F: Fn(Direction, FrameKind, &[u8]) + Send + Sync,
{
    fn on_frame(&self, direction: Direction, kind: FrameKind, payload: &[u8]) {
        self(direction, kind, payload)
    }
}

/// Hooks registered on a proxy
#[derive(Clone, Default)]
pub struct Hooks {
    pub request: Option<Arc<dyn RequestInspector>>,
    pub frames: Option<Arc<dyn FrameInspector>>,
    pub capture: bool,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_inspector(mut self, inspector: Arc<dyn RequestInspector>) -> Self {
        self.request = Some(inspector);
        self
    }

    pub fn with_frame_inspector(mut self, inspector: Arc<dyn FrameInspector>) -> Self {
        self.frames = Some(inspector);
        self
    }

    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Any hook or capture active: HTTPS tunnels get intercepted
    pub fn is_active(&self) -> bool {
        self.request.is_some() || self.frames.is_some() || self.capture
    }

    /// Whether the bridge must decode HTTP between these two leg versions
    ///
    /// Mixed versions always need decoding. Two HTTP/1.1 legs also decode for
    /// a frame inspector, since the WebSocket upgrade has to be observed.
    pub fn needs_decoding(&self, client: HttpVersion, server: HttpVersion) -> bool {
        if client != server {
            return true;
        }
        match client {
            HttpVersion::Http1 => self.is_active(),
            HttpVersion::Http2 => self.request.is_some() || self.capture,
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("request", &self.request.is_some())
            .field("frames", &self.frames.is_some())
            .field("capture", &self.capture)
            .finish()
    }
}

// Connection-specific headers; never valid on HTTP/2 and never forwarded
// across a hop on HTTP/1.1 (except for the upgrade pair).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`
///
/// With `keep_upgrade` the `Connection: upgrade` / `Upgrade` pair survives so a
/// WebSocket handshake can cross an HTTP/1.1 hop.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let upgrade = headers.get(header::UPGRADE).cloned();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if keep_upgrade {
        if let Some(upgrade) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, upgrade);
        }
    }
}

/// Whether a request asks for a WebSocket upgrade
pub fn is_websocket_request<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Remove `permessage-deflate` from a client's extension offer
pub fn strip_compression_offer(headers: &mut HeaderMap) {
    let offer = match headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|v| v.to_str().ok())
    {
        Some(offer) => offer.to_string(),
        None => return,
    };

    let kept: Vec<&str> = offer
        .split(',')
        .map(str::trim)
        .filter(|ext| {
            !ext.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case("permessage-deflate")
        })
        .collect();

    if kept.is_empty() {
        headers.remove(header::SEC_WEBSOCKET_EXTENSIONS);
    } else if let Ok(value) = HeaderValue::from_str(&kept.join(", ")) {
        headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, value);
    }
}

/// Re-target a decoded request at the destination leg
///
/// HTTP/2 needs an absolute URI (it becomes `:scheme`/`:authority`); HTTP/1.1
/// gets origin-form plus a `Host` header.
pub fn prepare_request(request: &mut Request<Bytes>, target: &RequestTarget, version: HttpVersion) {
    let authority = request
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| host_header_value(target));

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let websocket = is_websocket_request(request);
    strip_hop_by_hop(request.headers_mut(), websocket && version == HttpVersion::Http1);

    match version {
        HttpVersion::Http2 => {
            request.headers_mut().remove(header::HOST);
            if let Ok(uri) = format!("{}://{}{}", target.scheme, authority, path).parse::<Uri>() {
                *request.uri_mut() = uri;
            }
            *request.version_mut() = Version::HTTP_2;
        }
        HttpVersion::Http1 => {
            if let Ok(uri) = path.parse::<Uri>() {
                *request.uri_mut() = uri;
            }
            if let Ok(host) = HeaderValue::from_str(&authority) {
                request.headers_mut().insert(header::HOST, host);
            }
            *request.version_mut() = Version::HTTP_11;
        }
    }

    let has_length = request.headers().contains_key(header::CONTENT_LENGTH);
    let len = request.body().len();
    if has_length || len > 0 {
        set_content_length(request.headers_mut(), len);
    }
}

/// Re-encode a decoded response for the client leg
pub fn prepare_response(response: &mut Response<Bytes>, method: &Method, version: HttpVersion) {
    let status = response.status();
    let upgrade = status == StatusCode::SWITCHING_PROTOCOLS;
    strip_hop_by_hop(response.headers_mut(), upgrade && version == HttpVersion::Http1);

    *response.version_mut() = match version {
        HttpVersion::Http1 => Version::HTTP_11,
        HttpVersion::Http2 => Version::HTTP_2,
    };

    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        response.headers_mut().remove(header::CONTENT_LENGTH);
    } else if *method != Method::HEAD {
        let len = response.body().len();
        set_content_length(response.headers_mut(), len);
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

fn host_header_value(target: &RequestTarget) -> String {
    if target.port != target.scheme.default_port() {
        return target.authority();
    }
    if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    }
}

/// 502 sent to the client when the destination round trip fails
pub fn bad_gateway(message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.to_string()));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
