//! HTTP/1 message heads on the proxy leg
//!
//! Only the head of the first request on a client connection (and the head of
//! an upstream proxy's CONNECT reply) is parsed here. Everything after the head
//! stays in the leg's [`PeekableStream`] for the next stage.

use crate::conn::{PeekableStream, RequestTarget, Scheme, WebSocketOptions};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::Authority;
use http::{Method, StatusCode, Uri};
use std::io;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Largest accepted message head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

/// Headers addressed to this proxy that must not travel further
const PROXY_HEADERS: &[&str] = &["proxy-authorization", "proxy-connection"];

/// Head parsing errors
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("Connection closed before a complete message head")]
    Incomplete,

    #[error("Message head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Malformed message head: {0}")]
    Malformed(String),

    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    /// Minor HTTP version (`HTTP/1.x`)
    pub minor_version: u8,
    pub headers: HeaderMap,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Read one request head, consuming exactly its bytes from the stream
pub async fn read_request_head<S>(stream: &mut PeekableStream<S>) -> Result<RequestHead, HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let parsed = parse_request(stream.buffer())?;
        if let Some((head, len)) = parsed {
            stream.consume(len);
            return Ok(head);
        }
        fill_or_fail(stream).await?;
    }
}

/// Read one response head, consuming exactly its bytes from the stream
pub async fn read_response_head<S>(
    stream: &mut PeekableStream<S>,
) -> Result<ResponseHead, HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let parsed = parse_response(stream.buffer())?;
        if let Some((head, len)) = parsed {
            stream.consume(len);
            return Ok(head);
        }
        fill_or_fail(stream).await?;
    }
}

async fn fill_or_fail<S: AsyncRead + Unpin>(stream: &mut PeekableStream<S>) -> Result<(), HeadError> {
    if stream.buffer().len() > MAX_HEAD_SIZE {
        return Err(HeadError::TooLarge(MAX_HEAD_SIZE));
    }
    if stream.fill_more().await? == 0 {
        return Err(HeadError::Incomplete);
    }
    Ok(())
}

/// Parse a request head from a buffer; `None` while incomplete
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    let method = req
        .method
        .ok_or_else(|| HeadError::Malformed("missing method".to_string()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| HeadError::Malformed(e.to_string()))?;

    let path = req
        .path
        .ok_or_else(|| HeadError::Malformed("missing request target".to_string()))?;
    let uri = path
        .parse::<Uri>()
        .map_err(|e| HeadError::InvalidTarget(format!("{}: {}", path, e)))?;

    let headers = collect_headers(req.headers)?;

    Ok(Some((
        RequestHead {
            method,
            uri,
            minor_version: req.version.unwrap_or(1),
            headers,
        },
        len,
    )))
}

/// Parse a response head from a buffer; `None` while incomplete
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, HeadError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw_headers);

    let len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    let code = resp
        .code
        .ok_or_else(|| HeadError::Malformed("missing status code".to_string()))?;
    let status =
        StatusCode::from_u16(code).map_err(|e| HeadError::Malformed(e.to_string()))?;

    Ok(Some((
        ResponseHead {
            status,
            reason: resp.reason.unwrap_or_default().to_string(),
            headers: collect_headers(resp.headers)?,
        },
        len,
    )))
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, HeadError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| HeadError::Malformed(format!("header name {}: {}", h.name, e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| HeadError::Malformed(format!("header {}: {}", h.name, e)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// `HTTP/1.0` or `HTTP/1.1`, echoed back in proxy replies
    pub fn proto(&self) -> &'static str {
        if self.minor_version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn proxy_authorization(&self) -> Option<&str> {
        self.header(header::PROXY_AUTHORIZATION.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header(header::UPGRADE.as_str())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    pub fn websocket_options(&self) -> Option<WebSocketOptions> {
        if !self.is_websocket_upgrade() {
            return None;
        }
        Some(WebSocketOptions {
            protocol: self
                .header(header::SEC_WEBSOCKET_PROTOCOL.as_str())
                .map(str::to_string),
            extensions: self
                .header(header::SEC_WEBSOCKET_EXTENSIONS.as_str())
                .map(str::to_string),
        })
    }

    /// Normalise the destination
    ///
    /// CONNECT uses the authority-form target and implies https. Absolute-form
    /// targets carry their own scheme. Origin-form targets fall back to the
    /// `Host` header over http.
    pub fn target(&self) -> Result<RequestTarget, HeadError> {
        if self.is_connect() {
            let authority = self
                .uri
                .authority()
                .ok_or_else(|| HeadError::InvalidTarget(self.uri.to_string()))?;
            return Ok(target_from_authority(Scheme::Https, authority));
        }

        if let Some(authority) = self.uri.authority() {
            let scheme = match self.uri.scheme_str() {
                Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
                _ => Scheme::Http,
            };
            return Ok(target_from_authority(scheme, authority));
        }

        let host = self
            .header(header::HOST.as_str())
            .ok_or_else(|| HeadError::InvalidTarget("no host in request".to_string()))?;
        let authority = host
            .parse::<Authority>()
            .map_err(|e| HeadError::InvalidTarget(format!("{}: {}", host, e)))?;
        Ok(target_from_authority(Scheme::Http, &authority))
    }

    /// Re-serialise the head in origin-form for the destination
    ///
    /// Proxy-only headers are dropped; a `Host` header is added when the
    /// client only carried the authority in the request target.
    pub fn encode_origin_form(&self, target: &RequestTarget) -> Vec<u8> {
        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/");

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.proto().as_bytes());
        out.extend_from_slice(b"\r\n");

        if !self.headers.contains_key(header::HOST) {
            let host = if target.port == target.scheme.default_port() {
                target.host.clone()
            } else {
                target.authority()
            };
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        for (name, value) in &self.headers {
            if PROXY_HEADERS.contains(&name.as_str()) {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn target_from_authority(scheme: Scheme, authority: &Authority) -> RequestTarget {
    let port = authority
        .port_u16()
        .unwrap_or_else(|| scheme.default_port());
    RequestTarget::new(scheme, authority.host(), port)
}

/// Challenge sent when neither credentials nor the whitelist admit a client
pub fn proxy_auth_required(proto: &str) -> String {
    format!(
        "{} 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n",
        proto
    )
}

/// Reply to a successful CONNECT
pub fn connection_established(proto: &str) -> String {
    format!("{} 200 Connection established\r\n\r\n", proto)
}

/// Error reply written before closing a client whose request was not forwarded
pub fn error_reply(proto: &str, status: StatusCode) -> String {
    format!(
        "{} {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        proto,
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_connect() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (head, len) = parse_request(raw).unwrap().unwrap();

        assert_eq!(len, raw.len());
        assert!(head.is_connect());
        assert_eq!(head.proto(), "HTTP/1.1");
        let target = head.target().unwrap();
        assert_eq!(target, RequestTarget::new(Scheme::Https, "example.com", 443));
    }

    #[test]
    fn test_parse_absolute_form() {
        let raw = b"GET http://example.com:8080/a?b=1 HTTP/1.0\r\n\r\n";
        let (head, _) = parse_request(raw).unwrap().unwrap();

        assert_eq!(head.proto(), "HTTP/1.0");
        let target = head.target().unwrap();
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn test_origin_form_uses_host_header() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, _) = parse_request(raw).unwrap().unwrap();

        let target = head.target().unwrap();
        assert_eq!(target, RequestTarget::new(Scheme::Http, "example.com", 80));
    }

    #[test]
    fn test_ipv6_connect_target() {
        let raw = b"CONNECT [::1]:8443 HTTP/1.1\r\n\r\n";
        let (head, _) = parse_request(raw).unwrap().unwrap();
        let target = head.target().unwrap();

        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn test_missing_host_is_invalid_target() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let (head, _) = parse_request(raw).unwrap().unwrap();
        assert!(matches!(head.target(), Err(HeadError::InvalidTarget(_))));
    }

    #[test]
    fn test_partial_head() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_request(b"\x00\x01\x02 nonsense\r\n\r\n"),
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn test_origin_form_encoding_strips_proxy_headers() {
        let raw = b"GET http://example.com/path?q=1 HTTP/1.1\r\n\
            Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
            Proxy-Connection: keep-alive\r\n\
            Accept: */*\r\n\r\n";
        let (head, _) = parse_request(raw).unwrap().unwrap();
        let target = head.target().unwrap();
        let encoded = String::from_utf8(head.encode_origin_form(&target)).unwrap();

        assert!(encoded.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(encoded.contains("Host: example.com\r\n"));
        assert!(encoded.contains("accept: */*\r\n"));
        assert!(!encoded.to_ascii_lowercase().contains("proxy-"));
        assert!(encoded.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_websocket_options() {
        let raw = b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: WebSocket\r\n\
            Sec-WebSocket-Protocol: chat\r\n\
            Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n";
        let (head, _) = parse_request(raw).unwrap().unwrap();
        let opts = head.websocket_options().unwrap();

        assert_eq!(opts.protocol.as_deref(), Some("chat"));
        assert!(opts.compression_requested());
    }

    #[test]
    fn test_parse_response() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";
        let (head, len) = parse_response(raw).unwrap().unwrap();

        assert_eq!(len, raw.len());
        assert_eq!(head.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(head.reason, "Proxy Authentication Required");
    }

    #[test]
    fn test_canned_replies() {
        assert_eq!(
            connection_established("HTTP/1.1"),
            "HTTP/1.1 200 Connection established\r\n\r\n"
        );
        let challenge = proxy_auth_required("HTTP/1.0");
        assert!(challenge.starts_with("HTTP/1.0 407 "));
        assert!(challenge.contains("Proxy-Authenticate: Basic"));
        assert!(error_reply("HTTP/1.1", StatusCode::BAD_GATEWAY).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn test_read_head_leaves_body_buffered() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tokio::spawn(async move {
            tx.write_all(b"POST http://a/ HTTP/1.1\r\nContent-")
                .await
                .unwrap();
            tx.write_all(b"Length: 4\r\n\r\nbody").await.unwrap();
        });

        let mut stream = PeekableStream::new(rx);
        let head = read_request_head(&mut stream).await.unwrap();
        assert_eq!(head.method, Method::POST);

        let mut body = [0u8; 4];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"body");
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(tx);

        let mut stream = PeekableStream::new(rx);
        assert!(matches!(
            read_request_head(&mut stream).await,
            Err(HeadError::Incomplete)
        ));
    }
}
