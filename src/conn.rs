//! Connection Wrapper
//!
//! Every leg of a proxied session (client-facing or destination-facing) is read
//! through exactly one [`PeekableStream`], so bytes that were peeked or buffered
//! while sniffing, parsing a request head, or reading an upstream CONNECT reply
//! are never lost when the stream is handed to the next stage (TLS, hyper, h2,
//! raw copy).
//!
//! [`ConnectionState`] is the negotiated per-leg state. It is built once enough
//! of the leg is known and is never mutated afterwards: learning more produces a
//! new value via the `with_*` methods.

use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Read-ahead granularity when filling the peek buffer
const READ_CHUNK: usize = 8 * 1024;

/// Object-safe alias for the byte streams the proxy moves around
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased leg stream (TCP, TLS over TCP, SOCKS5 tunnel, ...)
pub type BoxedStream = Box<dyn AsyncStream>;

/// Leg scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version negotiated on one leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersion {
    #[default]
    Http1,
    Http2,
}

impl HttpVersion {
    /// Map an ALPN result to a version (anything but `h2` is HTTP/1.1)
    pub fn from_alpn(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(b"h2") => HttpVersion::Http2,
            _ => HttpVersion::Http1,
        }
    }
}

/// WebSocket handshake details recorded on a leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSocketOptions {
    /// `Sec-WebSocket-Protocol`
    pub protocol: Option<String>,

    /// `Sec-WebSocket-Extensions` (compression negotiation)
    pub extensions: Option<String>,
}

impl WebSocketOptions {
    pub fn compression_requested(&self) -> bool {
        self.extensions
            .as_deref()
            .map(|ext| ext.to_ascii_lowercase().contains("permessage-deflate"))
            .unwrap_or(false)
    }
}

/// Negotiated state of one leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    scheme: Scheme,
    host: String,
    port: u16,
    http_version: HttpVersion,
    websocket: Option<WebSocketOptions>,
}

impl ConnectionState {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            http_version: HttpVersion::Http1,
            websocket: None,
        }
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_http_version(mut self, http_version: HttpVersion) -> Self {
        self.http_version = http_version;
        self
    }

    pub fn with_websocket(mut self, options: WebSocketOptions) -> Self {
        self.websocket = Some(options);
        self
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn http_version(&self) -> HttpVersion {
        self.http_version
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket.is_some()
    }

    pub fn websocket(&self) -> Option<&WebSocketOptions> {
        self.websocket.as_ref()
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Destination of a proxied request, normalised from whatever form the client used
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl RequestTarget {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { scheme, host, port }
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// `localhost` or a loopback IP literal
    pub fn is_loopback(&self) -> bool {
        if self.host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        self.host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    /// Initial state for a leg talking to this target
    pub fn state(&self) -> ConnectionState {
        ConnectionState::new(self.scheme, self.host.clone(), self.port)
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Buffered reader with unbounded peek and push-back over any async stream
///
/// Reads drain the internal buffer before touching the inner stream; writes go
/// straight through.
pub struct PeekableStream<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> fmt::Debug for PeekableStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeekableStream")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Bytes read from the inner stream but not yet consumed
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` buffered bytes
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Push bytes back in front of whatever is buffered
    pub fn unread(&mut self, data: &[u8]) {
        let mut merged = BytesMut::with_capacity(data.len() + self.buf.len());
        merged.extend_from_slice(data);
        merged.extend_from_slice(&self.buf);
        self.buf = merged;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Read more bytes from the inner stream into the buffer
    ///
    /// Returns the number of bytes added; 0 means EOF.
    pub async fn fill_more(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Return at least `n` buffered bytes without consuming them
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            if self.fill_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before enough bytes were available",
                ));
            }
        }
        Ok(&self.buf[..])
    }

    /// Peek the first unread byte
    pub async fn peek_byte(&mut self) -> io::Result<u8> {
        Ok(self.peek(1).await?[0])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            out.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A leg: its single buffered reader plus its negotiated state
pub struct WrappedConnection {
    stream: PeekableStream<BoxedStream>,
    state: ConnectionState,
    peer: Option<SocketAddr>,
}

impl WrappedConnection {
    /// Wrap a fresh stream (nothing buffered yet)
    pub fn new<S>(io: S, state: ConnectionState) -> Self
    where
        S: AsyncStream + 'static,
    {
        let boxed: BoxedStream = Box::new(io);
        Self::from_stream(PeekableStream::new(boxed), state)
    }

    /// Wrap a stream that may already hold buffered bytes
    pub fn from_stream(stream: PeekableStream<BoxedStream>, state: ConnectionState) -> Self {
        Self {
            stream,
            state,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Replace the state with a more complete one learned before hand-off
    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut PeekableStream<BoxedStream> {
        &mut self.stream
    }

    pub async fn peek_byte(&mut self) -> io::Result<u8> {
        self.stream.peek_byte().await
    }

    pub fn into_parts(self) -> (PeekableStream<BoxedStream>, ConnectionState) {
        (self.stream, self.state)
    }
}

impl fmt::Debug for WrappedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedConnection")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("buffered", &self.stream.buffer().len())
            .finish()
    }
}

impl AsyncRead for WrappedConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, out)
    }
}

impl AsyncWrite for WrappedConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
