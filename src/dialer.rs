//! Leg dialing
//!
//! Opens the destination-facing leg, either directly or through a chained
//! HTTP (CONNECT) or SOCKS5 upstream. The returned stream is positioned at the
//! first byte of the destination's traffic; anything an upstream sent past its
//! CONNECT reply stays buffered in it.

use crate::conn::{BoxedStream, PeekableStream, RequestTarget};
use crate::http_head::read_response_head;
use crate::upstream::{UpstreamDescriptor, UpstreamScheme};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("Routing loop: {0} points back at this proxy")]
    LoopDetected(String),

    #[error("Failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("Connection to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("Dial to {0} timed out")]
    Timeout(String),

    #[error("Upstream proxy {upstream} answered CONNECT {target} with status {status}")]
    UpstreamRejected {
        upstream: String,
        target: String,
        status: u16,
    },

    #[error("Upstream proxy handshake failed: {0}")]
    UpstreamHandshake(String),

    #[error("SOCKS5 upstream error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("Dial cancelled")]
    Cancelled,
}

impl DialError {
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, DialError::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused)
    }
}

/// Dial settings shared by every connection task
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    local_addr: Option<IpAddr>,
    listen_port: Option<u16>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            local_addr: None,
            listen_port: None,
        }
    }
}

impl Dialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Default::default()
        }
    }

    /// Bind outbound sockets to this local address
    pub fn with_local_addr(mut self, local_addr: Option<IpAddr>) -> Self {
        self.local_addr = local_addr;
        self
    }

    /// The proxy's own listening port, used for loop detection
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Reject loopback targets on our own listening port
    pub fn check_loop(&self, target: &RequestTarget) -> Result<(), DialError> {
        match self.listen_port {
            Some(port) if target.port == port && target.is_loopback() => {
                Err(DialError::LoopDetected(target.authority()))
            }
            _ => Ok(()),
        }
    }

    /// Open the destination leg for `target`, optionally through `upstream`
    pub async fn connect(
        &self,
        target: &RequestTarget,
        upstream: Option<&UpstreamDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<PeekableStream<BoxedStream>, DialError> {
        self.check_loop(target)?;

        let dial = async {
            match upstream {
                None => {
                    let tcp = self.tcp_connect(&target.host, target.port).await?;
                    let boxed: BoxedStream = Box::new(tcp);
                    Ok(PeekableStream::new(boxed))
                }
                Some(up) if up.scheme == UpstreamScheme::Http => {
                    self.connect_via_http(target, up).await
                }
                Some(up) => self.connect_via_socks5(target, up).await,
            }
        };

        tokio::select! {
            result = tokio::time::timeout(self.connect_timeout, dial) => {
                result.map_err(|_| DialError::Timeout(target.authority()))?
            }
            _ = cancel.cancelled() => Err(DialError::Cancelled),
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|source| DialError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "TCP connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(DialError::Connect {
            addr: crate::conn::format_authority(host, port),
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")),
        })
    }

    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let local = match self.local_addr {
            Some(local) => local,
            None => return TcpStream::connect(addr).await,
        };

        if local.is_ipv4() != addr.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("local address {} cannot reach {}", local, addr),
            ));
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(local, 0))?;
        socket.connect(addr).await
    }

    async fn connect_via_http(
        &self,
        target: &RequestTarget,
        upstream: &UpstreamDescriptor,
    ) -> Result<PeekableStream<BoxedStream>, DialError> {
        let tcp = self.tcp_connect(&upstream.host, upstream.port).await?;
        let boxed: BoxedStream = Box::new(tcp);
        let mut stream = PeekableStream::new(boxed);

        let request = connect_request(target, upstream);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|source| DialError::Connect {
                addr: upstream.address(),
                source,
            })?;

        let head = read_response_head(&mut stream)
            .await
            .map_err(|e| DialError::UpstreamHandshake(e.to_string()))?;

        if !head.status.is_success() {
            return Err(DialError::UpstreamRejected {
                upstream: upstream.address(),
                target: target.authority(),
                status: head.status.as_u16(),
            });
        }

        debug!(upstream = %upstream, target = %target, "HTTP upstream tunnel established");
        Ok(stream)
    }

    async fn connect_via_socks5(
        &self,
        target: &RequestTarget,
        upstream: &UpstreamDescriptor,
    ) -> Result<PeekableStream<BoxedStream>, DialError> {
        let tcp = self.tcp_connect(&upstream.host, upstream.port).await?;
        let dest = (target.host.as_str(), target.port);

        let socks = match &upstream.credentials {
            Some(c) => {
                Socks5Stream::connect_with_password_and_socket(tcp, dest, &c.username, &c.password)
                    .await?
            }
            None => Socks5Stream::connect_with_socket(tcp, dest).await?,
        };

        debug!(upstream = %upstream, target = %target, "SOCKS5 upstream tunnel established");
        let boxed: BoxedStream = Box::new(socks.into_inner());
        Ok(PeekableStream::new(boxed))
    }
}

/// CONNECT request sent to an HTTP upstream
pub fn connect_request(target: &RequestTarget, upstream: &UpstreamDescriptor) -> String {
    let authority = target.authority();
    let mut request = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n",
        authority
    );
    if let Some(credentials) = &upstream.credentials {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&credentials.basic_header_value());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Scheme;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_loop_detection() {
        let dialer = Dialer::default().with_listen_port(8080);

        for host in ["127.0.0.1", "localhost", "::1"] {
            let target = RequestTarget::new(Scheme::Http, host, 8080);
            assert!(matches!(
                dialer.check_loop(&target),
                Err(DialError::LoopDetected(_))
            ));
        }

        let other_port = RequestTarget::new(Scheme::Http, "127.0.0.1", 9090);
        assert!(dialer.check_loop(&other_port).is_ok());
        let remote = RequestTarget::new(Scheme::Http, "example.com", 8080);
        assert!(dialer.check_loop(&remote).is_ok());
    }

    #[test]
    fn test_connect_request_with_credentials() {
        let target = RequestTarget::new(Scheme::Https, "example.com", 443);
        let upstream = UpstreamDescriptor::parse("http://u:p@proxy:3128").unwrap();
        let request = connect_request(&target, &upstream);

        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let target = RequestTarget::new(Scheme::Http, "127.0.0.1", port);
        let mut stream = Dialer::default()
            .connect(&target, None, &CancellationToken::new())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = RequestTarget::new(Scheme::Http, "127.0.0.1", port);
        let err = Dialer::default()
            .connect(&target, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_connection_refused(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_cancelled_dial() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // 192.0.2.0/24 is TEST-NET-1; the dial never completes on its own
        let target = RequestTarget::new(Scheme::Http, "192.0.2.1", 80);
        let err = Dialer::default()
            .connect(&target, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Cancelled | DialError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_http_upstream_keeps_trailing_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.starts_with("CONNECT example.com:443 HTTP/1.1"));
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\nEARLY")
                .await
                .unwrap();
        });

        let upstream = UpstreamDescriptor::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let target = RequestTarget::new(Scheme::Https, "example.com", 443);
        let mut stream = Dialer::default()
            .connect(&target, Some(&upstream), &CancellationToken::new())
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"EARLY");
    }

    #[tokio::test]
    async fn test_http_upstream_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let upstream = UpstreamDescriptor::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let target = RequestTarget::new(Scheme::Http, "example.com", 80);
        let err = Dialer::default()
            .connect(&target, Some(&upstream), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::UpstreamRejected { status: 403, .. }));
    }
}
