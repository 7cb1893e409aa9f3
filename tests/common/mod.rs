//! Shared fixtures: in-process origins, proxy startup and client helpers
#![allow(dead_code)]

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use relayscope::{Hooks, HttpVersion, ProxyConfig, ProxyServer};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const TIMEOUT: Duration = Duration::from_secs(10);

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ============================================================================
// Proxy
// ============================================================================

pub async fn start_proxy(config: ProxyConfig, hooks: Hooks) -> Arc<ProxyServer> {
    let server = Arc::new(
        ProxyServer::bind(config, hooks, None)
            .await
            .expect("proxy should bind"),
    );
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    server
}

pub fn open_config() -> ProxyConfig {
    ProxyConfig::new("127.0.0.1", 0).with_disable_verify(true)
}

/// Send CONNECT and consume the proxy's reply head
pub async fn connect_tunnel(
    proxy: SocketAddr,
    authority: &str,
    proxy_auth: Option<&str>,
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some(auth) = proxy_auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Read bytes up to and including the blank line
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

// ============================================================================
// Origins
// ============================================================================

/// Responds `hello <path>`, echoing POST bodies, and reports the version it saw
pub async fn origin_handler(
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let version = format!("{:?}", request.version());
    let path = request.uri().path().to_string();
    let is_post = request.method() == http::Method::POST;

    let body = request
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let body = if is_post {
        body
    } else {
        Bytes::from(format!("hello {}", path))
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("x-origin-version", version)
        .body(Full::new(body))
        .unwrap())
}

pub async fn serve_origin_connection<S>(io: S, version: HttpVersion)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(io);
    let _ = match version {
        HttpVersion::Http1 => hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service_fn(origin_handler))
            .await
            .map_err(|e| e.to_string()),
        HttpVersion::Http2 => hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service_fn(origin_handler))
            .await
            .map_err(|e| e.to_string()),
    };
}

/// Plaintext origin speaking exactly one HTTP version (h2 with prior knowledge)
pub async fn spawn_origin(version: HttpVersion) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_origin_connection(stream, version));
        }
    });
    addr
}

/// TLS origin for `localhost` offering `alpn`; serves whatever was negotiated
pub async fn spawn_tls_origin(alpn: &[&[u8]]) -> SocketAddr {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let chain = vec![CertificateDer::from(certified.cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let version = HttpVersion::from_alpn(tls.get_ref().1.alpn_protocol());
                    serve_origin_connection(tls, version).await;
                }
            });
        }
    });
    addr
}

/// Byte echo server counting accepted connections
pub async fn spawn_echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    (addr, accepted)
}

/// Origin that greets with a banner before reading, like SMTP or FTP
pub async fn spawn_banner_server(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if stream.write_all(banner).await.is_err() {
                    return;
                }
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// WebSocket origin echoing every data message back
pub async fn spawn_ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

// ============================================================================
// Clients
// ============================================================================

/// One request over `io` with the given HTTP version
pub async fn send_request<S>(
    io: S,
    version: HttpVersion,
    request: Request<Full<Bytes>>,
) -> (StatusCode, HeaderMap, Bytes)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(io);
    let response = match version {
        HttpVersion::Http1 => {
            let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await.unwrap();
            tokio::spawn(connection);
            sender.send_request(request).await.unwrap()
        }
        HttpVersion::Http2 => {
            let (mut sender, connection) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                    .await
                    .unwrap();
            tokio::spawn(connection);
            sender.send_request(request).await.unwrap()
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

pub fn get(uri: &str, version: HttpVersion, host: &str) -> Request<Full<Bytes>> {
    let builder = Request::get(uri);
    let builder = match version {
        HttpVersion::Http1 => builder.header(http::header::HOST, host),
        HttpVersion::Http2 => builder.version(http::Version::HTTP_2),
    };
    builder.body(Full::new(Bytes::new())).unwrap()
}

/// Client TLS config trusting only the given root
pub fn trusting_client_config(root_pem: &str, alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

pub async fn tls_connect<S>(
    stream: S,
    config: Arc<ClientConfig>,
    host: &str,
) -> tokio_rustls::client::TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(host.to_string()).unwrap();
    TlsConnector::from(config).connect(name, stream).await.unwrap()
}
