//! HTTP proxy handler tests: CONNECT relay, plain forwarding, admission,
//! routing-loop rejection and listener TLS

mod common;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use common::*;
use relayscope::{HttpVersion, ProxyConfig};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
}

// ============================================================================
// CONNECT
// ============================================================================

#[tokio::test]
async fn test_connect_relays_bytes() {
    let (echo, accepted) = spawn_echo_server().await;
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;

    let (mut stream, head) =
        connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", echo.port()), None).await;
    assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");

    // A TLS-looking first byte is relayed untouched when no hooks are set
    let payload = [0x16, 0x03, 0x01, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
    stream.write_all(&payload).await.unwrap();
    let mut echoed = [0u8; 10];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_relays_server_first_greeting() {
    let origin = spawn_banner_server(b"220 ready\r\n").await;
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;

    let (mut stream, head) =
        connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", origin.port()), None).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    // The client sends nothing until it has the greeting
    let mut banner = [0u8; 11];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut banner))
        .await
        .expect("greeting was not relayed")
        .unwrap();
    assert_eq!(&banner, b"220 ready\r\n");

    stream.write_all(b"HELO x\r\n").await.unwrap();
    let mut echoed = [0u8; 8];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"HELO x\r\n");
}

#[tokio::test]
async fn test_connect_echoes_http10_proto() {
    let (echo, _) = spawn_echo_server().await;
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.0\r\n\r\n", echo.port());
    stream.write_all(request.as_bytes()).await.unwrap();
    assert!(read_head(&mut stream).await.starts_with("HTTP/1.0 200"));
}

#[tokio::test]
async fn test_connect_to_closed_port_gets_502() {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;

    let (_, head) =
        connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", closed.port()), None).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{}", head);
}

// ============================================================================
// Plain HTTP forwarding
// ============================================================================

#[tokio::test]
async fn test_absolute_form_get_forwarded_in_origin_form() {
    let origin = spawn_origin(HttpVersion::Http1).await;
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/plain?x=1 HTTP/1.1\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
        origin.port()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("hello /plain"), "{}", response);
}

#[tokio::test]
async fn test_plain_get_with_capture_is_decoded() {
    let origin = spawn_origin(HttpVersion::Http1).await;
    let proxy = start_proxy(open_config().with_capture(true), relayscope::Hooks::new()).await;

    let stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let host = format!("127.0.0.1:{}", origin.port());
    let (status, _, body) = send_request(
        stream,
        HttpVersion::Http1,
        get(&format!("http://{}/captured", host), HttpVersion::Http1, &host),
    )
    .await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"hello /captured"));
}

#[tokio::test]
async fn test_https_without_connect_rejected() {
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    stream
        .write_all(b"GET https://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    assert!(read_head(&mut stream).await.starts_with("HTTP/1.1 400"));
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_no_credentials_gets_407_without_dialing() {
    let (echo, accepted) = spawn_echo_server().await;
    let proxy = start_proxy(
        ProxyConfig::new("127.0.0.1", 0).with_credentials("user", "pass"),
        relayscope::Hooks::new(),
    )
    .await;

    let (_, head) = connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", echo.port()), None).await;
    assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
    assert!(head.contains("Proxy-Authenticate: Basic"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0, "no upstream connection may be opened");
}

#[tokio::test]
async fn test_wrong_credentials_get_407() {
    let (echo, accepted) = spawn_echo_server().await;
    let proxy = start_proxy(
        ProxyConfig::new("127.0.0.1", 0).with_credentials("user", "pass"),
        relayscope::Hooks::new(),
    )
    .await;

    let auth = basic("user", "wrong");
    let (_, head) =
        connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", echo.port()), Some(&auth)).await;
    assert!(head.starts_with("HTTP/1.1 407"));
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_correct_credentials_from_non_whitelisted_peer() {
    let (echo, _) = spawn_echo_server().await;
    let proxy = start_proxy(
        ProxyConfig::new("127.0.0.1", 0)
            .with_credentials("user", "pass")
            .with_whitelist(["10.9.9.9".parse().unwrap()]),
        relayscope::Hooks::new(),
    )
    .await;

    let auth = basic("user", "pass");
    let (_, head) =
        connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", echo.port()), Some(&auth)).await;
    assert!(head.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_whitelisted_peer_needs_no_credentials() {
    let (echo, _) = spawn_echo_server().await;
    let proxy = start_proxy(
        ProxyConfig::new("127.0.0.1", 0)
            .with_credentials("user", "pass")
            .with_whitelist(["127.0.0.1".parse().unwrap()]),
        relayscope::Hooks::new(),
    )
    .await;

    let (_, head) = connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", echo.port()), None).await;
    assert!(head.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_no_credentials_configured_rejects_unlisted_peer() {
    let (echo, _) = spawn_echo_server().await;
    let proxy = start_proxy(ProxyConfig::new("127.0.0.1", 0), relayscope::Hooks::new()).await;

    let (_, head) = connect_tunnel(proxy.local_addr(), &format!("127.0.0.1:{}", echo.port()), None).await;
    assert!(head.starts_with("HTTP/1.1 407"));
}

// ============================================================================
// Routing loop
// ============================================================================

#[tokio::test]
async fn test_request_to_own_port_rejected_before_dial() {
    let proxy = start_proxy(open_config(), relayscope::Hooks::new()).await;
    let port = proxy.local_addr().port();

    for host in ["127.0.0.1", "localhost"] {
        let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
        let request = format!("GET http://{}:{}/ HTTP/1.1\r\n\r\n", host, port);
        stream.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 502"), "{}: {}", host, head);
    }

    // Only the two client connections were ever accepted
    assert_eq!(proxy.stats().accepted, 2);
}

// ============================================================================
// Listener TLS
// ============================================================================

#[tokio::test]
async fn test_https_proxy_listener() {
    let (echo, _) = spawn_echo_server().await;
    let proxy = start_proxy(
        open_config().with_server_name("localhost"),
        relayscope::Hooks::new(),
    )
    .await;
    let root = proxy.root_cert_pem().unwrap();

    let tcp = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let mut tls = tls_connect(tcp, trusting_client_config(&root, &[b"http/1.1"]), "localhost").await;

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port());
    tls.write_all(request.as_bytes()).await.unwrap();
    assert!(read_head(&mut tls).await.starts_with("HTTP/1.1 200"));

    tls.write_all(b"inside tls").await.unwrap();
    let mut echoed = [0u8; 10];
    tokio::time::timeout(TIMEOUT, tls.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"inside tls");
}

#[tokio::test]
async fn test_passthrough_mode() {
    let (echo, accepted) = spawn_echo_server().await;
    let proxy = start_proxy(
        open_config().with_passthrough(format!("127.0.0.1:{}", echo.port())),
        relayscope::Hooks::new(),
    )
    .await;

    let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
    stream.write_all(b"\x05not a proxy protocol").await.unwrap();
    let mut echoed = [0u8; 21];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"\x05not a proxy protocol");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}
