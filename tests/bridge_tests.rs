//! Protocol Bridge tests
//!
//! Every (client version, server version) pair bridged over plaintext legs,
//! compared against a direct request to the same origin.

mod common;

use bytes::Bytes;
use common::*;
use http::{Request, Response};
use http_body_util::Full;
use relayscope::bridge;
use relayscope::mitm::Http2Config;
use relayscope::{ConnectionState, Hooks, HttpVersion, RequestInspector, Scheme, WrappedConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CountingInspector {
    requests: AtomicUsize,
    responses: AtomicUsize,
}

impl RequestInspector for CountingInspector {
    fn on_request(&self, _request: &mut Request<Bytes>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn on_response(&self, _request: &Request<Bytes>, response: &mut Response<Bytes>) {
        self.responses.fetch_add(1, Ordering::SeqCst);
        response
            .headers_mut()
            .insert("x-inspected", http::HeaderValue::from_static("1"));
    }
}

/// Bridge an in-memory client leg to `origin`, returning the client's end
async fn bridged_client(
    origin: SocketAddr,
    client_version: HttpVersion,
    server_version: HttpVersion,
    hooks: Hooks,
    cancel: CancellationToken,
) -> tokio::io::DuplexStream {
    let (client_app, client_proxy) = tokio::io::duplex(64 * 1024);
    let server = TcpStream::connect(origin).await.unwrap();

    let state = ConnectionState::new(Scheme::Http, "127.0.0.1", origin.port());
    let client = WrappedConnection::new(client_proxy, state.clone().with_http_version(client_version));
    let server = WrappedConnection::new(server, state.with_http_version(server_version));

    tokio::spawn(async move {
        let _ = bridge::run(client, server, &hooks, &Http2Config::default(), &cancel).await;
    });
    client_app
}

async fn assert_bridged_get(client_version: HttpVersion, server_version: HttpVersion) {
    let origin = spawn_origin(server_version).await;
    let host = format!("127.0.0.1:{}", origin.port());
    let uri = format!("http://{}/combo", host);

    // Direct baseline
    let direct = TcpStream::connect(origin).await.unwrap();
    let (direct_status, _, direct_body) =
        send_request(direct, server_version, get(&uri, server_version, &host)).await;

    let inspector = Arc::new(CountingInspector::default());
    let hooks = Hooks::new().with_request_inspector(inspector.clone());
    let cancel = CancellationToken::new();
    let client = bridged_client(origin, client_version, server_version, hooks, cancel.clone()).await;

    let (status, headers, body) = tokio::time::timeout(
        TIMEOUT,
        send_request(client, client_version, get(&uri, client_version, &host)),
    )
    .await
    .expect("bridged request timed out");

    assert_eq!(status, direct_status, "{:?} -> {:?}", client_version, server_version);
    assert_eq!(body, direct_body, "{:?} -> {:?}", client_version, server_version);
    assert_eq!(headers.get("x-inspected").unwrap(), "1");

    let expected_origin = match server_version {
        HttpVersion::Http1 => "HTTP/1.1",
        HttpVersion::Http2 => "HTTP/2.0",
    };
    assert_eq!(headers.get("x-origin-version").unwrap(), expected_origin);
    assert_eq!(inspector.requests.load(Ordering::SeqCst), 1);
    assert_eq!(inspector.responses.load(Ordering::SeqCst), 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_h1_client_h1_server() {
    assert_bridged_get(HttpVersion::Http1, HttpVersion::Http1).await;
}

#[tokio::test]
async fn test_h1_client_h2_server() {
    assert_bridged_get(HttpVersion::Http1, HttpVersion::Http2).await;
}

#[tokio::test]
async fn test_h2_client_h1_server() {
    assert_bridged_get(HttpVersion::Http2, HttpVersion::Http1).await;
}

#[tokio::test]
async fn test_h2_client_h2_server() {
    assert_bridged_get(HttpVersion::Http2, HttpVersion::Http2).await;
}

#[tokio::test]
async fn test_h2_client_streams_serialized_to_h1_server() {
    let origin = spawn_origin(HttpVersion::Http1).await;
    let host = format!("127.0.0.1:{}", origin.port());
    let cancel = CancellationToken::new();
    let hooks = Hooks::new().with_capture(true);
    let client = bridged_client(origin, HttpVersion::Http2, HttpVersion::Http1, hooks, cancel.clone()).await;

    let (sender, connection) = hyper::client::conn::http2::handshake(
        hyper_util::rt::TokioExecutor::new(),
        hyper_util::rt::TokioIo::new(client),
    )
    .await
    .unwrap();
    tokio::spawn(connection);

    let mut responses = Vec::new();
    for i in 0..4 {
        let uri = format!("http://{}/stream/{}", host, i);
        let request = Request::get(uri)
            .version(http::Version::HTTP_2)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let mut sender = sender.clone();
        responses.push(async move { sender.send_request(request).await });
    }

    for (i, response) in futures_util::future::join_all(responses).await.into_iter().enumerate() {
        let response = response.unwrap();
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(body, Bytes::from(format!("hello /stream/{}", i)));
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_post_body_survives_translation() {
    let origin = spawn_origin(HttpVersion::Http2).await;
    let host = format!("127.0.0.1:{}", origin.port());
    let cancel = CancellationToken::new();
    let hooks = Hooks::new().with_capture(true);
    let client = bridged_client(origin, HttpVersion::Http1, HttpVersion::Http2, hooks, cancel.clone()).await;

    let request = Request::post(format!("http://{}/upload", host))
        .header(http::header::HOST, host.as_str())
        .body(Full::new(Bytes::from_static(b"payload bytes")))
        .unwrap();
    let (status, _, body) = send_request(client, HttpVersion::Http1, request).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"payload bytes"));
    cancel.cancel();
}

#[tokio::test]
async fn test_raw_copy_without_hooks() {
    let origin = spawn_origin(HttpVersion::Http1).await;
    let host = format!("127.0.0.1:{}", origin.port());
    let cancel = CancellationToken::new();
    let client = bridged_client(origin, HttpVersion::Http1, HttpVersion::Http1, Hooks::new(), cancel.clone()).await;

    let (status, headers, body) = send_request(
        client,
        HttpVersion::Http1,
        get(&format!("http://{}/raw", host), HttpVersion::Http1, &host),
    )
    .await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"hello /raw"));
    assert!(headers.get("x-inspected").is_none());
    cancel.cancel();
}
