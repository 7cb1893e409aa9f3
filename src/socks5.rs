//! SOCKS5 server handler
//!
//! VersionCheck → MethodNegotiation → (UsernamePasswordAuth) → AddressRequest
//! → Connect → Relay. Only CONNECT is served. Every failure is answered with a
//! well-formed reply before the connection closes.

use crate::auth::ProxyAuth;
use crate::conn::{PeekableStream, RequestTarget, Scheme, WrappedConnection};
use crate::dialer::DialError;
use crate::error::{ProxyError, Result};
use crate::session::SessionContext;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("Unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Unsupported authentication subnegotiation version {0:#04x}")]
    BadAuthVersion(u8),

    #[error("Username/password authentication failed")]
    AuthFailed,

    #[error("Unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Invalid domain name in request")]
    InvalidDomain,

    #[error("Handshake timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reply field of a SOCKS5 response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Reply for a failed connection stage
    pub fn for_error(error: &ProxyError) -> Self {
        match error {
            ProxyError::Dial(DialError::LoopDetected(_)) => ReplyCode::NotAllowed,
            ProxyError::Dial(e) if e.is_connection_refused() => ReplyCode::ConnectionRefused,
            ProxyError::Dial(DialError::Timeout(_))
            | ProxyError::Dial(DialError::Resolve { .. })
            | ProxyError::Dial(DialError::Connect { .. }) => ReplyCode::HostUnreachable,
            ProxyError::Socks(SocksError::UnsupportedCommand(_)) => ReplyCode::CommandNotSupported,
            ProxyError::Socks(SocksError::UnsupportedAddressType(_)) => {
                ReplyCode::AddressTypeNotSupported
            }
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// Fixed 10-byte reply with a zero IPv4 bound address
pub fn encode_reply(code: ReplyCode) -> [u8; 10] {
    [VERSION, code as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Destination address of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksAddr {
    pub fn target(&self) -> RequestTarget {
        match self {
            SocksAddr::Ip(addr) => RequestTarget::new(Scheme::Http, addr.ip().to_string(), addr.port()),
            SocksAddr::Domain(host, port) => RequestTarget::new(Scheme::Http, host.clone(), *port),
        }
    }
}

/// Parsed request (command already checked)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: u8,
    pub addr: SocksAddr,
}

/// Pick a method from the client's offer
///
/// Peers admitted without credentials get no-auth when offered; otherwise
/// username/password is required and must be configured.
pub fn choose_method(offered: &[u8], auth: &ProxyAuth, peer: IpAddr) -> Option<u8> {
    let no_auth = offered.contains(&METHOD_NO_AUTH);
    let user_pass = offered.contains(&METHOD_USER_PASS);

    if auth.admits_without_credentials(peer) {
        if no_auth {
            return Some(METHOD_NO_AUTH);
        }
        if user_pass {
            return Some(METHOD_USER_PASS);
        }
        return None;
    }

    if user_pass && auth.credentials().is_some() {
        Some(METHOD_USER_PASS)
    } else {
        None
    }
}

/// VersionCheck + MethodNegotiation (+ UsernamePasswordAuth)
pub async fn negotiate<S>(stream: &mut S, auth: &ProxyAuth, peer: IpAddr) -> std::result::Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(SocksError::BadVersion(version));
    }

    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    let method = match choose_method(&methods, auth, peer) {
        Some(method) => method,
        None => {
            stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
            return Err(SocksError::NoAcceptableMethod);
        }
    };
    stream.write_all(&[VERSION, method]).await?;

    if method == METHOD_USER_PASS {
        let auth_version = stream.read_u8().await?;
        if auth_version != AUTH_VERSION {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(SocksError::BadAuthVersion(auth_version));
        }

        let username = read_length_prefixed(stream).await?;
        let password = read_length_prefixed(stream).await?;

        let accepted = auth.admits_without_credentials(peer)
            || auth.authorize_socks(&username, &password).is_ok();
        if !accepted {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(SocksError::AuthFailed);
        }
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
    }

    Ok(())
}

/// AddressRequest; unsupported commands and address types get their reply
pub async fn read_request<S>(stream: &mut S) -> std::result::Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;

    if version != VERSION {
        return Err(SocksError::BadVersion(version));
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            SocksAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            SocksAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let raw = read_length_prefixed(stream).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(raw).map_err(|_| SocksError::InvalidDomain)?;
            if host.is_empty() {
                return Err(SocksError::InvalidDomain);
            }
            SocksAddr::Domain(host, port)
        }
        other => {
            stream
                .write_all(&encode_reply(ReplyCode::AddressTypeNotSupported))
                .await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    if command != CMD_CONNECT {
        stream
            .write_all(&encode_reply(ReplyCode::CommandNotSupported))
            .await?;
        return Err(SocksError::UnsupportedCommand(command));
    }

    Ok(SocksRequest { command, addr })
}

async fn read_length_prefixed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serve one SOCKS5 client through the shared session pipeline
pub async fn handle(
    mut client: WrappedConnection,
    peer: SocketAddr,
    session: &SessionContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let handshake = async {
        let stream: &mut PeekableStream<_> = client.stream_mut();
        negotiate(stream, &session.auth, peer.ip()).await?;
        read_request(stream).await
    };

    let request = tokio::select! {
        result = tokio::time::timeout(session.handshake_timeout, handshake) => {
            result.map_err(|_| SocksError::Timeout)??
        }
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
    };

    let target = request.addr.target();
    debug!(peer = %peer, target = %target, "SOCKS5 CONNECT");

    let server = match session.open(&target, None, peer, cancel).await {
        Ok(server) => server,
        Err(e) => {
            let _ = client
                .stream_mut()
                .write_all(&encode_reply(ReplyCode::for_error(&e)))
                .await;
            return Err(e);
        }
    };

    client
        .stream_mut()
        .write_all(&encode_reply(ReplyCode::Succeeded))
        .await?;

    let client = client.with_state(target.state());
    session.tunnel(client, server, cancel).await
}
