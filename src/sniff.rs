//! Protocol sniffing
//!
//! One byte decides how an accepted connection is handled. The classification
//! is made once and carried as a [`ConnectionKind`] for the rest of the pipeline.

use crate::conn::PeekableStream;
use std::io;
use tokio::io::AsyncRead;

/// SOCKS protocol version 5
pub const SOCKS5_VERSION: u8 = 0x05;

/// TLS record content type for a handshake (first byte of a ClientHello)
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// What an accepted connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// SOCKS5 greeting
    Socks5,
    /// HTTP proxy protocol, possibly wrapped in TLS
    HttpProxy,
}

impl ConnectionKind {
    pub fn classify(first_byte: u8) -> Self {
        if first_byte == SOCKS5_VERSION {
            ConnectionKind::Socks5
        } else {
            ConnectionKind::HttpProxy
        }
    }
}

/// True when the byte opens a TLS handshake record
pub fn is_tls_handshake(first_byte: u8) -> bool {
    first_byte == TLS_HANDSHAKE_RECORD
}

/// Peek one byte (without consuming it) and classify the connection
pub async fn sniff<S>(stream: &mut PeekableStream<S>) -> io::Result<ConnectionKind>
where
    S: AsyncRead + Unpin,
{
    let first = stream.peek_byte().await?;
    Ok(ConnectionKind::classify(first))
}
