//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate loading failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf certificate generation failed
    #[error("Failed to forge certificate for {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// Certificate parsing failed
    #[error("Failed to parse certificate: {0}")]
    CertParseFailed(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// Invalid hostname for certificate or SNI
    #[error("Invalid hostname: {0}")]
    InvalidHost(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            reason: msg.into(),
        }
    }

    /// Create a TLS configuration error
    pub fn tls_config(msg: impl Into<String>) -> Self {
        Self::TlsConfigFailed(msg.into())
    }
}
