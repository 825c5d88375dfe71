//! MITM error types
//!
//! `MitmError` is the crate-level error returned by fallible operations.
//! `ResourceError` is the typed outcome handed to collaborators when a
//! resource fails; it is cheap to clone so it can be fanned out to every
//! subscriber.

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

    /// Certificate generation failed
    #[error("Failed to generate certificate for domain {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// Certificate parsing failed
    #[error("Failed to parse certificate: {0}")]
    CertParseFailed(String),

    /// TLS handshake failed
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid host
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// DNS resolution failed
    #[error("DNS lookup failed for {host}: {reason}")]
    DnsLookupFailed { host: String, reason: String },

    /// Upstream connection failed
    #[error("Upstream connection failed for {host}: {reason}")]
    UpstreamConnectionFailed { host: String, reason: String },

    /// Upstream proxy could not be acquired or dialed
    #[error("Upstream proxy error: {0}")]
    UpstreamProxy(String),

    /// Upstream proxy answered CONNECT with 407
    #[error("Upstream proxy {proxy} requires authentication: {challenge}")]
    UpstreamProxyAuth { proxy: String, challenge: String },

    /// HTTP/2 session error
    #[error("HTTP/2 error: {0}")]
    Http2(String),

    /// HTTP/1 relay error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Session closed or operation canceled
    #[error("Canceled: {0}")]
    Canceled(String),
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

    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create an upstream connection error
    pub fn upstream(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a DNS lookup error
    pub fn dns(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DnsLookupFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Map into the resource-level outcome a collaborator sees.
    pub fn to_resource_error(&self) -> ResourceError {
        match self {
            Self::CaGenerationFailed(_)
            | Self::CaLoadFailed(_)
            | Self::CertGenerationFailed { .. }
            | Self::CertParseFailed(_) => ResourceError::CertificateSigning(self.to_string()),
            Self::Http2(_) | Self::Http(_) => ResourceError::Protocol(self.to_string()),
            Self::Canceled(_) => ResourceError::Canceled,
            _ => ResourceError::Transport(self.to_string()),
        }
    }
}

/// Broad error class used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Socket connect, DNS and TLS failures
    Transport,
    /// Malformed frames, stream resets
    Protocol,
    /// Leaf signing failed for one handshake
    Certificate,
    /// Benign races between interception state and in-flight traffic
    Consistency,
}

/// Outcome attached to a `resource-failed` event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The socket carrying the resource closed or errored before completion
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Certificate signing failed: {0}")]
    CertificateSigning(String),

    /// The owning session closed while the resource was pending
    #[error("Request canceled")]
    Canceled,

    /// Interception refused to deliver the resource
    #[error("Blocked: {0}")]
    Blocked(String),
}

impl ResourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionClosed(_) | Self::Transport(_) => ErrorClass::Transport,
            Self::Protocol(_) | Self::Blocked(_) => ErrorClass::Protocol,
            Self::CertificateSigning(_) => ErrorClass::Certificate,
            Self::Canceled => ErrorClass::Consistency,
        }
    }
}

impl From<crate::mitm::storage::StorageError> for MitmError {
    fn from(e: crate::mitm::storage::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<crate::mitm::tls_config::TlsConfigError> for MitmError {
    fn from(e: crate::mitm::tls_config::TlsConfigError) -> Self {
        Self::TlsConfigFailed(e.to_string())
    }
}

impl From<crate::mitm::http2_mitm::H2Error> for MitmError {
    fn from(e: crate::mitm::http2_mitm::H2Error) -> Self {
        Self::Http2(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_error_maps_to_certificate_class() {
        let err = MitmError::cert_generation("example.org", "root CA unavailable");
        let resource_err = err.to_resource_error();

        assert_eq!(resource_err.class(), ErrorClass::Certificate);
        assert!(resource_err.to_string().contains("example.org"));
    }

    #[test]
    fn test_transport_errors() {
        let err = MitmError::upstream("example.org", "connection refused");
        assert_eq!(err.to_resource_error().class(), ErrorClass::Transport);

        let err = MitmError::dns("nope.invalid", "NXDOMAIN");
        assert_eq!(err.to_resource_error().class(), ErrorClass::Transport);
    }

    #[test]
    fn test_protocol_and_cancel() {
        let err = MitmError::Http2("stream reset".into());
        assert_eq!(err.to_resource_error().class(), ErrorClass::Protocol);

        let err = MitmError::Canceled("session closed".into());
        assert_eq!(err.to_resource_error(), ResourceError::Canceled);
    }
}
