//! TLS Configuration for both legs of an intercepted connection
//!
//! - Browser-facing: the proxy is the server, presenting a forged leaf. ALPN
//!   advertises exactly the protocol the origin selected.
//! - Origin-facing: the proxy is the client, offering the browser's own
//!   ALPN list. Upstream verification uses the webpki roots unless disabled.

use crate::mitm::cert_store::CertificateRecord;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersion {
    fn versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls12And13 => vec![&TLS12, &TLS13],
            TlsVersion::Tls13Only => vec![&TLS13],
        }
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Keep only the protocols the relay speaks, in the browser's order.
pub fn supported_alpn(offered: &[Vec<u8>]) -> Vec<Vec<u8>> {
    offered
        .iter()
        .filter(|p| p.as_slice() == ALPN_H2 || p.as_slice() == ALPN_HTTP11)
        .cloned()
        .collect()
}

/// Browser-facing TLS config (proxy acts as server with forged cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        alpn: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&TlsVersion::default().versions())
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

        config.alpn_protocols = alpn;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Server config presenting `record`, advertising `alpn` only
    pub fn from_record(
        record: &CertificateRecord,
        alpn: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        let key = record
            .private_key()
            .map_err(|e| TlsConfigError::InvalidPrivateKey(e.to_string()))?;
        Self::new(record.chain(), key, alpn)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Origin-facing TLS config
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
    verify: bool,
}

impl UpstreamTlsConfig {
    /// Verify origins against the webpki roots
    pub fn new() -> Result<Self, TlsConfigError> {
        Self::new_with_options(TlsVersion::default(), true)
    }

    pub fn new_with_options(tls_version: TlsVersion, verify: bool) -> Result<Self, TlsConfigError> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&tls_version.versions())
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        let config = if verify {
            let mut root_store = RootCertStore::empty();
            root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier { provider }))
                .with_no_client_auth()
        };

        debug!(tls_version = ?tls_version, verify, "Upstream TLS config created");

        Ok(Self {
            config: Arc::new(config),
            verify,
        })
    }

    /// Client config offering `alpn`
    pub fn client_config(&self, alpn: Vec<Vec<u8>>) -> Arc<ClientConfig> {
        let mut config = (*self.config).clone();
        config.alpn_protocols = alpn;
        Arc::new(config)
    }

    pub fn verifies_certificates(&self) -> bool {
        self.verify
    }
}

/// Accepts any origin certificate; used when upstream verification is off.
#[derive(Debug)]
struct NoCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253
    }
}
