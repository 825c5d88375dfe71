//! Certificate Authority - Dynamic certificate generation for MITM
//!
//! Owns the root CA and forges per-host leaf certificates on demand. Leaves
//! are cached and persisted through the shared `CertificateStore`; a leaf is
//! regenerated only once it nears expiry. Key generation and signing run on
//! the blocking pool so a handshake never stalls other connections.

use crate::mitm::cert_store::{CertificateRecord, CertificateStore};
use crate::mitm::error::{MitmError, Result};
use crate::mitm::storage::CertificateRow;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Storage key of the root CA row in the certificates table
pub const ROOT_CA_KEY: &str = "[root-ca]";

/// Certificate Authority configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Organization name on root and leaves
    pub organization: String,

    /// Root CA common name
    pub common_name: String,

    /// Country code
    pub country: String,

    /// Root validity in days
    pub root_validity_days: i64,

    /// Leaf validity in days
    pub leaf_validity_days: i64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            organization: "Session MITM".to_string(),
            common_name: "Session MITM Root CA".to_string(),
            country: "US".to_string(),
            root_validity_days: 3650,
            leaf_validity_days: 365,
        }
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Keep the serial positive
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| MitmError::ca_generation(format!("Invalid validity date: {}", e)))
}

/// A signed leaf, ready to be stored
pub struct ForgedLeaf {
    pub key_pem: String,
    /// Leaf followed by the root, PEM-encoded
    pub chain_pem: String,
    pub not_after: DateTime<Utc>,
}

/// Root CA key and certificate
pub struct RootCa {
    cert: Certificate,
    key: KeyPair,
    /// PEM presented to browsers (as generated or as loaded)
    cert_pem: String,
    not_after: DateTime<Utc>,
}

impl RootCa {
    /// Generate a new self-signed root
    pub fn generate(config: &CaConfig) -> Result<Self> {
        info!("Generating CA certificate and private key");

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::OrganizationName, config.organization.clone());
        params
            .distinguished_name
            .push(DnType::CommonName, config.common_name.clone());
        params
            .distinguished_name
            .push(DnType::CountryName, config.country.clone());

        let now = Utc::now();
        let not_after = now + chrono::Duration::days(config.root_validity_days);
        params.not_before = to_offset(now - chrono::Duration::days(1))?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(random_serial());
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| MitmError::ca_generation(format!("Failed to self-sign certificate: {}", e)))?;
        let cert_pem = cert.pem();

        Ok(Self {
            cert,
            key,
            cert_pem,
            not_after,
        })
    }

    /// Load an existing root from PEM key and certificate
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse CA certificate: {}", e)))?;
        let not_after = DateTime::<Utc>::from_timestamp(params.not_after.unix_timestamp(), 0)
            .ok_or_else(|| MitmError::ca_load("CA certificate has an invalid expiry"))?;
        // Rebuild an issuer handle; leaves chain to the PEM as loaded.
        let cert = params
            .self_signed(&key)
            .map_err(|e| MitmError::ca_load(format!("Failed to rebuild CA issuer: {}", e)))?;

        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
            not_after,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Generate a key and sign a leaf for `host`. CPU-bound.
    pub fn sign_leaf(&self, host: &str, config: &CaConfig) -> Result<ForgedLeaf> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| MitmError::cert_generation(host, e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());
        params
            .distinguished_name
            .push(DnType::OrganizationName, config.organization.clone());
        params
            .distinguished_name
            .push(DnType::CountryName, config.country.clone());

        let now = Utc::now();
        let not_after = now + chrono::Duration::days(config.leaf_validity_days);
        params.not_before = to_offset(now - chrono::Duration::days(1))?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(random_serial());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let key = KeyPair::generate().map_err(|e| MitmError::cert_generation(host, e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| MitmError::cert_generation(host, e.to_string()))?;

        Ok(ForgedLeaf {
            key_pem: key.serialize_pem(),
            chain_pem: format!("{}{}", cert.pem(), self.cert_pem),
            not_after,
        })
    }
}

/// Certificate Authority - forges and caches leaf certificates
pub struct CertificateAuthority {
    root: Arc<RootCa>,
    store: Arc<CertificateStore>,
    config: CaConfig,
    /// Per-host generation locks so concurrent handshakes share one key
    generating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertificateAuthority {
    pub fn new(root: RootCa, store: Arc<CertificateStore>, config: CaConfig) -> Self {
        Self {
            root: Arc::new(root),
            store,
            config,
            generating: Mutex::new(HashMap::new()),
        }
    }

    /// Load the root CA from the store's backend, or generate and persist one.
    pub async fn load_or_create(store: Arc<CertificateStore>, config: CaConfig) -> Result<Self> {
        let Some(storage) = store.storage().cloned() else {
            let root = RootCa::generate(&config)?;
            return Ok(Self::new(root, store, config));
        };

        if let Some(row) = storage.load(ROOT_CA_KEY).await? {
            info!("Loading existing CA from certificate storage");
            let root = RootCa::from_pem(&row.pem, &row.key)?;
            if root.not_after() > Utc::now() {
                return Ok(Self::new(root, store, config));
            }
            warn!(not_after = %root.not_after(), "Stored CA expired, generating a new one");
        }

        let root = RootCa::generate(&config)?;
        storage
            .save(&CertificateRow {
                host: ROOT_CA_KEY.to_string(),
                key: root.key_pem(),
                pem: root.cert_pem().to_string(),
                expire_date: root.not_after().timestamp_millis(),
            })
            .await?;
        info!("CA certificate generated and persisted");

        Ok(Self::new(root, store, config))
    }

    /// Root certificate PEM, for installing into the browser trust store
    pub fn root_cert_pem(&self) -> &str {
        self.root.cert_pem()
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Cached leaf for `host`, forging one if absent or near expiry.
    pub async fn get_or_generate(&self, host: &str) -> Result<Arc<CertificateRecord>> {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return Err(MitmError::InvalidHost("empty host".to_string()));
        }

        if let Some(record) = self.store.get(&host).await {
            debug!(host = %host, "Certificate cache hit");
            return Ok(record);
        }

        let lock = {
            let mut generating = self.generating.lock().await;
            Arc::clone(generating.entry(host.clone()).or_default())
        };
        let _guard = lock.lock().await;

        // Another handshake may have finished generating while we waited.
        if let Some(record) = self.store.get(&host).await {
            return Ok(record);
        }

        debug!(host = %host, "Generating new certificate");
        let root = Arc::clone(&self.root);
        let config = self.config.clone();
        let leaf_host = host.clone();
        let leaf = tokio::task::spawn_blocking(move || root.sign_leaf(&leaf_host, &config))
            .await
            .map_err(|e| MitmError::cert_generation(&host, e.to_string()))??;

        let record = CertificateRecord::new(&host, leaf.key_pem, leaf.chain_pem, leaf.not_after)?;
        let record = self.store.save(record).await;

        self.generating.lock().await.remove(&host);
        Ok(record)
    }
}
