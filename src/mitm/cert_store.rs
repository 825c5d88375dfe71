//! Certificate Store
//!
//! Host-keyed store of forged leaf certificates, shared by every session.
//! Records live in memory and are persisted through a `CertificateStorage`
//! backend. A record within the renewal threshold of its expiry is treated
//! as absent so the caller regenerates it.

use crate::mitm::error::{MitmError, Result};
use crate::mitm::storage::{CertificateRow, NetworkDb, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default renewal threshold
pub const DEFAULT_RENEW_BEFORE_MINUTES: i64 = 60;

/// Durable backend for certificate records
#[async_trait]
pub trait CertificateStorage: Send + Sync {
    async fn load(&self, host: &str) -> std::result::Result<Option<CertificateRow>, StorageError>;

    async fn save(&self, row: &CertificateRow) -> std::result::Result<(), StorageError>;
}

#[async_trait]
impl CertificateStorage for NetworkDb {
    async fn load(&self, host: &str) -> std::result::Result<Option<CertificateRow>, StorageError> {
        self.get_certificate(host).await
    }

    async fn save(&self, row: &CertificateRow) -> std::result::Result<(), StorageError> {
        self.insert_certificate(row).await
    }
}

/// Forged certificate for one host
pub struct CertificateRecord {
    pub host: String,
    key_pem: SecretString,
    /// Leaf followed by issuer, PEM-encoded
    pub cert_pem: String,
    chain: Vec<CertificateDer<'static>>,
    pub expire_date: DateTime<Utc>,
}

impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("host", &self.host)
            .field("chain_len", &self.chain.len())
            .field("expire_date", &self.expire_date)
            .finish()
    }
}

impl CertificateRecord {
    pub fn new(
        host: impl Into<String>,
        key_pem: String,
        cert_pem: String,
        expire_date: DateTime<Utc>,
    ) -> Result<Self> {
        let host = host.into();
        let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MitmError::CertParseFailed(format!("{}: {}", host, e)))?;
        if chain.is_empty() {
            return Err(MitmError::CertParseFailed(format!(
                "{}: no certificate in PEM",
                host
            )));
        }

        Ok(Self {
            host,
            key_pem: SecretString::new(key_pem),
            cert_pem,
            chain,
            expire_date,
        })
    }

    fn from_row(row: CertificateRow) -> Result<Self> {
        let expire_date = Utc
            .timestamp_millis_opt(row.expire_date)
            .single()
            .ok_or_else(|| MitmError::CertParseFailed(format!("{}: bad expiry", row.host)))?;
        Self::new(row.host, row.key, row.pem, expire_date)
    }

    fn to_row(&self) -> CertificateRow {
        CertificateRow {
            host: self.host.clone(),
            key: self.key_pem.expose_secret().clone(),
            pem: self.cert_pem.clone(),
            expire_date: self.expire_date.timestamp_millis(),
        }
    }

    /// DER chain presented in the handshake
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    /// Leaf certificate DER
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn key_pem(&self) -> &str {
        self.key_pem.expose_secret()
    }

    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut self.key_pem.expose_secret().as_bytes())
            .map_err(|e| MitmError::CertParseFailed(format!("{}: {}", self.host, e)))?
            .ok_or_else(|| MitmError::CertParseFailed(format!("{}: no private key", self.host)))
    }

    /// True when less than `threshold` of validity remains at `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expire_date - now < threshold
    }
}

/// Shared, persisted certificate store
pub struct CertificateStore {
    records: Mutex<HashMap<String, Arc<CertificateRecord>>>,
    storage: Option<Arc<dyn CertificateStorage>>,
    renew_before: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CertificateStore {
    pub fn new(storage: Option<Arc<dyn CertificateStorage>>) -> Self {
        Self::with_renewal(storage, Duration::minutes(DEFAULT_RENEW_BEFORE_MINUTES))
    }

    pub fn with_renewal(storage: Option<Arc<dyn CertificateStorage>>, renew_before: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            storage,
            renew_before,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A valid record for `host`, or `None` if absent or due for renewal.
    pub async fn get(&self, host: &str) -> Option<Arc<CertificateRecord>> {
        let key = host.to_ascii_lowercase();
        let now = Utc::now();

        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.get(&key) {
                if !record.needs_renewal(now, self.renew_before) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(record));
                }
                debug!(host = %key, expire_date = %record.expire_date, "Certificate due for renewal");
                records.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let loaded = match &self.storage {
            Some(storage) => match storage.load(&key).await {
                Ok(row) => row,
                Err(e) => {
                    warn!(host = %key, error = %e, "Failed to load persisted certificate");
                    None
                }
            },
            None => None,
        };

        let record = loaded.and_then(|row| match CertificateRecord::from_row(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(host = %key, error = %e, "Discarding unreadable persisted certificate");
                None
            }
        });

        match record {
            Some(record) if !record.needs_renewal(now, self.renew_before) => {
                let record = Arc::new(record);
                let mut records = self.records.lock().await;
                let entry = records.entry(key).or_insert_with(|| Arc::clone(&record));
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Upsert into memory and persist. Persistence failures are logged; the
    /// in-memory record stays usable.
    pub async fn save(&self, record: CertificateRecord) -> Arc<CertificateRecord> {
        let key = record.host.to_ascii_lowercase();
        let row = record.to_row();
        let record = Arc::new(record);

        self.records
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&record));

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(&CertificateRow { host: key.clone(), ..row }).await {
                warn!(host = %key, error = %e, "Failed to persist certificate");
            }
        }

        record
    }

    /// Direct access to the backend, used for the root CA entry
    pub fn storage(&self) -> Option<&Arc<dyn CertificateStorage>> {
        self.storage.as_ref()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate (hits / total lookups)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
