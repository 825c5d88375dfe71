//! Integration tests for the certificate authority and certificate store
//!
//! These tests verify:
//! - Root CA persistence across process restarts
//! - Leaf forging, in-memory sharing and reload from the network database
//! - Renewal of leaves close to expiry
//! - A browser-side TLS handshake against a forged leaf

use chrono::Duration;
use rustls::pki_types::ServerName;
use session_mitm::mitm::certificate_authority::ROOT_CA_KEY;
use session_mitm::mitm::tls_config::{ALPN_H2, ALPN_HTTP11};
use session_mitm::mitm::{
    CaConfig, CertificateAuthority, CertificateStorage, CertificateStore, ClientTlsConfig,
    NetworkDb,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

// ============================================================================
// Helpers
// ============================================================================

async fn create_network_db() -> (Arc<NetworkDb>, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("network.db");
    let db = NetworkDb::new(path.to_str().unwrap()).await.unwrap();
    (Arc::new(db), dir)
}

fn store_on(db: &Arc<NetworkDb>) -> Arc<CertificateStore> {
    let storage: Arc<dyn CertificateStorage> = db.clone();
    Arc::new(CertificateStore::new(Some(storage)))
}

fn browser_connector(root_pem: &str, alpn: Vec<Vec<u8>>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = alpn;

    TlsConnector::from(Arc::new(config))
}

// ============================================================================
// Root CA
// ============================================================================

#[tokio::test]
async fn test_root_ca_persists_across_restarts() {
    let (db, _dir) = create_network_db().await;

    let first = CertificateAuthority::load_or_create(store_on(&db), CaConfig::default())
        .await
        .unwrap();
    let row = db.get_certificate(ROOT_CA_KEY).await.unwrap().unwrap();
    assert_eq!(row.pem, first.root_cert_pem());

    // A second process start reads the same root
    let second = CertificateAuthority::load_or_create(store_on(&db), CaConfig::default())
        .await
        .unwrap();
    assert_eq!(second.root_cert_pem(), first.root_cert_pem());
}

#[tokio::test]
async fn test_root_ca_without_storage_is_ephemeral() {
    let a = CertificateAuthority::load_or_create(
        Arc::new(CertificateStore::new(None)),
        CaConfig::default(),
    )
    .await
    .unwrap();
    let b = CertificateAuthority::load_or_create(
        Arc::new(CertificateStore::new(None)),
        CaConfig::default(),
    )
    .await
    .unwrap();

    assert_ne!(a.root_cert_pem(), b.root_cert_pem());
}

// ============================================================================
// Leaf certificates
// ============================================================================

#[tokio::test]
async fn test_leaf_shared_and_persisted() {
    let (db, _dir) = create_network_db().await;
    let ca = CertificateAuthority::load_or_create(store_on(&db), CaConfig::default())
        .await
        .unwrap();

    let first = ca.get_or_generate("example.org").await.unwrap();
    let second = ca.get_or_generate("EXAMPLE.org").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ca.store().len().await, 1);

    let row = db.get_certificate("example.org").await.unwrap().unwrap();
    assert_eq!(row.pem, first.cert_pem);
    assert_eq!(row.expire_date, first.expire_date.timestamp_millis());
}

#[tokio::test]
async fn test_leaf_reloaded_after_restart() {
    let (db, _dir) = create_network_db().await;
    let original = {
        let ca = CertificateAuthority::load_or_create(store_on(&db), CaConfig::default())
            .await
            .unwrap();
        ca.get_or_generate("example.org").await.unwrap().cert_pem.clone()
    };

    let ca = CertificateAuthority::load_or_create(store_on(&db), CaConfig::default())
        .await
        .unwrap();
    let reloaded = ca.get_or_generate("example.org").await.unwrap();

    assert_eq!(reloaded.cert_pem, original);
    assert_eq!(ca.store().hits(), 1);
}

#[tokio::test]
async fn test_leaf_renewed_inside_threshold() {
    let (db, _dir) = create_network_db().await;
    let storage: Arc<dyn CertificateStorage> = db.clone();
    // Every one-day leaf is inside a two-day renewal window
    let store = Arc::new(CertificateStore::with_renewal(Some(storage), Duration::days(2)));
    let config = CaConfig {
        leaf_validity_days: 1,
        ..CaConfig::default()
    };
    let ca = CertificateAuthority::load_or_create(store, config).await.unwrap();

    let first = ca.get_or_generate("renew.example").await.unwrap();
    let second = ca.get_or_generate("renew.example").await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.cert_pem, second.cert_pem);
}

#[tokio::test]
async fn test_concurrent_handshakes_share_one_leaf() {
    let (db, _dir) = create_network_db().await;
    let ca = Arc::new(
        CertificateAuthority::load_or_create(store_on(&db), CaConfig::default())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ca = Arc::clone(&ca);
        handles.push(tokio::spawn(async move {
            ca.get_or_generate("busy.example").await.unwrap()
        }));
    }

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap());
    }
    assert!(records.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

// ============================================================================
// TLS handshake with a forged leaf
// ============================================================================

#[tokio::test]
async fn test_browser_trusts_forged_leaf() {
    let ca = CertificateAuthority::load_or_create(
        Arc::new(CertificateStore::new(None)),
        CaConfig::default(),
    )
    .await
    .unwrap();
    let record = ca.get_or_generate("example.org").await.unwrap();

    let tls = ClientTlsConfig::from_record(&record, vec![ALPN_H2.to_vec()]).unwrap();
    let acceptor = TlsAcceptor::from(tls.server_config());
    let connector = browser_connector(
        ca.root_cert_pem(),
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
    );

    let (browser_io, proxy_io) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut stream = acceptor.accept(proxy_io).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
        buf
    });

    let name = ServerName::try_from("example.org").unwrap();
    let mut browser = connector.connect(name, browser_io).await.unwrap();
    assert_eq!(browser.get_ref().1.alpn_protocol(), Some(ALPN_H2));

    browser.write_all(b"ping").await.unwrap();
    browser.flush().await.unwrap();
    let mut reply = [0u8; 4];
    browser.read_exact(&mut reply).await.unwrap();

    assert_eq!(&reply, b"pong");
    assert_eq!(&server.await.unwrap(), b"ping");
}

#[tokio::test]
async fn test_browser_rejects_leaf_for_other_host() {
    let ca = CertificateAuthority::load_or_create(
        Arc::new(CertificateStore::new(None)),
        CaConfig::default(),
    )
    .await
    .unwrap();
    let record = ca.get_or_generate("example.org").await.unwrap();

    let tls = ClientTlsConfig::from_record(&record, Vec::new()).unwrap();
    let acceptor = TlsAcceptor::from(tls.server_config());
    let connector = browser_connector(ca.root_cert_pem(), Vec::new());

    let (browser_io, proxy_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = acceptor.accept(proxy_io).await;
    });

    let name = ServerName::try_from("other.example").unwrap();
    assert!(connector.connect(name, browser_io).await.is_err());
}
