//! Proxy listener
//!
//! Accepts browser connections, binds each request to a session through
//! `Proxy-Authorization`, hands CONNECT tunnels to the interceptor and
//! relays absolute-form plain HTTP requests directly.

use anyhow::{Context, Result};
use http::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::mitm::cert_store::{CertificateStorage, CertificateStore};
use crate::mitm::certificate_authority::{CaConfig, CertificateAuthority};
use crate::mitm::http1_mitm::{empty_body, proxy_response, Http1Relay, RelayBody};
use crate::mitm::interceptor::{InterceptionResult, MitmInterceptor};
use crate::mitm::request_session::{RequestSession, SessionOptions, SessionRegistry};
use crate::mitm::response_cache::HttpResponseCache;
use crate::mitm::storage::{NetworkDb, SessionDb};
use crate::mitm::stream::{HeadLog, HeadTap, HEAD_LOG_LIMIT};

/// Parse and validate CONNECT authority (host:port)
/// Returns (host, port) or error message
pub fn parse_authority(authority: &str) -> Result<(String, u16), String> {
    // Split by last colon to handle IPv6 addresses like [::1]:443
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| "Authority must be in host:port format".to_string())?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .ok_or_else(|| "Unterminated IPv6 literal".to_string())?
    } else if host.contains(':') {
        return Err("IPv6 hosts must be bracketed".to_string());
    } else {
        host
    };

    // Validate host is not empty
    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    // Parse and validate port
    let port: u16 = port_str.parse().map_err(|_| {
        format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port_str
        )
    })?;

    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok((host.to_string(), port))
}

fn proxy_auth_required() -> Response<RelayBody> {
    let mut response = proxy_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy authentication required",
    );
    response.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"session-mitm\""),
    );
    response
}

pub struct MitmProxyServer {
    config: ProxyConfig,
    interceptor: Arc<MitmInterceptor>,
    registry: Arc<SessionRegistry>,
    network_db: Option<Arc<NetworkDb>>,
    shutdown: CancellationToken,
}

impl MitmProxyServer {
    pub fn new(
        config: ProxyConfig,
        interceptor: Arc<MitmInterceptor>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            interceptor,
            registry,
            network_db: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the CA, caches and interceptor from `config`.
    pub async fn from_config(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let network_db = Arc::new(
            NetworkDb::new(&config.network_db_path.to_string_lossy())
                .await
                .context("Failed to open network database")?,
        );
        let storage: Arc<dyn CertificateStorage> = network_db.clone();
        let store = Arc::new(CertificateStore::with_renewal(
            Some(storage),
            chrono::Duration::minutes(config.cert_renew_before_minutes),
        ));
        let ca_config = CaConfig {
            leaf_validity_days: config.leaf_validity_days,
            ..CaConfig::default()
        };
        let ca = CertificateAuthority::load_or_create(store, ca_config)
            .await
            .context("Failed to load or create root CA")?;

        let cache = HttpResponseCache::shared(config.response_cache_max_items);
        let interceptor = MitmInterceptor::from_config(Arc::new(ca), cache, &config)
            .context("Failed to build interceptor")?;

        let mut server = Self::new(config, Arc::new(interceptor), Arc::new(SessionRegistry::new()));
        server.network_db = Some(network_db);
        Ok(server)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn interceptor(&self) -> &Arc<MitmInterceptor> {
        &self.interceptor
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Default options for a session created through this server
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mitm_enabled: self.config.mitm_enabled_by_default,
            event_capacity: self.config.event_capacity,
            proxy_acquire_timeout: self.config.proxy_acquire_timeout(),
            max_sockets_per_origin: self.config.max_sockets_per_origin,
            ..SessionOptions::default()
        }
    }

    /// Create, persist-enable and register a session.
    pub async fn create_session(
        &self,
        session_id: &str,
        mut options: SessionOptions,
    ) -> Result<Arc<RequestSession>> {
        if options.db.is_none() {
            tokio::fs::create_dir_all(&self.config.session_db_dir)
                .await
                .context("Failed to create session database directory")?;
            let path = self.config.session_db_path(session_id);
            let db = SessionDb::new(&path.to_string_lossy())
                .await
                .with_context(|| format!("Failed to open session database {}", path.display()))?;
            options.db = Some(Arc::new(db));
        }
        let session = RequestSession::new(session_id, options);
        self.registry.register(Arc::clone(&session));
        info!(session_id = %session_id, "Session registered");
        Ok(session)
    }

    /// Close and forget a session.
    pub async fn close_session(&self, session_id: &str) {
        if let Some(session) = self.registry.remove(session_id) {
            session.close().await;
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().ok();
        info!(addr = ?local_addr, "Proxy listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Proxy shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.serve_client(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        self.registry.close_all().await;
        if let Some(db) = &self.network_db {
            db.close().await;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve HTTP/1.1 on one browser connection
    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "Client connected");
        // One relay per client connection keeps its origin legs alive
        let relay: Arc<Mutex<Option<Arc<Http1Relay>>>> = Arc::new(Mutex::new(None));
        let heads = HeadLog::keep_newest(HEAD_LOG_LIMIT);
        let stream = HeadTap::new(stream, heads.clone());

        let server = Arc::clone(&self);
        let conn = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .timer(TokioTimer::new())
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = Arc::clone(&server);
                    let relay = Arc::clone(&relay);
                    let heads = heads.clone();
                    async move { server.handle_request(req, relay, heads).await }
                }),
            )
            .with_upgrades(); // Enable HTTP upgrades for CONNECT

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            result = conn => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Client connection error");
                }
            }
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        relay: Arc<Mutex<Option<Arc<Http1Relay>>>>,
        heads: HeadLog,
    ) -> std::result::Result<Response<RelayBody>, Infallible> {
        let session = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.registry.from_proxy_authorization(v));
        let Some(session) = session else {
            debug!(method = %req.method(), uri = %req.uri(), "Request without a known session");
            return Ok(proxy_auth_required());
        };

        if req.method() == Method::CONNECT {
            // Tunnel bytes are not HTTP/1 heads
            heads.stop();
            return Ok(self.handle_connect(req, session));
        }

        if req.uri().authority().is_none() {
            return Ok(proxy_response(
                StatusCode::BAD_REQUEST,
                "absolute-form request target required",
            ));
        }

        let relay = {
            let mut slot = relay.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(existing) if existing.session().session_id() == session.session_id() => {
                    Arc::clone(existing)
                }
                _ => {
                    let created = Http1Relay::for_proxy(
                        session,
                        Arc::clone(self.interceptor.connector()),
                        Arc::clone(self.interceptor.response_cache()),
                        self.interceptor.max_captured_body(),
                        heads,
                    );
                    *slot = Some(Arc::clone(&created));
                    created
                }
            }
        };
        relay.handle(req).await
    }

    fn handle_connect(
        &self,
        mut req: Request<Incoming>,
        session: Arc<RequestSession>,
    ) -> Response<RelayBody> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let (host, port) = match parse_authority(&authority) {
            Ok(target) => target,
            Err(err_msg) => {
                warn!(session_id = %session.session_id(), authority = %authority, error = %err_msg, "Invalid CONNECT target");
                return proxy_response(StatusCode::BAD_REQUEST, format!("Bad Request: {}", err_msg));
            }
        };

        let interceptor = Arc::clone(&self.interceptor);
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let result = interceptor
                        .intercept(Arc::clone(&session), TokioIo::new(upgraded), host.clone(), port)
                        .await;
                    match result {
                        InterceptionResult::Intercepted { protocol } => {
                            debug!(session_id = %session.session_id(), host = %host, protocol = ?protocol, "Tunnel finished");
                        }
                        InterceptionResult::Bypassed { reason } => {
                            debug!(session_id = %session.session_id(), host = %host, reason = %reason, "Tunnel bypassed");
                        }
                        InterceptionResult::Failed { error } => {
                            warn!(session_id = %session.session_id(), host = %host, error = %error, "Tunnel failed");
                        }
                    }
                }
                Err(e) => {
                    error!(session_id = %session.session_id(), error = %e, "CONNECT upgrade failed");
                }
            }
        });

        Response::new(empty_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority_valid() {
        assert_eq!(
            parse_authority("example.com:443"),
            Ok(("example.com".to_string(), 443))
        );
        assert_eq!(parse_authority("[::1]:8443"), Ok(("::1".to_string(), 8443)));
        assert_eq!(
            parse_authority("10.0.0.1:80"),
            Ok(("10.0.0.1".to_string(), 80))
        );
    }

    #[test]
    fn test_parse_authority_invalid() {
        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("example.com:0").is_err());
        assert!(parse_authority("example.com:99999").is_err());
        assert!(parse_authority("example.com:abc").is_err());
        assert!(parse_authority("::1:443").is_err());
        assert!(parse_authority("[::1:443").is_err());
    }

    #[test]
    fn test_proxy_auth_required_header() {
        let response = proxy_auth_required();
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert!(response
            .headers()
            .get(PROXY_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Basic"));
    }
}
