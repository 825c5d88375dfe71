//! MITM Interceptor - Main interception logic
//!
//! Classifies a tunnel by its first byte and hands it to the matching relay:
//! 1. MITM disabled for the session: byte-for-byte tunnel, nothing recorded
//! 2. TLS record: read the ClientHello, then pick the origin leg. A live
//!    HTTP/2 session to the origin is shared; an origin known to speak
//!    HTTP/1.1 is served from the session's socket pool; otherwise a socket
//!    is dialed offering the browser's ALPN. The browser handshake finishes
//!    with a forged certificate advertising only what the origin selected
//! 3. Anything else: plaintext HTTP/1
//!
//! `UpstreamConnector` opens origin sockets and stamps their milestones on
//! the session; `ConnectionContext` carries the per-connection state the
//! relays share.

use crate::config::ProxyConfig;
use crate::dns::DnsResolver;
use crate::mitm::{
    certificate_authority::CertificateAuthority,
    error::{MitmError, Result},
    http1_mitm::Http1Relay,
    http2_mitm::{serve_http2_client, Http2Config, OriginHttp2Session},
    origin_pool::{Http1Acquired, OriginKey},
    request_session::RequestSession,
    resource::{ResourceInit, SocketId, SocketRecord},
    resource_state::Milestone,
    response_cache::SharedResponseCache,
    stream::{BoxedIo, CountingIo, PrefixedStream, ProxyIo},
    tls_config::{supported_alpn, ClientTlsConfig, SniUtils, UpstreamTlsConfig, ALPN_H2, ALPN_HTTP11},
    upstream_proxy::connect_via_proxy,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::timeout;
use tokio_rustls::{LazyConfigAcceptor, StartHandshake, TlsConnector};
use tracing::{debug, error, info, warn};

/// First byte of a TLS handshake record
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Why a tunnel was relayed without inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    MitmDisabled,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::MitmDisabled => write!(f, "mitm disabled for session"),
        }
    }
}

/// Negotiated application protocol of an intercepted tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptedProtocol {
    Http2,
    Http1Tls,
    Http1Plain,
}

/// Result of interception attempt
#[derive(Debug)]
pub enum InterceptionResult {
    /// Relayed through the recording relays
    Intercepted { protocol: InterceptedProtocol },

    /// Tunneled without inspection
    Bypassed { reason: BypassReason },

    /// Failed
    Failed { error: MitmError },
}

/// Per-connection state shared by the relays
pub struct ConnectionContext {
    pub session: Arc<RequestSession>,
    pub socket_id: Option<SocketId>,
    pub host: String,
    pub port: u16,
    pub is_ssl: bool,
    pub response_cache: SharedResponseCache,
    pub max_captured_body: usize,
}

impl ConnectionContext {
    pub fn origin(&self) -> String {
        format!("{}://{}", scheme(self.is_ssl), authority(&self.host, self.port, self.is_ssl))
    }

    /// Absolute URL for a request target seen on this connection.
    pub fn url_for(&self, uri: &http::Uri) -> String {
        request_url(self.is_ssl, &self.host, self.port, uri)
    }

    /// Attach the connection's socket and scheme to a new resource.
    pub fn resource_init(&self, init: ResourceInit) -> ResourceInit {
        let init = init.ssl(self.is_ssl);
        match self.socket_id {
            Some(socket_id) => init.on_socket(socket_id),
            None => init,
        }
    }

    pub fn socket_milestone(&self, milestone: Milestone) {
        if let Some(socket_id) = self.socket_id {
            self.session.record_socket_milestone(socket_id, milestone);
        }
    }

    pub fn socket_closed(&self) {
        if let Some(socket_id) = self.socket_id {
            self.session.on_socket_closed(socket_id);
        }
    }

    pub fn socket_error(&self, error: &str) {
        if let Some(socket_id) = self.socket_id {
            self.session.on_socket_error(socket_id, error);
        }
    }
}

fn scheme(is_ssl: bool) -> &'static str {
    if is_ssl {
        "https"
    } else {
        "http"
    }
}

fn authority(host: &str, port: u16, is_ssl: bool) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let default_port = if is_ssl { 443 } else { 80 };
    if port == default_port {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

/// Absolute URL of a request. Absolute-form targets are kept as sent;
/// origin-form targets are resolved against the connection's origin.
pub fn request_url(is_ssl: bool, host: &str, port: u16, uri: &http::Uri) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme(is_ssl), authority(host, port, is_ssl), path)
}

/// Where a TLS tunnel's requests go
enum OriginLeg {
    /// The session's live HTTP/2 session to this origin
    Http2(Arc<OriginHttp2Session>),
    /// The origin speaks HTTP/1.1; requests use the session's pool
    Pooled,
    /// A socket dialed for this tunnel, with its pool slot
    Dialed(UpstreamConnection, Option<OwnedSemaphorePermit>),
}

/// An open origin leg
pub struct UpstreamConnection {
    pub io: BoxedIo,
    pub socket_id: SocketId,
    /// ALPN selected by the origin (TLS legs only)
    pub alpn: Option<Vec<u8>>,
}

/// Opens origin sockets on behalf of a session.
pub struct UpstreamConnector {
    tls: Arc<UpstreamTlsConfig>,
    dns: Arc<DnsResolver>,
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(
        tls: Arc<UpstreamTlsConfig>,
        dns: Arc<DnsResolver>,
        connect_timeout: Duration,
        tls_handshake_timeout: Duration,
    ) -> Self {
        Self {
            tls,
            dns,
            connect_timeout,
            tls_handshake_timeout,
        }
    }

    /// Open a TCP connection to the origin, directly or through the
    /// session's upstream proxy. Nothing is recorded on the session.
    pub async fn connect_tcp(
        &self,
        session: &RequestSession,
        host: &str,
        port: u16,
    ) -> Result<TcpStream> {
        if let Some(proxy_url) = session.upstream_proxy().current().await {
            return self.with_connect_timeout(host, connect_via_proxy(&proxy_url, host, port)).await;
        }
        let ip = self.dns.lookup(host).await?;
        self.with_connect_timeout(host, async {
            TcpStream::connect((ip, port))
                .await
                .map_err(|e| MitmError::upstream(host, e.to_string()))
        })
        .await
    }

    /// Open a recorded origin socket. `alpn` makes it a TLS leg offering
    /// those protocols.
    pub async fn connect(
        &self,
        session: &RequestSession,
        host: &str,
        port: u16,
        alpn: Option<Vec<Vec<u8>>>,
    ) -> Result<UpstreamConnection> {
        let socket_id = session.register_socket(SocketRecord::new(host, port));
        match self.open(session, socket_id, host, port, alpn).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                session.on_socket_error(socket_id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        session: &RequestSession,
        socket_id: SocketId,
        host: &str,
        port: u16,
        alpn: Option<Vec<Vec<u8>>>,
    ) -> Result<UpstreamConnection> {
        let tcp = match session.upstream_proxy().current().await {
            Some(proxy_url) => {
                session.record_socket_milestone(socket_id, Milestone::UpstreamProxyAcquired);
                self.with_connect_timeout(host, connect_via_proxy(&proxy_url, host, port))
                    .await?
            }
            None => {
                let ip = self.dns.lookup(host).await?;
                session.update_socket(socket_id, |s| s.dns_resolved_ip = Some(ip));
                session.record_socket_milestone(socket_id, Milestone::DnsResolved);
                self.with_connect_timeout(host, async {
                    TcpStream::connect((ip, port))
                        .await
                        .map_err(|e| MitmError::upstream(host, e.to_string()))
                })
                .await?
            }
        };
        let local_addr = tcp.local_addr().ok();
        let remote_addr = tcp.peer_addr().ok();
        session.update_socket(socket_id, |s| {
            s.local_addr = local_addr;
            s.remote_addr = remote_addr;
        });
        session.record_socket_milestone(socket_id, Milestone::Connected);
        let counters = session.socket_counters(socket_id).unwrap_or_default();
        let tcp = CountingIo::new(tcp, counters);

        let Some(alpn) = alpn else {
            return Ok(UpstreamConnection {
                io: Box::new(tcp),
                socket_id,
                alpn: None,
            });
        };

        let server_name = SniUtils::parse_server_name(host)?;
        let connector = TlsConnector::from(self.tls.client_config(alpn));
        let tls = match timeout(self.tls_handshake_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(MitmError::tls_handshake(host, e.to_string())),
            Err(_) => return Err(MitmError::tls_handshake(host, "handshake timed out")),
        };

        let selected = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        let alpn_label = selected
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        session.update_socket(socket_id, |s| {
            s.alpn = alpn_label;
            s.server_name = Some(host.to_string());
        });
        session.record_socket_milestone(socket_id, Milestone::TlsHandshakeComplete);
        debug!(
            session_id = %session.session_id(),
            socket_id,
            host = %host,
            alpn = ?selected.as_deref().map(String::from_utf8_lossy),
            "Upstream TLS handshake successful"
        );

        Ok(UpstreamConnection {
            io: Box::new(tls),
            socket_id,
            alpn: selected,
        })
    }

    async fn with_connect_timeout<F>(&self, host: &str, connect: F) -> Result<TcpStream>
    where
        F: std::future::Future<Output = Result<TcpStream>>,
    {
        match timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(MitmError::upstream(host, "connect timed out")),
        }
    }
}

/// MITM Interceptor
pub struct MitmInterceptor {
    /// Certificate authority for forging leaf certs
    ca: Arc<CertificateAuthority>,

    /// Origin socket factory
    connector: Arc<UpstreamConnector>,

    /// Process-wide response cache
    response_cache: SharedResponseCache,

    http2: Http2Config,

    max_captured_body: usize,
}

impl MitmInterceptor {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        connector: Arc<UpstreamConnector>,
        response_cache: SharedResponseCache,
        http2: Http2Config,
        max_captured_body: usize,
    ) -> Self {
        Self {
            ca,
            connector,
            response_cache,
            http2,
            max_captured_body,
        }
    }

    /// Build an interceptor and its connector from the proxy config.
    pub fn from_config(
        ca: Arc<CertificateAuthority>,
        response_cache: SharedResponseCache,
        config: &ProxyConfig,
    ) -> Result<Self> {
        let tls = UpstreamTlsConfig::new_with_options(
            Default::default(),
            config.verify_upstream_certificates,
        )?;
        let dns = DnsResolver::new(
            config.dns_cache_size,
            config.dns_cache_ttl(),
            config.dns_resolver_timeout(),
        );
        let connector = UpstreamConnector::new(
            Arc::new(tls),
            Arc::new(dns),
            config.connect_timeout(),
            config.tls_handshake_timeout(),
        );
        Ok(Self::new(
            ca,
            Arc::new(connector),
            response_cache,
            config.http2.clone(),
            config.max_captured_body,
        ))
    }

    /// Root certificate browsers must trust
    pub fn root_cert_pem(&self) -> &str {
        self.ca.root_cert_pem()
    }

    pub fn connector(&self) -> &Arc<UpstreamConnector> {
        &self.connector
    }

    pub fn response_cache(&self) -> &SharedResponseCache {
        &self.response_cache
    }

    pub fn max_captured_body(&self) -> usize {
        self.max_captured_body
    }

    /// Relay a CONNECT tunnel to `target_host:target_port` for `session`.
    pub async fn intercept<C: ProxyIo>(
        &self,
        session: Arc<RequestSession>,
        mut client_io: C,
        target_host: String,
        target_port: u16,
    ) -> InterceptionResult {
        let start = Instant::now();
        debug!(
            session_id = %session.session_id(),
            target_host = %target_host,
            target_port,
            "Attempting MITM interception"
        );

        if !session.is_mitm_enabled() {
            return match self
                .tunnel_connection(&session, client_io, &target_host, target_port)
                .await
            {
                Ok(()) => InterceptionResult::Bypassed {
                    reason: BypassReason::MitmDisabled,
                },
                Err(error) => InterceptionResult::Failed { error },
            };
        }

        let mut first = [0u8; 1];
        let peeked = match client_io.read(&mut first).await {
            Ok(0) => {
                debug!(session_id = %session.session_id(), "Client closed tunnel before sending data");
                return InterceptionResult::Failed {
                    error: MitmError::Io(std::io::ErrorKind::UnexpectedEof.into()),
                };
            }
            Ok(n) => n,
            Err(e) => return InterceptionResult::Failed { error: e.into() },
        };
        let client_io = PrefixedStream::new(first[..peeked].to_vec(), client_io);

        let result = if first[0] == TLS_HANDSHAKE_RECORD {
            self.intercept_tls(&session, client_io, &target_host, target_port)
                .await
        } else {
            self.intercept_plain(&session, client_io, &target_host, target_port)
                .await
        };

        match result {
            Ok(protocol) => {
                info!(
                    session_id = %session.session_id(),
                    target_host = %target_host,
                    protocol = ?protocol,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "MITM interception completed"
                );
                InterceptionResult::Intercepted { protocol }
            }
            Err(error) => {
                warn!(
                    session_id = %session.session_id(),
                    target_host = %target_host,
                    error = %error,
                    "MITM interception failed"
                );
                InterceptionResult::Failed { error }
            }
        }
    }

    /// Intercept connection with full TLS inspection
    async fn intercept_tls<C: ProxyIo>(
        &self,
        session: &Arc<RequestSession>,
        client_io: C,
        target_host: &str,
        target_port: u16,
    ) -> Result<InterceptedProtocol> {
        // 1. Read the ClientHello without answering it
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), client_io)
            .await
            .map_err(|e| MitmError::tls_handshake(target_host, e.to_string()))?;
        let (server_name, offered) = {
            let hello = start.client_hello();
            let server_name = hello
                .server_name()
                .map(str::to_string)
                .unwrap_or_else(|| target_host.to_string());
            let offered: Vec<Vec<u8>> = hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default();
            (server_name, supported_alpn(&offered))
        };
        debug!(
            session_id = %session.session_id(),
            server_name = %server_name,
            offered = offered.len(),
            "ClientHello received"
        );

        // 2. Origin leg: the shared HTTP/2 session, the HTTP/1 pool, or a
        //    fresh socket offering what the browser offered
        let key = OriginKey::new(true, target_host, target_port);
        let pool = session.origin_pool();
        let shared = if offered.iter().any(|p| p == ALPN_H2) {
            pool.http2_session(&key)
        } else {
            None
        };
        let known_http1 = pool.alpn(&key).as_deref() == Some(ALPN_HTTP11)
            && (offered.is_empty() || offered.iter().any(|p| p == ALPN_HTTP11));
        let origin = match shared {
            Some(shared) => OriginLeg::Http2(shared),
            None if known_http1 => OriginLeg::Pooled,
            None => {
                let permit = match pool.acquire_http1(&key).await {
                    Http1Acquired::Open(permit) => Some(permit),
                    Http1Acquired::Idle(leg) => {
                        pool.checkin_http1(&key, leg);
                        None
                    }
                    Http1Acquired::Closed => {
                        return Err(MitmError::Canceled("session closed".into()));
                    }
                };
                let upstream = self
                    .connector
                    .connect(session, target_host, target_port, Some(offered.clone()))
                    .await?;
                pool.set_alpn(&key, upstream.alpn.clone());
                OriginLeg::Dialed(upstream, permit)
            }
        };
        let selected = match &origin {
            OriginLeg::Http2(_) => Some(ALPN_H2.to_vec()),
            OriginLeg::Pooled if offered.is_empty() => None,
            OriginLeg::Pooled => Some(ALPN_HTTP11.to_vec()),
            OriginLeg::Dialed(upstream, _) => upstream.alpn.clone(),
        };

        // 3. Browser leg with a forged certificate and the origin's choice
        let client_tls = match self.browser_handshake(start, &server_name, selected.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if let OriginLeg::Dialed(upstream, _) = &origin {
                    session.deregister_socket(upstream.socket_id);
                }
                return Err(e);
            }
        };
        info!(
            session_id = %session.session_id(),
            target_host = %target_host,
            "Client TLS handshake successful"
        );

        // 4. Relay by the negotiated protocol
        let context = |socket_id: Option<SocketId>| {
            Arc::new(ConnectionContext {
                session: Arc::clone(session),
                socket_id,
                host: target_host.to_string(),
                port: target_port,
                is_ssl: true,
                response_cache: Arc::clone(&self.response_cache),
                max_captured_body: self.max_captured_body,
            })
        };

        match origin {
            OriginLeg::Http2(shared) => {
                debug!(session_id = %session.session_id(), target_host = %target_host, "Reusing origin HTTP/2 session");
                let ctx = context(shared.socket_id());
                serve_http2_client(client_tls, shared, ctx, self.http2.clone()).await?;
                Ok(InterceptedProtocol::Http2)
            }
            OriginLeg::Dialed(upstream, permit) if selected.as_deref() == Some(ALPN_H2) => {
                debug!(session_id = %session.session_id(), target_host = %target_host, "Using HTTP/2 relay");
                drop(permit);
                let ctx = context(Some(upstream.socket_id));
                let origin = OriginHttp2Session::connect(upstream.io, &ctx, &self.http2).await?;
                pool.set_http2_session(&key, Arc::clone(&origin));
                serve_http2_client(client_tls, origin, ctx, self.http2.clone()).await?;
                Ok(InterceptedProtocol::Http2)
            }
            OriginLeg::Dialed(upstream, permit) => {
                debug!(session_id = %session.session_id(), target_host = %target_host, "Using HTTP/1.1 relay");
                let ctx = context(Some(upstream.socket_id));
                let relay = Http1Relay::for_tunnel(
                    Arc::clone(session),
                    Arc::clone(&self.connector),
                    ctx,
                    Some((upstream, permit)),
                );
                relay.serve(client_tls).await?;
                Ok(InterceptedProtocol::Http1Tls)
            }
            OriginLeg::Pooled => {
                debug!(session_id = %session.session_id(), target_host = %target_host, "Using pooled HTTP/1.1 relay");
                let relay = Http1Relay::for_tunnel(
                    Arc::clone(session),
                    Arc::clone(&self.connector),
                    context(None),
                    None,
                );
                relay.serve(client_tls).await?;
                Ok(InterceptedProtocol::Http1Tls)
            }
        }
    }

    /// Finish the browser handshake with a forged certificate for
    /// `server_name`, advertising `alpn`.
    async fn browser_handshake<C: ProxyIo>(
        &self,
        start: StartHandshake<C>,
        server_name: &str,
        alpn: Option<Vec<u8>>,
    ) -> Result<tokio_rustls::server::TlsStream<C>> {
        let record = self.ca.get_or_generate(server_name).await.map_err(|e| {
            error!(server_name = %server_name, error = %e, "Certificate signing failed");
            e
        })?;
        let tls_config = ClientTlsConfig::from_record(&record, alpn.into_iter().collect())?;
        match timeout(
            self.connector.tls_handshake_timeout,
            start.into_stream(tls_config.server_config()),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(MitmError::tls_handshake(server_name, e.to_string())),
            Err(_) => Err(MitmError::tls_handshake(server_name, "handshake timed out")),
        }
    }

    async fn intercept_plain<C: ProxyIo>(
        &self,
        session: &Arc<RequestSession>,
        client_io: C,
        target_host: &str,
        target_port: u16,
    ) -> Result<InterceptedProtocol> {
        let ctx = Arc::new(ConnectionContext {
            session: Arc::clone(session),
            socket_id: None,
            host: target_host.to_string(),
            port: target_port,
            is_ssl: false,
            response_cache: Arc::clone(&self.response_cache),
            max_captured_body: self.max_captured_body,
        });
        let relay = Http1Relay::for_tunnel(Arc::clone(session), Arc::clone(&self.connector), ctx, None);
        relay.serve(client_io).await?;
        Ok(InterceptedProtocol::Http1Plain)
    }

    /// Tunnel connection without inspection (bypass mode)
    async fn tunnel_connection<C: ProxyIo>(
        &self,
        session: &RequestSession,
        mut client_io: C,
        target_host: &str,
        target_port: u16,
    ) -> Result<()> {
        debug!(
            session_id = %session.session_id(),
            target_host = %target_host,
            target_port,
            "Tunneling without inspection"
        );

        let mut upstream = self
            .connector
            .connect_tcp(session, target_host, target_port)
            .await?;
        let cancel = session.cancellation_token();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session.session_id(), "Session closed, dropping tunnel");
            }
            copied = tokio::io::copy_bidirectional(&mut client_io, &mut upstream) => {
                let (bytes_up, bytes_down) = copied?;
                info!(
                    session_id = %session.session_id(),
                    target_host = %target_host,
                    bytes_up,
                    bytes_down,
                    "Tunnel completed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::request_session::SessionOptions;
    use crate::mitm::response_cache::HttpResponseCache;

    fn context(is_ssl: bool, host: &str, port: u16) -> ConnectionContext {
        ConnectionContext {
            session: RequestSession::new("s1", SessionOptions::default()),
            socket_id: None,
            host: host.to_string(),
            port,
            is_ssl,
            response_cache: HttpResponseCache::shared(10),
            max_captured_body: 1024,
        }
    }

    #[test]
    fn test_url_for_origin_form() {
        let ctx = context(true, "example.com", 443);
        let uri: http::Uri = "/a/b?c=1".parse().unwrap();
        assert_eq!(ctx.url_for(&uri), "https://example.com/a/b?c=1");

        let ctx = context(false, "example.com", 8080);
        let uri: http::Uri = "/".parse().unwrap();
        assert_eq!(ctx.url_for(&uri), "http://example.com:8080/");
    }

    #[test]
    fn test_url_for_absolute_form_kept() {
        let ctx = context(false, "example.com", 80);
        let uri: http::Uri = "http://other.test:81/x".parse().unwrap();
        assert_eq!(ctx.url_for(&uri), "http://other.test:81/x");
    }

    #[test]
    fn test_origin_brackets_ipv6() {
        let ctx = context(true, "::1", 8443);
        assert_eq!(ctx.origin(), "https://[::1]:8443");
    }

    #[test]
    fn test_socket_helpers_without_socket_are_noops() {
        let ctx = context(true, "example.com", 443);
        ctx.socket_milestone(Milestone::Connected);
        ctx.socket_closed();
        ctx.socket_error("boom");
        assert_eq!(ctx.session.socket_count(), 0);
    }

    #[test]
    fn test_resource_init_attaches_socket() {
        let mut ctx = context(true, "example.com", 443);
        ctx.socket_id = Some(42);
        let init = ctx.resource_init(ResourceInit::new("GET", "https://example.com/", Default::default()));
        assert_eq!(init.socket_id, Some(42));
        assert!(init.is_ssl);
    }
}
