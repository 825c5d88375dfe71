//! HTTP/1.1 MITM Handler
//!
//! Serves the browser leg with hyper and forwards each request over a
//! keep-alive origin leg taken from the session's origin pool. The leg goes
//! back to the pool once the browser has received the last byte of the
//! response. Response bodies are teed into a capped capture buffer so the
//! resource can be reported with its body.
//!
//! Both legs are read through a `HeadTap` so recorded headers keep the
//! casing and order they had on the wire.
//!
//! A `101 Switching Protocols` answer to a WebSocket upgrade hands both
//! upgraded legs to a message relay. Upgrades always run on a dedicated
//! origin socket since the socket leaves HTTP once switched; a refused
//! upgrade closes that socket once its response is relayed.

use crate::mitm::error::{MitmError, ResourceError, Result};
use crate::mitm::interceptor::{request_url, ConnectionContext, UpstreamConnection, UpstreamConnector};
use crate::mitm::origin_pool::{Http1Acquired, Http1Leg, OriginKey};
use crate::mitm::request_session::{BlockedResponse, RequestSession};
use crate::mitm::resource::{ResourceHeaders, ResourceId, ResourceInit, SocketId};
use crate::mitm::resource_state::Milestone;
use crate::mitm::response_cache::{plan_request, CachePlan, CachedHttpResponse, SharedResponseCache};
use crate::mitm::stream::{BodyCapture, HeadLog, HeadTap, ProxyIo, RawHeaders, HEAD_LOG_LIMIT};
use crate::mitm::tls_config::ALPN_HTTP11;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{HeaderValue, HOST, UPGRADE};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Body type of every response handed to the browser
pub type RelayBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers meant for the proxy, never forwarded
const PROXY_ONLY_HEADERS: [&str; 2] = ["proxy-authorization", "proxy-connection"];

/// Origin of one request
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    is_ssl: bool,
}

impl Target {
    fn from_absolute(uri: &Uri) -> Option<Self> {
        let host = uri.host()?.trim_start_matches('[').trim_end_matches(']');
        let is_ssl = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_ssl { 443 } else { 80 });
        Some(Self {
            host: host.to_string(),
            port,
            is_ssl,
        })
    }

    fn origin_key(&self) -> OriginKey {
        OriginKey::new(self.is_ssl, &self.host, self.port)
    }
}

pub fn empty_body() -> RelayBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body(body: impl Into<Bytes>) -> RelayBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response generated by the proxy itself.
pub fn proxy_response(status: StatusCode, message: impl Into<String>) -> Response<RelayBody> {
    let mut response = Response::new(full_body(message.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Local answer to a blocked request.
pub fn blocked_reply(blocked: &BlockedResponse) -> Response<RelayBody> {
    let mut response = Response::new(full_body(blocked.body.clone()));
    *response.status_mut() = StatusCode::from_u16(blocked.status).unwrap_or(StatusCode::OK);
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(blocked.content_type),
    );
    response
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Origin connection opened while setting up a tunnel, with its pool slot
pub type InitialConnection = (UpstreamConnection, Option<OwnedSemaphorePermit>);

pub struct Http1Relay {
    session: Arc<RequestSession>,
    connector: Arc<UpstreamConnector>,
    /// Fixed origin of a CONNECT tunnel; `None` on the listener itself
    tunnel: Option<Target>,
    response_cache: SharedResponseCache,
    max_captured_body: usize,
    /// Used by the first request
    initial: Mutex<Option<InitialConnection>>,
    /// Bytes read from the browser leg
    request_heads: HeadLog,
}

impl Http1Relay {
    /// Relay for a tunnel to `ctx`'s origin.
    pub fn for_tunnel(
        session: Arc<RequestSession>,
        connector: Arc<UpstreamConnector>,
        ctx: Arc<ConnectionContext>,
        initial: Option<InitialConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            connector,
            tunnel: Some(Target {
                host: ctx.host.clone(),
                port: ctx.port,
                is_ssl: ctx.is_ssl,
            }),
            response_cache: Arc::clone(&ctx.response_cache),
            max_captured_body: ctx.max_captured_body,
            initial: Mutex::new(initial),
            request_heads: HeadLog::keep_newest(HEAD_LOG_LIMIT),
        })
    }

    /// Relay for absolute-form requests received by the listener.
    /// `request_heads` records the listener's browser connection.
    pub fn for_proxy(
        session: Arc<RequestSession>,
        connector: Arc<UpstreamConnector>,
        response_cache: SharedResponseCache,
        max_captured_body: usize,
        request_heads: HeadLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            connector,
            tunnel: None,
            response_cache,
            max_captured_body,
            initial: Mutex::new(None),
            request_heads,
        })
    }

    pub fn session(&self) -> &Arc<RequestSession> {
        &self.session
    }

    /// Serve HTTP/1.1 on the browser leg until it closes or the session ends.
    pub async fn serve<I: ProxyIo>(self: Arc<Self>, io: I) -> Result<()> {
        let relay = Arc::clone(&self);
        let service = service_fn(move |req| {
            let relay = Arc::clone(&relay);
            async move { relay.handle(req).await }
        });

        let io = HeadTap::new(io, self.request_heads.clone());
        let conn = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();

        let cancel = self.session.cancellation_token();
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = conn => result.map_err(|e| MitmError::Http(e.to_string())),
        };
        self.release().await;
        result
    }

    /// Close the setup connection if no request used it.
    async fn release(&self) {
        if let Some((unused, _)) = self.initial.lock().await.take() {
            self.session.deregister_socket(unused.socket_id);
        }
    }

    /// Relay one request. Failures become proxy-generated responses.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<RelayBody>, Infallible> {
        Ok(self.relay(req).await)
    }

    async fn relay(&self, mut req: Request<Incoming>) -> Response<RelayBody> {
        let target = match &self.tunnel {
            Some(target) => target.clone(),
            None => match Target::from_absolute(req.uri()) {
                Some(target) => target,
                None => return proxy_response(StatusCode::BAD_REQUEST, "absolute-form request target required"),
            },
        };
        let url = request_url(target.is_ssl, &target.host, target.port, req.uri());

        let raw = self
            .request_heads
            .take_request_head(req.method().as_str(), &req.uri().to_string());
        let init = ResourceInit::new(
            req.method().as_str(),
            url.clone(),
            ResourceHeaders::from_wire(raw, req.headers()),
        )
        .ssl(target.is_ssl);
        let Some(resource) = self.session.create_resource(init) else {
            return proxy_response(StatusCode::SERVICE_UNAVAILABLE, "session closed");
        };
        let resource_id = resource.id;

        if let Some(blocked) = self.session.blocked_response(&resource) {
            self.session.resource_blocked(resource_id, &blocked);
            return blocked_reply(&blocked);
        }

        let is_upgrade = is_websocket_upgrade(req.headers());
        let client_upgrade = is_upgrade.then(|| hyper::upgrade::on(&mut req));
        let (mut parts, body) = req.into_parts();
        prepare_request_head(&mut parts, &target);

        let plan = plan_request(&self.response_cache, &url, &parts.method, &mut parts.headers).await;
        if let CachePlan::Serve(entry) = &plan {
            debug!(session_id = %self.session.session_id(), resource_id, url = %url, "Serving from cache");
            return self.serve_cached(resource_id, entry);
        }

        let (mut leg, pool_key) = match self.acquire_leg(&target, is_upgrade).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(session_id = %self.session.session_id(), resource_id, error = %e, "Upstream connection failed");
                let message = e.to_string();
                self.session.resource_failed(resource_id, e.to_resource_error());
                return proxy_response(StatusCode::BAD_GATEWAY, message);
            }
        };
        self.session.attach_socket(resource_id, leg.socket_id);

        if let Err(e) = leg.sender.ready().await {
            return self.upstream_failed(resource_id, ResourceError::ConnectionClosed(e.to_string()));
        }
        leg.response_heads.clear();
        self.session.record_state(resource_id, Milestone::RequestSent);
        let response = match leg.sender.send_request(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(e) => return self.upstream_failed(resource_id, ResourceError::Transport(e.to_string())),
        };
        self.session.record_state(resource_id, Milestone::HeadersReceived);
        let raw = leg.response_heads.take_response_head(response.status().as_u16());

        if let (true, Some(client_upgrade)) = (response.status() == StatusCode::SWITCHING_PROTOCOLS, client_upgrade) {
            return self.start_websocket(resource_id, leg.socket_id, client_upgrade, response, raw);
        }

        if let (CachePlan::Revalidate(entry), StatusCode::NOT_MODIFIED) = (&plan, response.status()) {
            debug!(session_id = %self.session.session_id(), resource_id, url = %url, "Revalidated cached response");
            drop(response);
            let served = self.serve_cached(resource_id, entry);
            release_leg(&self.session, leg, pool_key.as_ref());
            return served;
        }

        let (parts, body) = response.into_parts();
        self.session.set_response(
            resource_id,
            parts.status.as_u16(),
            ResourceHeaders::from_wire(raw, &parts.headers),
        );

        let cache = (parts.status == StatusCode::OK && plan.is_cacheable())
            .then(|| (Arc::clone(&self.response_cache), url, parts.headers.clone()));
        let body = TeeBody {
            inner: body,
            capture: BodyCapture::new(self.max_captured_body),
            completion: Some(BodyCompletion {
                session: Arc::clone(&self.session),
                resource_id,
                cache,
                leg: Some((leg, pool_key)),
            }),
        };
        Response::from_parts(parts, body.boxed_unsync())
    }

    fn upstream_failed(&self, resource_id: ResourceId, error: ResourceError) -> Response<RelayBody> {
        warn!(session_id = %self.session.session_id(), resource_id, error = %error, "Upstream request failed");
        let message = error.to_string();
        self.session.resource_failed(resource_id, error);
        proxy_response(StatusCode::BAD_GATEWAY, message)
    }

    fn serve_cached(&self, resource_id: ResourceId, entry: &CachedHttpResponse) -> Response<RelayBody> {
        let head = match entry.response_head() {
            Ok(head) => head,
            Err(e) => {
                self.session
                    .resource_failed(resource_id, ResourceError::Protocol(e.to_string()));
                return proxy_response(StatusCode::BAD_GATEWAY, "cached response unusable");
            }
        };
        self.session.mark_served_from_cache(resource_id);
        self.session.set_response(
            resource_id,
            head.status().as_u16(),
            ResourceHeaders::from_header_map(head.headers()),
        );
        self.session
            .resource_loaded(resource_id, Some(entry.body.clone()));
        let (parts, ()) = head.into_parts();
        Response::from_parts(parts, full_body(entry.body.clone()))
    }

    /// A leg to `target` and the pool it returns to. The tunnel's setup
    /// connection goes first, then the session's origin pool. Upgrades
    /// always get a socket of their own, outside the pool.
    async fn acquire_leg(&self, target: &Target, dedicated: bool) -> Result<(Http1Leg, Option<OriginKey>)> {
        let pool_key = (!dedicated).then(|| target.origin_key());

        let initial = self.initial.lock().await.take();
        if let Some((connection, permit)) = initial {
            let permit = permit.filter(|_| !dedicated);
            let leg = self.handshake(connection, permit, dedicated).await?;
            return Ok((leg, pool_key));
        }
        let Some(key) = pool_key else {
            let connection = self.dial(target).await?;
            return Ok((self.handshake(connection, None, true).await?, None));
        };

        match self.session.origin_pool().acquire_http1(&key).await {
            Http1Acquired::Idle(leg) => Ok((leg, Some(key))),
            Http1Acquired::Open(permit) => {
                let connection = self.dial(target).await?;
                let leg = self.handshake(connection, Some(permit), false).await?;
                Ok((leg, Some(key)))
            }
            Http1Acquired::Closed => Err(MitmError::Canceled("session closed".into())),
        }
    }

    async fn dial(&self, target: &Target) -> Result<UpstreamConnection> {
        let alpn = target.is_ssl.then(|| vec![ALPN_HTTP11.to_vec()]);
        self.connector
            .connect(&self.session, &target.host, target.port, alpn)
            .await
    }

    async fn handshake(
        &self,
        connection: UpstreamConnection,
        permit: Option<OwnedSemaphorePermit>,
        for_upgrade: bool,
    ) -> Result<Http1Leg> {
        let socket_id = connection.socket_id;
        let response_heads = HeadLog::keep_oldest(HEAD_LOG_LIMIT);
        let io = HeadTap::new(connection.io, response_heads.clone());
        let (sender, conn) = match hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(io))
            .await
        {
            Ok(handshake) => handshake,
            Err(e) => {
                self.session.on_socket_error(socket_id, &e.to_string());
                return Err(MitmError::Http(e.to_string()));
            }
        };

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            match conn.with_upgrades().await {
                // Upgraded or refused upgrade sockets are closed by the relay
                Ok(()) if for_upgrade => {}
                Ok(()) => session.on_socket_closed(socket_id),
                Err(e) => {
                    debug!(session_id = %session.session_id(), socket_id, error = %e, "HTTP/1 upstream connection ended");
                    session.on_socket_error(socket_id, &e.to_string());
                }
            }
        });

        Ok(Http1Leg::new(socket_id, sender, response_heads, permit))
    }

    fn start_websocket(
        &self,
        resource_id: ResourceId,
        socket_id: SocketId,
        client_upgrade: OnUpgrade,
        mut response: Response<Incoming>,
        raw: Option<RawHeaders>,
    ) -> Response<RelayBody> {
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let (parts, _) = response.into_parts();
        self.session.set_response(
            resource_id,
            parts.status.as_u16(),
            ResourceHeaders::from_wire(raw, &parts.headers),
        );
        // The browser leg stops speaking HTTP/1
        self.request_heads.stop();
        tokio::spawn(relay_websocket(
            Arc::clone(&self.session),
            resource_id,
            socket_id,
            client_upgrade,
            upstream_upgrade,
        ));
        Response::from_parts(parts, empty_body())
    }
}

/// Hand a leg back to its pool, or close a dedicated one.
fn release_leg(session: &RequestSession, leg: Http1Leg, pool_key: Option<&OriginKey>) {
    match pool_key {
        Some(key) => session.origin_pool().checkin_http1(key, leg),
        None => session.on_socket_closed(leg.socket_id),
    }
}

/// Origin-form target, `Host` present, proxy headers stripped.
fn prepare_request_head(parts: &mut http::request::Parts, target: &Target) {
    for name in PROXY_ONLY_HEADERS {
        parts.headers.remove(name);
    }
    if !parts.headers.contains_key(HOST) {
        let host = if target.host.contains(':') {
            format!("[{}]:{}", target.host, target.port)
        } else {
            format!("{}:{}", target.host, target.port)
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert(HOST, value);
        }
    }
    if parts.uri.scheme().is_some() {
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        if let Ok(uri) = path.parse() {
            parts.uri = uri;
        }
    }
}

/// Reports the resource and releases its leg when the relayed body ends
struct BodyCompletion {
    session: Arc<RequestSession>,
    resource_id: ResourceId,
    cache: Option<(SharedResponseCache, String, HeaderMap)>,
    leg: Option<(Http1Leg, Option<OriginKey>)>,
}

impl BodyCompletion {
    /// `Loaded` fires only once the response is in the cache.
    fn finish(self, body: Option<Bytes>) {
        let Self {
            session,
            resource_id,
            cache,
            leg,
        } = self;
        let complete = move |session: &RequestSession, body: Option<Bytes>| {
            session.resource_loaded(resource_id, body);
            if let Some((leg, pool_key)) = leg {
                release_leg(session, leg, pool_key.as_ref());
            }
        };

        match (cache, body) {
            (Some((cache, url, headers)), Some(body)) => {
                tokio::spawn(async move {
                    cache.lock().await.add(&url, body.clone(), &headers);
                    complete(&session, Some(body));
                });
            }
            (_, body) => complete(&session, body),
        }
    }

    /// The leg is dropped; its driver records how the socket ended.
    fn fail(self, error: ResourceError, milestone: Milestone) {
        self.session.fail_resource(self.resource_id, error, milestone);
        if let Some((leg, None)) = self.leg {
            self.session.on_socket_closed(leg.socket_id);
        }
    }
}

/// Response body that copies what it forwards
struct TeeBody {
    inner: Incoming,
    capture: BodyCapture,
    completion: Option<BodyCompletion>,
}

impl TeeBody {
    fn finish(&mut self) {
        if let Some(completion) = self.completion.take() {
            let capture = std::mem::replace(&mut self.capture, BodyCapture::new(0));
            completion.finish(capture.finish());
        }
    }
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.push(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(completion) = this.completion.take() {
                    completion.fail(ResourceError::Transport(e.to_string()), Milestone::Errored);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        // Empty bodies may be dropped unpolled
        if self.inner.is_end_stream() {
            self.finish();
        } else if let Some(completion) = self.completion.take() {
            completion.fail(ResourceError::Canceled, Milestone::PrematurelyClosed);
        }
    }
}

async fn relay_websocket(
    session: Arc<RequestSession>,
    resource_id: ResourceId,
    socket_id: SocketId,
    client_upgrade: OnUpgrade,
    upstream_upgrade: OnUpgrade,
) {
    let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(session_id = %session.session_id(), resource_id, error = %e, "WebSocket upgrade failed");
            session.resource_failed(resource_id, ResourceError::Protocol(e.to_string()));
            session.on_socket_error(socket_id, &e.to_string());
            return;
        }
    };

    let client_ws = WebSocketStream::from_raw_socket(TokioIo::new(client), Role::Server, None).await;
    let upstream_ws = WebSocketStream::from_raw_socket(TokioIo::new(upstream), Role::Client, None).await;
    let (client_sink, client_stream) = client_ws.split();
    let (upstream_sink, upstream_stream) = upstream_ws.split();

    debug!(session_id = %session.session_id(), resource_id, "WebSocket relay started");
    let cancel = session.cancellation_token();
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = pump_messages(&session, resource_id, client_stream, upstream_sink, false) => {}
        _ = pump_messages(&session, resource_id, upstream_stream, client_sink, true) => {}
    }

    session.record_state(resource_id, Milestone::Closed);
    session.on_socket_closed(socket_id);
    debug!(session_id = %session.session_id(), resource_id, "WebSocket relay closed");
}

/// Forward messages one way until either side closes. Text and binary
/// messages are recorded; control frames pass through.
async fn pump_messages<S, K>(
    session: &RequestSession,
    resource_id: ResourceId,
    mut source: S,
    mut sink: K,
    from_server: bool,
) where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(session_id = %session.session_id(), resource_id, error = %e, "WebSocket stream error");
                break;
            }
        };
        match &message {
            Message::Text(text) => {
                session.record_websocket_message(
                    Some(resource_id),
                    Bytes::copy_from_slice(text.as_bytes()),
                    false,
                    from_server,
                );
            }
            Message::Binary(data) => {
                session.record_websocket_message(
                    Some(resource_id),
                    Bytes::copy_from_slice(data),
                    true,
                    from_server,
                );
            }
            _ => {}
        }
        let is_close = message.is_close();
        if sink.send(message).await.is_err() || is_close {
            break;
        }
    }
}
