//! HTTP/2 MITM Handler
//!
//! Relays browser-facing HTTP/2 sessions onto an origin-facing session
//! using the `h2` crate on both legs. One `OriginHttp2Session` per origin
//! is shared by every browser tunnel of a request session:
//!
//! - each browser stream becomes a Resource on the origin socket
//! - blocked requests are answered locally and never reach the origin
//! - the shared response cache may answer a stream without an origin fetch
//! - origin PUSH_PROMISEs go through `PushPromiseHandler` and are replayed
//!   to the browser on the parent stream when it accepts pushes
//! - connection termination, stream resets, SETTINGS, browser PINGs and
//!   ALTSVC/ORIGIN frames are fed to each browser's `Http2SessionBinding`
//!
//! Flow control: chunks are forwarded as they arrive and the receive window
//! is released once the chunk has been handed to the other leg.
//!
//! ## Limitations
//!
//! - Extended CONNECT (WebSocket over HTTP/2) is not relayed

use crate::mitm::error::ResourceError;
use crate::mitm::frame_tap::{FrameParser, FrameTap};
use crate::mitm::http2_binding::{
    ClientSessionCommand, H2ClientSessionHandle, H2ServerSessionHandle, Http2Event,
    Http2SessionBinding, Http2SessionControl, RemoteSettings,
};
use crate::mitm::http2_push::PushPromiseHandler;
use crate::mitm::interceptor::ConnectionContext;
use crate::mitm::request_session::{BlockedResponse, RequestSession};
use crate::mitm::resource::{ResourceHeaders, ResourceId, ResourceInit, SocketId};
use crate::mitm::resource_state::Milestone;
use crate::mitm::response_cache::{plan_request, CachePlan, CachedHttpResponse};
use crate::mitm::stream::BodyCapture;
use bytes::Bytes;
use h2::client::{PushPromise, PushedResponseFuture, SendRequest};
use h2::server::{SendPushedResponse, SendResponse};
use h2::{RecvStream, SendStream};
use http::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Origin events buffered for bindings that fall behind
const ORIGIN_EVENT_CAPACITY: usize = 64;

/// HTTP/2 MITM configuration
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Initial flow control window (per stream) - default: 64KB
    pub initial_window_size: u32,

    /// Connection-level window - default: 1MB
    pub initial_connection_window_size: u32,

    /// Max concurrent streams accepted from the browser - default: 100
    pub max_concurrent_streams: u32,

    /// Max frame size - default: 16KB
    pub max_frame_size: u32,

    /// Accept server push from origins
    pub enable_server_push: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: 65535,                // 64KB
            initial_connection_window_size: 1_048_576, // 1MB
            max_concurrent_streams: 100,
            max_frame_size: 16384, // 16KB
            enable_server_push: true,
        }
    }
}

/// HTTP/2 MITM errors
#[derive(Debug, Error)]
pub enum H2Error {
    #[error("Client handshake failed: {0}")]
    ClientHandshakeFailed(#[source] h2::Error),

    #[error("Upstream handshake failed: {0}")]
    UpstreamHandshakeFailed(#[source] h2::Error),

    #[error("Accept stream failed: {0}")]
    AcceptFailed(String),

    #[error("Upstream request failed: {0}")]
    UpstreamRequestFailed(String),

    #[error("Upstream response failed: {0}")]
    UpstreamResponseFailed(String),

    #[error("Client response failed: {0}")]
    ClientResponseFailed(String),

    #[error("Stream reset: {0:?}")]
    StreamReset(h2::Reason),
}

/// Map the end of the origin connection to a binding event
pub fn server_termination_event(result: &Result<(), h2::Error>) -> Http2Event {
    match result {
        Ok(()) => Http2Event::ServerClose,
        Err(e) if e.is_go_away() && e.is_remote() => Http2Event::ServerGoAway {
            code: e.reason().map(u32::from).unwrap_or(0),
        },
        Err(e) => Http2Event::ServerError {
            message: e.to_string(),
        },
    }
}

/// Origin-facing HTTP/2 session, shared by every browser tunnel of a
/// session to the same origin.
pub struct OriginHttp2Session {
    session: Arc<RequestSession>,
    socket_id: Option<SocketId>,
    origin: String,
    sender: SendRequest<Bytes>,
    control: Arc<H2ServerSessionHandle>,
    events: broadcast::Sender<Http2Event>,
}

impl OriginHttp2Session {
    /// Handshake with the origin and drive the connection in the background.
    /// Its end is recorded on `ctx`'s socket and broadcast to bindings.
    pub async fn connect<U>(
        upstream_io: U,
        ctx: &ConnectionContext,
        config: &Http2Config,
    ) -> Result<Arc<Self>, H2Error>
    where
        U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let origin = ctx.origin();
        let (events, _) = broadcast::channel(ORIGIN_EVENT_CAPACITY);
        let frame_events = events.clone();
        let frame_origin = origin.clone();
        let upstream_io = FrameTap::new(upstream_io, FrameParser::origin(), move |frame| {
            if let Some(event) = frame.into_origin_event(&frame_origin) {
                let _ = frame_events.send(event);
            }
        });

        let (sender, mut connection) = h2::client::Builder::new()
            .enable_push(config.enable_server_push)
            .initial_window_size(config.initial_window_size)
            .initial_connection_window_size(config.initial_connection_window_size)
            .max_frame_size(config.max_frame_size)
            .handshake(upstream_io)
            .await
            .map_err(H2Error::UpstreamHandshakeFailed)?;
        ctx.socket_milestone(Milestone::Http2SessionCreated);

        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        if let Some(ping_pong) = connection.ping_pong() {
            H2ServerSessionHandle::spawn_pinger(ping_pong, ping_rx);
        }

        let session = Arc::clone(&ctx.session);
        let socket_id = ctx.socket_id;
        let driver_events = events.clone();
        let cancel = session.cancellation_token();
        let driver_session = Arc::clone(&session);
        let driver = tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                result = connection => result,
            };
            if let Some(socket_id) = socket_id {
                match &result {
                    Ok(()) => driver_session.on_socket_closed(socket_id),
                    Err(e) => {
                        debug!(session_id = %driver_session.session_id(), error = %e, "HTTP/2 upstream connection ended");
                        driver_session.on_socket_error(socket_id, &e.to_string());
                    }
                }
            }
            let _ = driver_events.send(server_termination_event(&result));
        });

        let settings_events = events.clone();
        let settings_upstream = sender.clone();
        tokio::spawn(async move {
            if let Ok(ready) = settings_upstream.ready().await {
                let _ = settings_events.send(Http2Event::RemoteSettings(RemoteSettings {
                    max_concurrent_streams: ready.current_max_send_streams(),
                    extended_connect_protocol: ready.is_extended_connect_protocol_enabled(),
                }));
            }
        });

        debug!(session_id = %session.session_id(), origin = %origin, "Origin HTTP/2 session created");
        Ok(Arc::new(Self {
            session,
            socket_id,
            origin,
            sender,
            control: Arc::new(H2ServerSessionHandle::new(ping_tx, driver.abort_handle())),
            events,
        }))
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed() || self.control.is_destroyed()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Http2Event> {
        self.events.subscribe()
    }

    /// Tear the origin connection down.
    pub fn close(&self) {
        self.control.close(0);
        if let Some(socket_id) = self.socket_id {
            self.session.on_socket_closed(socket_id);
        }
    }
}

/// Relay an HTTP/2 connection over a dedicated origin session until either
/// side ends it.
pub async fn handle_http2_mitm<C, U>(
    client_io: C,
    upstream_io: U,
    ctx: Arc<ConnectionContext>,
    config: Http2Config,
) -> Result<(), H2Error>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let origin = OriginHttp2Session::connect(upstream_io, &ctx, &config).await?;
    let result = serve_http2_client(client_io, Arc::clone(&origin), ctx, config).await;
    origin.close();
    result
}

/// Serve one browser-facing HTTP/2 connection onto `origin`. The origin
/// session outlives the browser connection.
pub async fn serve_http2_client<C>(
    client_io: C,
    origin: Arc<OriginHttp2Session>,
    ctx: Arc<ConnectionContext>,
    config: Http2Config,
) -> Result<(), H2Error>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = ctx.session.session_id().to_string();
    debug!(
        session_id = %session_id,
        host = %ctx.host,
        port = ctx.port,
        "Starting HTTP/2 MITM connection"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ping_events = events_tx.clone();
    let client_io = FrameTap::new(client_io, FrameParser::client(), move |frame| {
        if let Some(event) = frame.into_client_event() {
            let _ = ping_events.send(event);
        }
    });

    let mut client_h2 = h2::server::Builder::new()
        .initial_window_size(config.initial_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_concurrent_streams(config.max_concurrent_streams)
        .max_frame_size(config.max_frame_size)
        .handshake(client_io)
        .await
        .map_err(H2Error::ClientHandshakeFailed)?;
    debug!(session_id = %session_id, "HTTP/2 handshakes complete");

    // Bind this browser connection to the origin session
    let client_cancel = ctx.session.cancellation_token().child_token();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let client_handle = Arc::new(H2ClientSessionHandle::new(command_tx));
    let binding = Http2SessionBinding::new(
        session_id.clone(),
        origin.origin(),
        client_handle.clone(),
        origin.control.clone(),
    );
    tokio::spawn(binding.run(events_rx, client_cancel.clone()));
    tokio::spawn(forward_origin_events(
        origin.subscribe(),
        events_tx.clone(),
        client_cancel.clone(),
    ));
    // The origin may have ended before this browser arrived
    if origin.is_closed() {
        let _ = events_tx.send(Http2Event::ServerClose);
    }

    let cancel = ctx.session.cancellation_token();
    let mut commands_open = true;
    let mut stream_count = 0u64;
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session_id, "Session closed, dropping HTTP/2 connection");
                client_h2.abrupt_shutdown(h2::Reason::CANCEL);
                break Ok(());
            }
            command = command_rx.recv(), if commands_open => match command {
                Some(ClientSessionCommand::GoAway(reason)) if reason == h2::Reason::NO_ERROR => {
                    client_h2.graceful_shutdown();
                }
                Some(ClientSessionCommand::GoAway(reason)) => {
                    client_h2.abrupt_shutdown(reason);
                }
                Some(ClientSessionCommand::Destroy) => {
                    client_h2.abrupt_shutdown(h2::Reason::INTERNAL_ERROR);
                    break Ok(());
                }
                None => commands_open = false,
            },
            accepted = client_h2.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    stream_count += 1;
                    let stream_ctx = Arc::clone(&ctx);
                    let stream_upstream = origin.sender.clone();
                    let stream_events = events_tx.clone();
                    tokio::spawn(async move {
                        let start = Instant::now();
                        if let Err(e) =
                            proxy_h2_stream(request, respond, stream_upstream, Arc::clone(&stream_ctx), stream_events).await
                        {
                            debug!(session_id = %stream_ctx.session.session_id(), error = %e, "HTTP/2 stream error");
                        } else {
                            debug!(
                                session_id = %stream_ctx.session.session_id(),
                                duration_ms = start.elapsed().as_millis() as u64,
                                "HTTP/2 stream completed"
                            );
                        }
                    });
                }
                Some(Err(e)) => match e.reason() {
                    Some(h2::Reason::NO_ERROR) => {
                        info!(session_id = %session_id, "HTTP/2 graceful shutdown (NO_ERROR)");
                        break Ok(());
                    }
                    Some(reason) if !e.is_go_away() && !e.is_io() => {
                        warn!(session_id = %session_id, reason = ?reason, "HTTP/2 stream error, continuing");
                    }
                    _ => {
                        error!(session_id = %session_id, error = %e, "HTTP/2 accept error");
                        break Err(H2Error::AcceptFailed(e.to_string()));
                    }
                },
                None => break Ok(()),
            },
        }
    };

    client_handle.mark_closed();
    client_cancel.cancel();

    info!(
        session_id = %session_id,
        host = %ctx.host,
        stream_count,
        "HTTP/2 MITM connection closed"
    );
    result
}

/// Copy origin events into one browser binding until it goes away.
async fn forward_origin_events(
    mut origin_events: broadcast::Receiver<Http2Event>,
    binding: mpsc::UnboundedSender<Http2Event>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = origin_events.recv() => event,
        };
        match event {
            Ok(event) => {
                if binding.send(event).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "HTTP/2 binding lagged behind origin events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Proxy a single browser stream.
async fn proxy_h2_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    upstream: SendRequest<Bytes>,
    ctx: Arc<ConnectionContext>,
    events: mpsc::UnboundedSender<Http2Event>,
) -> Result<(), H2Error> {
    let (mut parts, recv_body) = request.into_parts();
    let url = ctx.url_for(&parts.uri);
    let init = ctx.resource_init(
        ResourceInit::new(
            parts.method.as_str(),
            url.clone(),
            ResourceHeaders::from_header_map(&parts.headers),
        )
        .http2(true),
    );
    let Some(resource) = ctx.session.create_resource(init) else {
        respond.send_reset(h2::Reason::REFUSED_STREAM);
        return Ok(());
    };
    let resource_id = resource.id;

    if let Some(blocked) = ctx.session.blocked_response(&resource) {
        ctx.session.resource_blocked(resource_id, &blocked);
        return send_blocked(&mut respond, &blocked);
    }

    let plan = plan_request(&ctx.response_cache, &url, &parts.method, &mut parts.headers).await;
    if let CachePlan::Serve(entry) = &plan {
        debug!(session_id = %ctx.session.session_id(), resource_id, url = %url, "Serving from cache");
        return serve_cached(&mut respond, entry, &ctx, resource_id);
    }

    let mut upstream = match upstream.ready().await {
        Ok(upstream) => upstream,
        Err(e) => {
            return Err(fail_stream(
                &mut respond,
                &ctx,
                resource_id,
                e.reason().unwrap_or(h2::Reason::REFUSED_STREAM),
                H2Error::UpstreamRequestFailed(e.to_string()),
            ))
        }
    };

    // 1. Request headers to the origin
    let end_of_stream = recv_body.is_end_stream();
    let (mut response_future, send_body) =
        match upstream.send_request(Request::from_parts(parts, ()), end_of_stream) {
            Ok(sent) => sent,
            Err(e) => {
                return Err(fail_stream(
                    &mut respond,
                    &ctx,
                    resource_id,
                    e.reason().unwrap_or(h2::Reason::REFUSED_STREAM),
                    H2Error::UpstreamRequestFailed(e.to_string()),
                ))
            }
        };
    ctx.session.record_state(resource_id, Milestone::RequestSent);

    // 2. Request body in the background
    if !end_of_stream {
        tokio::spawn(forward_request_body(recv_body, send_body));
    }

    // 3. Response headers, replaying pushes that arrive first
    let stream_id = response_future.stream_id().as_u32();
    let mut push_promises = response_future.push_promises();
    let mut pushes_open = true;
    let response = loop {
        tokio::select! {
            biased;
            push = push_promises.push_promise(), if pushes_open => match push {
                Some(Ok(promise)) => start_push(&ctx, resource_id, promise, &mut respond),
                Some(Err(e)) => {
                    debug!(session_id = %ctx.session.session_id(), error = %e, "Push promise stream ended");
                    pushes_open = false;
                }
                None => pushes_open = false,
            },
            result = &mut response_future => break result,
        }
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            if let (true, Some(reason)) = (e.is_reset(), e.reason()) {
                let _ = events.send(Http2Event::FrameError {
                    stream_id: Some(stream_id),
                    error_code: reason.into(),
                });
            }
            return Err(fail_stream(
                &mut respond,
                &ctx,
                resource_id,
                e.reason().unwrap_or(h2::Reason::INTERNAL_ERROR),
                H2Error::UpstreamResponseFailed(e.to_string()),
            ));
        }
    };

    let (parts, mut upstream_body) = response.into_parts();
    ctx.session.record_state(resource_id, Milestone::HeadersReceived);
    if let Some(alt) = parts
        .headers
        .get(http::header::ALT_SVC)
        .and_then(|v| v.to_str().ok())
    {
        let _ = events.send(Http2Event::AltSvc {
            origin: ctx.origin(),
            alt: alt.to_string(),
        });
    }

    // A 304 to our own validator is answered from the cache
    if let (CachePlan::Revalidate(entry), StatusCode::NOT_MODIFIED) = (&plan, parts.status) {
        debug!(session_id = %ctx.session.session_id(), resource_id, url = %url, "Revalidated cached response");
        return serve_cached(&mut respond, entry, &ctx, resource_id);
    }

    let status = parts.status;
    let response_headers = parts.headers.clone();
    ctx.session.set_response(
        resource_id,
        status.as_u16(),
        ResourceHeaders::from_header_map(&parts.headers),
    );

    // 4. Response headers to the browser
    let body_done = upstream_body.is_end_stream();
    let mut client_body = match respond.send_response(Response::from_parts(parts, ()), body_done) {
        Ok(send) => send,
        Err(e) => {
            ctx.session
                .resource_failed(resource_id, ResourceError::Protocol(e.to_string()));
            return Err(H2Error::ClientResponseFailed(e.to_string()));
        }
    };

    // 5. Response body, still accepting pushes on the parent stream
    let mut capture = BodyCapture::new(ctx.max_captured_body);
    if !body_done {
        loop {
            tokio::select! {
                // Pushes must go out before the parent stream ends
                biased;
                push = push_promises.push_promise(), if pushes_open => match push {
                    Some(Ok(promise)) => start_push(&ctx, resource_id, promise, &mut respond),
                    _ => pushes_open = false,
                },
                chunk = upstream_body.data() => match chunk {
                    Some(Ok(data)) => {
                        capture.push(&data);
                        if let Err(e) = forward_chunk(&mut client_body, &mut upstream_body, data) {
                            ctx.session.resource_failed(resource_id, ResourceError::Protocol(e.to_string()));
                            return Err(H2Error::ClientResponseFailed(e.to_string()));
                        }
                    }
                    Some(Err(e)) => {
                        client_body.send_reset(e.reason().unwrap_or(h2::Reason::INTERNAL_ERROR));
                        ctx.session.resource_failed(resource_id, ResourceError::Protocol(e.to_string()));
                        return Err(H2Error::UpstreamResponseFailed(e.to_string()));
                    }
                    None => break,
                },
            }
        }
        finish_body(&mut client_body, &mut upstream_body).await;
    }

    // 6. Cache and report
    let body = capture.finish();
    if status == StatusCode::OK && plan.is_cacheable() {
        if let Some(body) = &body {
            ctx.response_cache
                .lock()
                .await
                .add(&url, body.clone(), &response_headers);
        }
    }
    ctx.session.resource_loaded(resource_id, body);
    Ok(())
}

/// Reset the browser stream and fail its resource.
fn fail_stream(
    respond: &mut SendResponse<Bytes>,
    ctx: &ConnectionContext,
    resource_id: ResourceId,
    reason: h2::Reason,
    error: H2Error,
) -> H2Error {
    respond.send_reset(reason);
    ctx.session
        .resource_failed(resource_id, ResourceError::Protocol(error.to_string()));
    error
}

fn serve_cached(
    respond: &mut SendResponse<Bytes>,
    entry: &CachedHttpResponse,
    ctx: &ConnectionContext,
    resource_id: ResourceId,
) -> Result<(), H2Error> {
    let head = entry
        .response_head()
        .map_err(|e| H2Error::ClientResponseFailed(e.to_string()))?;
    ctx.session.mark_served_from_cache(resource_id);
    ctx.session.set_response(
        resource_id,
        head.status().as_u16(),
        ResourceHeaders::from_header_map(head.headers()),
    );

    let empty = entry.body.is_empty();
    let mut send = respond
        .send_response(head, empty)
        .map_err(|e| H2Error::ClientResponseFailed(e.to_string()))?;
    if !empty {
        send.send_data(entry.body.clone(), true)
            .map_err(|e| H2Error::ClientResponseFailed(e.to_string()))?;
    }
    ctx.session.resource_loaded(resource_id, Some(entry.body.clone()));
    Ok(())
}

/// Answer a blocked stream locally.
fn send_blocked(respond: &mut SendResponse<Bytes>, blocked: &BlockedResponse) -> Result<(), H2Error> {
    let head = Response::builder()
        .status(blocked.status)
        .header(http::header::CONTENT_TYPE, blocked.content_type)
        .body(())
        .map_err(|e| H2Error::ClientResponseFailed(e.to_string()))?;
    let empty = blocked.body.is_empty();
    let mut send = respond
        .send_response(head, empty)
        .map_err(|e| H2Error::ClientResponseFailed(e.to_string()))?;
    if !empty {
        send.send_data(blocked.body.clone(), true)
            .map_err(|e| H2Error::ClientResponseFailed(e.to_string()))?;
    }
    Ok(())
}

/// Forward one chunk and release the sender's window.
fn forward_chunk(
    send: &mut SendStream<Bytes>,
    recv: &mut RecvStream,
    data: Bytes,
) -> Result<(), h2::Error> {
    let len = data.len();
    send.reserve_capacity(len);
    send.send_data(data, false)?;
    recv.flow_control().release_capacity(len)
}

/// Forward trailers if any, otherwise end the stream.
async fn finish_body(send: &mut SendStream<Bytes>, recv: &mut RecvStream) {
    match recv.trailers().await {
        Ok(Some(trailers)) => {
            let _ = send.send_trailers(trailers);
        }
        _ => {
            let _ = send.send_data(Bytes::new(), true);
        }
    }
}

/// Stream a body to completion, capturing up to `limit` bytes.
async fn relay_body(
    mut recv: RecvStream,
    mut send: SendStream<Bytes>,
    limit: usize,
) -> Result<Option<Bytes>, h2::Error> {
    let mut capture = BodyCapture::new(limit);
    while let Some(chunk) = recv.data().await {
        let data = chunk?;
        capture.push(&data);
        forward_chunk(&mut send, &mut recv, data)?;
    }
    finish_body(&mut send, &mut recv).await;
    Ok(capture.finish())
}

async fn forward_request_body(mut recv_body: RecvStream, mut send_body: SendStream<Bytes>) {
    let mut request_size = 0u64;
    while let Some(chunk) = recv_body.data().await {
        match chunk {
            Ok(data) => {
                request_size += data.len() as u64;
                if let Err(e) = forward_chunk(&mut send_body, &mut recv_body, data) {
                    debug!(error = %e, "Failed to forward request body chunk");
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "Request body read error");
                send_body.send_reset(e.reason().unwrap_or(h2::Reason::CANCEL));
                return;
            }
        }
    }
    finish_body(&mut send_body, &mut recv_body).await;
    debug!(request_size, "Request body forwarded");
}

/// Register a push promise and replay it to the browser when it accepts
/// pushes. A refused or blocked push is dropped, which resets the pushed
/// stream.
fn start_push(
    ctx: &Arc<ConnectionContext>,
    parent_id: ResourceId,
    promise: PushPromise,
    respond: &mut SendResponse<Bytes>,
) {
    let (request, pushed_response) = promise.into_parts();
    let (parts, ()) = request.into_parts();
    let Some(mut handler) =
        PushPromiseHandler::create(Arc::clone(&ctx.session), parent_id, &parts, ctx.socket_id)
    else {
        return;
    };
    // Dropping the pushed response cancels the pushed stream
    if ctx.session.blocked_response(handler.resource()).is_some() {
        handler.block();
        return;
    }

    match respond.push_request(Request::from_parts(parts, ())) {
        Ok(pushed_respond) => {
            ctx.session
                .record_state(handler.resource_id(), Milestone::ClientPushSent);
            tokio::spawn(relay_push(
                handler,
                pushed_response,
                pushed_respond,
                Arc::clone(ctx),
            ));
        }
        Err(e) => {
            debug!(
                session_id = %ctx.session.session_id(),
                resource_id = handler.resource_id(),
                error = %e,
                "Browser refused push"
            );
            handler.refuse();
        }
    }
}

async fn relay_push(
    mut handler: PushPromiseHandler,
    pushed_response: PushedResponseFuture,
    mut pushed_respond: SendPushedResponse<Bytes>,
    ctx: Arc<ConnectionContext>,
) {
    handler.await_response();
    let cancel = ctx.session.cancellation_token();

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            pushed_respond.send_reset(h2::Reason::CANCEL);
            handler.fail(ResourceError::Canceled, Milestone::PrematurelyClosed);
            return;
        }
        response = pushed_response => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            pushed_respond.send_reset(e.reason().unwrap_or(h2::Reason::CANCEL));
            handler.fail(ResourceError::Protocol(e.to_string()), Milestone::Errored);
            return;
        }
    };

    let (parts, body) = response.into_parts();
    handler.resolve(
        parts.status.as_u16(),
        ResourceHeaders::from_header_map(&parts.headers),
    );

    let body_done = body.is_end_stream();
    let send = match pushed_respond.send_response(Response::from_parts(parts, ()), body_done) {
        Ok(send) => send,
        Err(e) => {
            handler.fail(ResourceError::Protocol(e.to_string()), Milestone::Errored);
            return;
        }
    };
    if body_done {
        handler.complete(Some(Bytes::new()));
        return;
    }

    match relay_body(body, send, ctx.max_captured_body).await {
        Ok(captured) => handler.complete(captured),
        Err(e) => {
            handler.fail(ResourceError::Protocol(e.to_string()), Milestone::Errored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http2_config_defaults() {
        let config = Http2Config::default();

        assert_eq!(config.initial_window_size, 65535);
        assert_eq!(config.initial_connection_window_size, 1_048_576);
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.max_frame_size, 16384);
        assert!(config.enable_server_push);
    }

    #[test]
    fn test_http2_config_custom() {
        let config = Http2Config {
            initial_window_size: 131072, // 128KB
            enable_server_push: false,
            ..Default::default()
        };

        assert_eq!(config.initial_window_size, 131072);
        assert!(!config.enable_server_push);
    }

    #[test]
    fn test_clean_end_is_server_close() {
        assert_eq!(server_termination_event(&Ok(())), Http2Event::ServerClose);
    }

    #[test]
    fn test_local_error_is_server_error() {
        let err = h2::Error::from(h2::Reason::PROTOCOL_ERROR);
        assert!(matches!(
            server_termination_event(&Err(err)),
            Http2Event::ServerError { .. }
        ));
    }
}
