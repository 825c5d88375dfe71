//! HTTP/2 relay tests over in-memory connections
//!
//! The browser, the relay and the origin each speak `h2` on a duplex pipe:
//! - origin server pushes replayed to the browser with linked resources
//! - pushes refused when the browser disables them
//! - origin stream resets surfaced as failed resources
//! - session close tearing down the relay
//! - blocked streams answered without the origin
//! - browser PINGs forwarded to the origin
//! - browser connections sharing one origin session

use bytes::Bytes;
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::{Reason, RecvStream};
use http::{Method, Request, Response, StatusCode};
use session_mitm::mitm::frame_tap::{FrameParser, FrameTap, ObservedFrame};
use session_mitm::mitm::http2_mitm::{
    handle_http2_mitm, serve_http2_client, H2Error, Http2Config, OriginHttp2Session,
};
use session_mitm::mitm::interceptor::ConnectionContext;
use session_mitm::mitm::resource::{SocketId, SocketRecord};
use session_mitm::mitm::response_cache::HttpResponseCache;
use session_mitm::{
    BlockedResources, Milestone, RequestSession, ResourceError, ResourceEvent, SessionOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const INDEX_URL: &str = "https://example.test/index.html";
const STYLE_URL: &str = "https://example.test/style.css";
const INDEX_HTML: &[u8] = b"<html><link rel=stylesheet href=/style.css></html>";
const STYLE_CSS: &[u8] = b"body { color: black; }";

// ============================================================================
// Test Origin
// ============================================================================

async fn run_origin<T: AsyncRead + AsyncWrite + Unpin>(io: T) {
    let Ok(mut conn) = h2::server::handshake(io).await else {
        return;
    };
    while let Some(Ok((request, respond))) = conn.accept().await {
        tokio::spawn(origin_stream(request, respond));
    }
}

async fn origin_stream(request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
    match request.uri().path() {
        "/index.html" => {
            let push = Request::builder()
                .method(Method::GET)
                .uri(STYLE_URL)
                .body(())
                .unwrap();
            if let Ok(mut pushed) = respond.push_request(push) {
                let head = Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/css")
                    .body(())
                    .unwrap();
                if let Ok(mut stream) = pushed.send_response(head, false) {
                    let _ = stream.send_data(Bytes::from_static(STYLE_CSS), true);
                }
            }

            // Let the promise reach the relay ahead of the parent's headers
            tokio::time::sleep(Duration::from_millis(50)).await;

            let head = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/html")
                .body(())
                .unwrap();
            if let Ok(mut stream) = respond.send_response(head, false) {
                let _ = stream.send_data(Bytes::from_static(INDEX_HTML), true);
            }
        }
        "/reset" => respond.send_reset(Reason::REFUSED_STREAM),
        _ => {
            let head = Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(())
                .unwrap();
            let _ = respond.send_response(head, true);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn spawn_relay(
    session: &Arc<RequestSession>,
) -> (DuplexStream, JoinHandle<Result<(), H2Error>>) {
    let (browser_io, relay_client_io) = tokio::io::duplex(1 << 20);
    let (relay_upstream_io, origin_io) = tokio::io::duplex(1 << 20);
    tokio::spawn(run_origin(origin_io));

    let relay = tokio::spawn(handle_http2_mitm(
        relay_client_io,
        relay_upstream_io,
        relay_context(session, None),
        Http2Config::default(),
    ));
    (browser_io, relay)
}

fn relay_context(session: &Arc<RequestSession>, socket_id: Option<SocketId>) -> Arc<ConnectionContext> {
    Arc::new(ConnectionContext {
        session: Arc::clone(session),
        socket_id,
        host: "example.test".to_string(),
        port: 443,
        is_ssl: true,
        response_cache: HttpResponseCache::shared(16),
        max_captured_body: 1 << 20,
    })
}

async fn connect_browser(io: DuplexStream, enable_push: bool) -> SendRequest<Bytes> {
    let (client, conn) = h2::client::Builder::new()
        .enable_push(enable_push)
        .handshake(io)
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    client.ready().await.unwrap()
}

fn browser_get(url: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(())
        .unwrap()
}

async fn read_body(mut body: RecvStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    out
}

async fn wait_for_event<F>(events: &mut broadcast::Receiver<ResourceEvent>, mut matches: F) -> ResourceEvent
where
    F: FnMut(&ResourceEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not delivered in time")
}

fn milestones(session: &RequestSession, resource_id: u64) -> Vec<Milestone> {
    session
        .resource_states(resource_id)
        .into_iter()
        .map(|(m, _)| m)
        .collect()
}

// ============================================================================
// Server push
// ============================================================================

#[tokio::test]
async fn test_origin_push_replayed_to_browser() {
    let session = RequestSession::new("h2-push", SessionOptions::default());
    let mut events = session.subscribe();
    let (browser_io, _relay) = spawn_relay(&session);
    let mut browser = connect_browser(browser_io, true).await;

    let (mut response_future, _) = browser.send_request(browser_get(INDEX_URL), true).unwrap();
    let mut pushes = response_future.push_promises();
    let response = timeout(Duration::from_secs(5), response_future)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response.into_body()).await, INDEX_HTML);

    let promise = timeout(Duration::from_secs(5), pushes.push_promise())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let (push_request, pushed_response) = promise.into_parts();
    assert_eq!(push_request.uri().path(), "/style.css");
    let pushed = timeout(Duration::from_secs(5), pushed_response)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_body(pushed.into_body()).await, STYLE_CSS);

    let parent = session.find_resource("GET", INDEX_URL).unwrap();
    let child = session.find_resource("GET", STYLE_URL).unwrap();
    assert!(parent.is_http2);
    assert!(!parent.is_http2_push);
    assert!(child.is_http2_push);
    assert_eq!(child.parent_resource_id, Some(parent.id));

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ResourceEvent::Loaded(l) if l.resource.url == STYLE_URL)
    })
    .await;
    let ResourceEvent::Loaded(loaded) = event else {
        unreachable!()
    };
    assert_eq!(loaded.body().as_deref(), Some(STYLE_CSS));

    let states = milestones(&session, child.id);
    assert!(states.contains(&Milestone::ServerPushReceived));
    assert!(states.contains(&Milestone::ClientPushSent));
    assert!(states.contains(&Milestone::BodyReceived));
    assert_eq!(session.pending_push_count(), 0);
}

#[tokio::test]
async fn test_push_refused_when_browser_disables_push() {
    let session = RequestSession::new("h2-no-push", SessionOptions::default());
    let mut events = session.subscribe();
    let (browser_io, _relay) = spawn_relay(&session);
    let mut browser = connect_browser(browser_io, false).await;

    let (response_future, _) = browser.send_request(browser_get(INDEX_URL), true).unwrap();
    let response = timeout(Duration::from_secs(5), response_future)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_body(response.into_body()).await, INDEX_HTML);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ResourceEvent::Failed { resource, .. } if resource.url == STYLE_URL)
    })
    .await;
    let ResourceEvent::Failed { resource, error } = event else {
        unreachable!()
    };
    assert!(resource.is_http2_push);
    assert!(matches!(error, ResourceError::Protocol(_)));
    assert!(milestones(&session, resource.id).contains(&Milestone::PrematurelyClosed));
    assert_eq!(session.pending_push_count(), 0);
}

// ============================================================================
// Stream and session failures
// ============================================================================

#[tokio::test]
async fn test_origin_reset_fails_resource() {
    let session = RequestSession::new("h2-reset", SessionOptions::default());
    let mut events = session.subscribe();
    let (browser_io, _relay) = spawn_relay(&session);
    let mut browser = connect_browser(browser_io, true).await;

    let url = "https://example.test/reset";
    let (response_future, _) = browser.send_request(browser_get(url), true).unwrap();
    let result = timeout(Duration::from_secs(5), response_future).await.unwrap();
    assert!(result.is_err());

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ResourceEvent::Failed { resource, .. } if resource.url == url)
    })
    .await;
    let ResourceEvent::Failed { resource, .. } = event else {
        unreachable!()
    };
    assert!(milestones(&session, resource.id).contains(&Milestone::Errored));
}

#[tokio::test]
async fn test_session_close_ends_relay() {
    let session = RequestSession::new("h2-close", SessionOptions::default());
    let (browser_io, relay) = spawn_relay(&session);
    let mut browser = connect_browser(browser_io, true).await;

    let (response_future, _) = browser
        .send_request(browser_get("https://example.test/missing"), true)
        .unwrap();
    let response = timeout(Duration::from_secs(5), response_future)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    session.close().await;

    let result = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(session
        .create_resource(session_mitm::mitm::ResourceInit::new(
            "GET",
            INDEX_URL,
            Default::default()
        ))
        .is_none());
}

// ============================================================================
// Blocking
// ============================================================================

#[tokio::test]
async fn test_blocked_stream_answered_locally() {
    let session = RequestSession::new("h2-blocked", SessionOptions::default());
    session.set_blocked_resources(BlockedResources {
        urls: vec!["/index.html".into()],
        ..Default::default()
    });
    let mut events = session.subscribe();
    let (browser_io, _relay) = spawn_relay(&session);
    let mut browser = connect_browser(browser_io, true).await;

    let (response_future, _) = browser.send_request(browser_get(INDEX_URL), true).unwrap();
    let response = timeout(Duration::from_secs(5), response_future)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(read_body(response.into_body()).await.is_empty());

    let event = wait_for_event(&mut events, |e| matches!(e, ResourceEvent::Failed { .. })).await;
    let ResourceEvent::Failed { resource, error } = event else {
        unreachable!()
    };
    assert_eq!(error, ResourceError::Blocked(INDEX_URL.to_string()));
    assert!(milestones(&session, resource.id).contains(&Milestone::Blocked));
    // The origin would have pushed the stylesheet
    assert!(session.find_resource("GET", STYLE_URL).is_none());
    assert_eq!(session.resource_count(), 1);
}

// ============================================================================
// Session binding
// ============================================================================

#[tokio::test]
async fn test_browser_ping_forwarded_to_origin() {
    let session = RequestSession::new("h2-ping", SessionOptions::default());
    let (browser_io, relay_client_io) = tokio::io::duplex(1 << 20);
    let (relay_upstream_io, origin_io) = tokio::io::duplex(1 << 20);
    let (pings_tx, mut pings_rx) = mpsc::unbounded_channel();
    let origin_io = FrameTap::new(origin_io, FrameParser::client(), move |frame| {
        if let ObservedFrame::Ping { ack: false, .. } = frame {
            let _ = pings_tx.send(());
        }
    });
    tokio::spawn(run_origin(origin_io));
    let _relay = tokio::spawn(handle_http2_mitm(
        relay_client_io,
        relay_upstream_io,
        relay_context(&session, None),
        Http2Config::default(),
    ));

    let (browser, mut conn) = h2::client::handshake(browser_io).await.unwrap();
    let mut ping_pong = conn.ping_pong().unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let mut browser = browser.ready().await.unwrap();
    let (response_future, _) = browser
        .send_request(browser_get("https://example.test/missing"), true)
        .unwrap();
    timeout(Duration::from_secs(5), response_future)
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(5), ping_pong.ping(h2::Ping::opaque()))
        .await
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), pings_rx.recv())
        .await
        .expect("origin never saw a PING")
        .unwrap();
}

#[tokio::test]
async fn test_browser_connections_share_origin_session() {
    let session = RequestSession::new("h2-shared", SessionOptions::default());
    let socket_id = session.register_socket(SocketRecord::new("example.test", 443));
    let ctx = relay_context(&session, Some(socket_id));
    let (relay_upstream_io, origin_io) = tokio::io::duplex(1 << 20);
    tokio::spawn(run_origin(origin_io));
    let origin = OriginHttp2Session::connect(relay_upstream_io, &ctx, &Http2Config::default())
        .await
        .unwrap();

    let mut urls = Vec::new();
    for n in 0..2 {
        let (browser_io, relay_client_io) = tokio::io::duplex(1 << 20);
        let relay = tokio::spawn(serve_http2_client(
            relay_client_io,
            Arc::clone(&origin),
            Arc::clone(&ctx),
            Http2Config::default(),
        ));
        let mut browser = connect_browser(browser_io, true).await;
        let url = format!("https://example.test/missing-{}", n);
        let (response_future, _) = browser.send_request(browser_get(&url), true).unwrap();
        let response = timeout(Duration::from_secs(5), response_future)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        urls.push(url);

        // Hanging up the browser leaves the origin session open
        drop(browser);
        relay.abort();
        assert!(!origin.is_closed());
    }

    for url in &urls {
        let resource = session.find_resource("GET", url).unwrap();
        assert_eq!(resource.socket_id, Some(socket_id));
    }
    assert!(session.socket(socket_id).unwrap().closed_at.is_none());

    origin.close();
    assert!(origin.is_closed());
    assert!(session.socket(socket_id).unwrap().closed_at.is_some());
}
