//! End-to-end tests through the proxy listener
//!
//! A local hyper origin is driven by a hyper client speaking to the proxy:
//! - session lookup from `Proxy-Authorization`
//! - plain HTTP relay with resource recording
//! - shared response cache hits and ETag revalidation
//! - WebSocket message recording and refused upgrades
//! - origin socket reuse and per-socket byte counters
//! - blocked requests and header casing
//! - CONNECT tunnels when interception is disabled

use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use session_mitm::{
    BlockedResources, LoadedResource, Milestone, MitmProxyServer, ProxyConfig, ResourceError,
    ResourceEvent, SessionOptions,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const APP_JS: &str = "console.log('app');";
const STALE_JS: &str = "console.log('stale');";

// ============================================================================
// Test Origin
// ============================================================================

#[derive(Default)]
struct Origin {
    hits: AtomicUsize,
    connections: AtomicUsize,
    saw_validator: AtomicBool,
}

impl Origin {
    fn respond(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        match req.uri().path() {
            "/app.js" => Response::builder()
                .status(StatusCode::OK)
                .header(CACHE_CONTROL, "public, max-age=600")
                .header(ETAG, "\"app-v1\"")
                .header(CONTENT_TYPE, "application/javascript")
                .body(Full::new(Bytes::from_static(APP_JS.as_bytes())))
                .unwrap(),
            "/stale.js" => {
                let validator = req
                    .headers()
                    .get(IF_NONE_MATCH)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if validator.as_deref() == Some("\"stale-v1\"") {
                    self.saw_validator.store(true, Ordering::SeqCst);
                    return Response::builder()
                        .status(StatusCode::NOT_MODIFIED)
                        .header(ETAG, "\"stale-v1\"")
                        .body(Full::new(Bytes::new()))
                        .unwrap();
                }
                Response::builder()
                    .status(StatusCode::OK)
                    .header(CACHE_CONTROL, "no-cache")
                    .header(ETAG, "\"stale-v1\"")
                    .body(Full::new(Bytes::from_static(STALE_JS.as_bytes())))
                    .unwrap()
            }
            "/cased" => Response::builder()
                .status(StatusCode::OK)
                .header("x-origin-tag", "cased")
                .header(CACHE_CONTROL, "no-store")
                .body(Full::new(Bytes::from_static(b"ok")))
                .unwrap(),
            "/private" => Response::builder()
                .status(StatusCode::OK)
                .header(CACHE_CONTROL, "no-store")
                .header(ETAG, "\"private\"")
                .body(Full::new(Bytes::from_static(b"secret")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::new()))
                .unwrap(),
        }
    }
}

async fn spawn_origin(origin: Arc<Origin>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            origin.connections.fetch_add(1, Ordering::SeqCst);
            let origin = Arc::clone(&origin);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let origin = Arc::clone(&origin);
                    async move { Ok::<_, Infallible>(origin.respond(req)) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .title_case_headers(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Echoes every text and binary message back to the sender
async fn spawn_websocket_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    addr
}

// ============================================================================
// Proxy and browser helpers
// ============================================================================

async fn start_proxy() -> (Arc<MitmProxyServer>, SocketAddr, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = ProxyConfig {
        port: 0,
        network_db_path: dir.path().join("network.db"),
        session_db_dir: dir.path().join("sessions"),
        ..ProxyConfig::default()
    };
    let server = Arc::new(MitmProxyServer::from_config(config).await.unwrap());
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).run(listener));
    (server, addr, dir)
}

async fn connect_browser(proxy: SocketAddr) -> SendRequest<Empty<Bytes>> {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });
    sender
}

fn proxy_auth(session_id: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("browser:{}", session_id));
    format!("Basic {}", encoded)
}

async fn get(
    browser: &mut SendRequest<Empty<Bytes>>,
    url: &str,
    session_id: &str,
) -> (StatusCode, Bytes) {
    browser.ready().await.unwrap();
    let req = Request::builder()
        .method(Method::GET)
        .uri(url)
        .header(PROXY_AUTHORIZATION, proxy_auth(session_id))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = browser.send_request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

async fn next_loaded(events: &mut broadcast::Receiver<ResourceEvent>, url: &str) -> LoadedResource {
    timeout(Duration::from_secs(5), async {
        loop {
            if let ResourceEvent::Loaded(loaded) = events.recv().await.unwrap() {
                if loaded.resource.url == url {
                    return loaded;
                }
            }
        }
    })
    .await
    .expect("resource was not loaded in time")
}

async fn next_failed(events: &mut broadcast::Receiver<ResourceEvent>) -> (String, ResourceError) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let ResourceEvent::Failed { resource, error } = events.recv().await.unwrap() {
                return (resource.url, error);
            }
        }
    })
    .await
    .expect("resource did not fail in time")
}

async fn wait_until_cached(server: &MitmProxyServer, url: &str) {
    let cache = Arc::clone(server.interceptor().response_cache());
    timeout(Duration::from_secs(5), async {
        while !cache.lock().await.contains(url) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("response was not cached in time");
}

// ============================================================================
// Session lookup
// ============================================================================

#[tokio::test]
async fn test_request_without_session_gets_407() {
    let (_server, proxy, _dir) = start_proxy().await;
    let mut browser = connect_browser(proxy).await;

    let (status, _) = get(&mut browser, "http://127.0.0.1:9/app.js", "unknown").await;

    assert_eq!(status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
}

// ============================================================================
// HTTP relay
// ============================================================================

#[tokio::test]
async fn test_plain_http_exchange_recorded() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("plain", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/app.js", origin_addr);
    let mut browser = connect_browser(proxy).await;
    let (status, body) = get(&mut browser, &url, "plain").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, APP_JS.as_bytes());

    let loaded = next_loaded(&mut events, &url).await;
    assert_eq!(loaded.resource.status, Some(200));
    assert!(!loaded.resource.is_ssl);
    assert!(loaded.resource.socket_id.is_some());
    assert_eq!(loaded.body().as_deref(), Some(APP_JS.as_bytes()));

    let milestones: Vec<Milestone> = session
        .resource_states(loaded.resource.id)
        .into_iter()
        .map(|(m, _)| m)
        .collect();
    for expected in [
        Milestone::Created,
        Milestone::DnsResolved,
        Milestone::Connected,
        Milestone::RequestSent,
        Milestone::HeadersReceived,
        Milestone::BodyReceived,
    ] {
        assert!(milestones.contains(&expected), "missing {:?}", expected);
    }
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sequential_requests_reuse_origin_socket() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("reuse", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/private", origin_addr);
    let mut first_browser = connect_browser(proxy).await;
    let _ = get(&mut first_browser, &url, "reuse").await;
    let first = next_loaded(&mut events, &url).await;

    // The pool is per session, not per browser connection
    let mut second_browser = connect_browser(proxy).await;
    let _ = get(&mut second_browser, &url, "reuse").await;
    let second = next_loaded(&mut events, &url).await;

    assert!(first.resource.socket_id.is_some());
    assert_eq!(first.resource.socket_id, second.resource.socket_id);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
    assert_eq!(origin.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_socket_byte_counters_recorded() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("counters", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/app.js", origin_addr);
    let mut browser = connect_browser(proxy).await;
    let _ = get(&mut browser, &url, "counters").await;
    let loaded = next_loaded(&mut events, &url).await;

    let socket = session.socket(loaded.resource.socket_id.unwrap()).unwrap();
    assert!(socket.bytes_written > 0);
    assert!(socket.bytes_read as usize > APP_JS.len());
    let first_byte_at = socket.first_byte_at.expect("first byte time recorded");
    assert!(first_byte_at >= socket.connected_at.unwrap());
}

#[tokio::test]
async fn test_header_casing_kept_as_sent() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("casing", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/cased", origin_addr);
    let mut browser = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\nx-CUSTOM-header: 1\r\nConnection: close\r\n\r\n",
        url,
        origin_addr,
        proxy_auth("casing")
    );
    browser.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), browser.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 200"));

    let loaded = next_loaded(&mut events, &url).await;
    let sent: Vec<&str> = loaded
        .resource
        .request_headers
        .original()
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(sent, vec!["Host", "Proxy-Authorization", "x-CUSTOM-header", "Connection"]);

    let received = loaded.resource.response_headers.unwrap();
    assert!(received
        .original()
        .iter()
        .any(|(name, value)| name == "X-Origin-Tag" && value == "cased"));
    assert_eq!(received.get("x-origin-tag"), Some("cased"));
}

#[tokio::test]
async fn test_blocked_url_never_reaches_origin() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("blocked", server.session_options())
        .await
        .unwrap();
    session.set_blocked_resources(BlockedResources {
        urls: vec!["/app.js".into()],
        ..Default::default()
    });
    let mut events = session.subscribe();

    let url = format!("http://{}/app.js", origin_addr);
    let mut browser = connect_browser(proxy).await;
    let (status, body) = get(&mut browser, &url, "blocked").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(next_failed(&mut events).await, (url.clone(), ResourceError::Blocked(url.clone())));
    let resource = session.find_resource("GET", &url).unwrap();
    assert!(session
        .resource_states(resource.id)
        .iter()
        .any(|(m, _)| *m == Milestone::Blocked));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
    assert_eq!(session.socket_count(), 0);
}

#[tokio::test]
async fn test_origin_failure_reported_as_bad_gateway() {
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("refused", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    // Bind and drop to get a port nothing listens on
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let url = format!("http://{}/gone", closed);
    let mut browser = connect_browser(proxy).await;
    let (status, _) = get(&mut browser, &url, "refused").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let failed = timeout(Duration::from_secs(5), async {
        loop {
            if let ResourceEvent::Failed { resource, .. } = events.recv().await.unwrap() {
                return resource;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failed.url, url);
}

// ============================================================================
// Response cache
// ============================================================================

#[tokio::test]
async fn test_fresh_response_served_from_cache() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("cache", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/app.js", origin_addr);
    let mut browser = connect_browser(proxy).await;

    let _ = get(&mut browser, &url, "cache").await;
    let first = next_loaded(&mut events, &url).await;
    assert!(!first.resource.served_from_cache);
    // Loaded is reported only once the entry is stored
    assert!(server.interceptor().response_cache().lock().await.contains(&url));

    let (status, body) = get(&mut browser, &url, "cache").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, APP_JS.as_bytes());

    let second = next_loaded(&mut events, &url).await;
    assert!(second.resource.served_from_cache);
    assert!(session
        .resource_states(second.resource.id)
        .iter()
        .any(|(m, _)| *m == Milestone::ServedFromCache));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_response_revalidated_with_etag() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("revalidate", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/stale.js", origin_addr);
    let mut browser = connect_browser(proxy).await;

    let _ = get(&mut browser, &url, "revalidate").await;
    next_loaded(&mut events, &url).await;
    wait_until_cached(&server, &url).await;

    let (status, body) = get(&mut browser, &url, "revalidate").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, STALE_JS.as_bytes());
    assert!(origin.saw_validator.load(Ordering::SeqCst));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_no_store_response_not_cached() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("nostore", server.session_options())
        .await
        .unwrap();
    let mut events = session.subscribe();

    let url = format!("http://{}/private", origin_addr);
    let mut browser = connect_browser(proxy).await;

    let _ = get(&mut browser, &url, "nostore").await;
    next_loaded(&mut events, &url).await;
    let _ = get(&mut browser, &url, "nostore").await;
    let second = next_loaded(&mut events, &url).await;

    assert!(!second.resource.served_from_cache);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
    assert!(!server.interceptor().response_cache().lock().await.contains(&url));
}

// ============================================================================
// WebSocket
// ============================================================================

#[tokio::test]
async fn test_websocket_messages_recorded() {
    let ws_origin = spawn_websocket_origin().await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("ws", server.session_options())
        .await
        .unwrap();

    let url = format!("http://{}/socket", ws_origin);
    let mut browser = connect_browser(proxy).await;
    browser.ready().await.unwrap();
    let req = Request::builder()
        .method(Method::GET)
        .uri(&url)
        .header(PROXY_AUTHORIZATION, proxy_auth("ws"))
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = browser.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    let upgraded = hyper::upgrade::on(response).await.unwrap();
    let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;
    ws.send(Message::Text("hello".into())).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Text("hello".into()));

    let resource = session.find_resource("GET", &url).unwrap();
    assert_eq!(resource.status, Some(101));
    let messages = session.get_messages(resource.id);
    assert_eq!(messages.len(), 2);
    assert!(!messages[0].is_from_server);
    assert!(messages[1].is_from_server);
    assert_eq!(messages[1].message, Bytes::from_static(b"hello"));
}

#[tokio::test]
async fn test_refused_upgrade_closes_origin_socket() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let session = server
        .create_session("refused-ws", server.session_options())
        .await
        .unwrap();

    let url = format!("http://{}/socket", origin_addr);
    let mut browser = connect_browser(proxy).await;
    browser.ready().await.unwrap();
    let req = Request::builder()
        .method(Method::GET)
        .uri(&url)
        .header(PROXY_AUTHORIZATION, proxy_auth("refused-ws"))
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = browser.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let _ = response.into_body().collect().await.unwrap();

    let socket_id = session.find_resource("GET", &url).unwrap().socket_id.unwrap();
    timeout(Duration::from_secs(5), async {
        while session.socket(socket_id).and_then(|s| s.closed_at).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("refused upgrade socket was not closed");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

// ============================================================================
// CONNECT tunnels
// ============================================================================

#[tokio::test]
async fn test_connect_tunnels_when_mitm_disabled() {
    let origin = Arc::new(Origin::default());
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let (server, proxy, _dir) = start_proxy().await;
    let options = SessionOptions {
        mitm_enabled: false,
        ..server.session_options()
    };
    let session = server.create_session("tunnel", options).await.unwrap();

    let mut browser = connect_browser(proxy).await;
    browser.ready().await.unwrap();
    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(origin_addr.to_string())
        .header(PROXY_AUTHORIZATION, proxy_auth("tunnel"))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = browser.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut tunnel = TokioIo::new(hyper::upgrade::on(response).await.unwrap());
    let request = format!(
        "GET /app.js HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin_addr
    );
    tunnel.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), tunnel.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let raw = String::from_utf8_lossy(&raw);
    assert!(raw.starts_with("HTTP/1.1 200"));
    assert!(raw.ends_with(APP_JS));
    // Tunneled traffic is not recorded
    assert_eq!(session.resource_count(), 0);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_rejects_invalid_authority() {
    let (server, proxy, _dir) = start_proxy().await;
    server
        .create_session("bad-connect", server.session_options())
        .await
        .unwrap();

    let mut browser = connect_browser(proxy).await;
    browser.ready().await.unwrap();
    let req = Request::builder()
        .method(Method::CONNECT)
        .uri("example.org:0")
        .header(PROXY_AUTHORIZATION, proxy_auth("bad-connect"))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = browser.send_request(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
