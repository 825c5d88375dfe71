//! Origin socket pool
//!
//! Session-scoped reuse of origin connections:
//!
//! - HTTP/1 legs are capped per origin; a request beyond the cap waits for
//!   a leg to be checked back in or for a slot to free up
//! - one live HTTP/2 session per origin is shared by every browser tunnel
//! - the ALPN an origin selected is remembered so later tunnels skip the dial
//!
//! Upgraded (WebSocket) legs leave HTTP and are never pooled.

use crate::mitm::http2_mitm::OriginHttp2Session;
use crate::mitm::resource::SocketId;
use crate::mitm::stream::HeadLog;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// HTTP/1 sockets kept per origin
pub const DEFAULT_MAX_SOCKETS_PER_ORIGIN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub is_ssl: bool,
    pub host: String,
    pub port: u16,
}

impl OriginKey {
    pub fn new(is_ssl: bool, host: impl Into<String>, port: u16) -> Self {
        Self {
            is_ssl,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_ssl { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A handshaken HTTP/1 origin connection
pub struct Http1Leg {
    pub socket_id: SocketId,
    pub sender: SendRequest<Incoming>,
    /// Bytes read from the origin since the last request went out
    pub response_heads: HeadLog,
    permit: Option<OwnedSemaphorePermit>,
}

impl Http1Leg {
    pub fn new(
        socket_id: SocketId,
        sender: SendRequest<Incoming>,
        response_heads: HeadLog,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            socket_id,
            sender,
            response_heads,
            permit,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Counted against its origin's socket cap
    pub fn is_pooled(&self) -> bool {
        self.permit.is_some()
    }
}

/// Outcome of asking the pool for an HTTP/1 leg
pub enum Http1Acquired {
    /// An idle leg, ready for the next request
    Idle(Http1Leg),
    /// A free slot; the caller opens the socket
    Open(OwnedSemaphorePermit),
    /// The pool was cleared
    Closed,
}

struct OriginSlot {
    alpn: Option<Vec<u8>>,
    permits: Arc<Semaphore>,
    idle: Vec<Http1Leg>,
    waiters: VecDeque<oneshot::Sender<Http1Leg>>,
    http2: Option<Arc<OriginHttp2Session>>,
}

impl OriginSlot {
    fn new(max_sockets: usize) -> Self {
        Self {
            alpn: None,
            permits: Arc::new(Semaphore::new(max_sockets)),
            idle: Vec::new(),
            waiters: VecDeque::new(),
            http2: None,
        }
    }
}

pub struct OriginPool {
    max_sockets_per_origin: usize,
    origins: Mutex<HashMap<OriginKey, OriginSlot>>,
    closed: AtomicBool,
}

impl OriginPool {
    pub fn new(max_sockets_per_origin: usize) -> Self {
        Self {
            max_sockets_per_origin: max_sockets_per_origin.max(1),
            origins: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OriginKey, OriginSlot>> {
        self.origins.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_sockets_per_origin(&self) -> usize {
        self.max_sockets_per_origin
    }

    /// An idle leg to `key`, a slot to open one, or a wait for either.
    pub async fn acquire_http1(&self, key: &OriginKey) -> Http1Acquired {
        let (permits, handoff) = {
            let mut origins = self.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Http1Acquired::Closed;
            }
            let slot = origins
                .entry(key.clone())
                .or_insert_with(|| OriginSlot::new(self.max_sockets_per_origin));
            while let Some(leg) = slot.idle.pop() {
                if !leg.is_closed() {
                    return Http1Acquired::Idle(leg);
                }
            }
            match Arc::clone(&slot.permits).try_acquire_owned() {
                Ok(permit) => return Http1Acquired::Open(permit),
                Err(tokio::sync::TryAcquireError::Closed) => return Http1Acquired::Closed,
                Err(tokio::sync::TryAcquireError::NoPermits) => {}
            }
            slot.waiters.retain(|w| !w.is_closed());
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(tx);
            (Arc::clone(&slot.permits), rx)
        };
        debug!(origin = %key, "Waiting for an origin socket");

        tokio::select! {
            biased;
            Ok(leg) = handoff => Http1Acquired::Idle(leg),
            Ok(permit) = permits.acquire_owned() => Http1Acquired::Open(permit),
            else => Http1Acquired::Closed,
        }
    }

    /// Return a leg after its response completed. Waiters are served first.
    pub fn checkin_http1(&self, key: &OriginKey, leg: Http1Leg) {
        if leg.is_closed() || !leg.is_pooled() {
            return;
        }
        let mut origins = self.lock();
        let Some(slot) = origins.get_mut(key) else {
            return;
        };
        let mut leg = leg;
        while let Some(waiter) = slot.waiters.pop_front() {
            match waiter.send(leg) {
                Ok(()) => return,
                Err(returned) => leg = returned,
            }
        }
        slot.idle.push(leg);
    }

    pub fn idle_count(&self, key: &OriginKey) -> usize {
        self.lock().get(key).map(|slot| slot.idle.len()).unwrap_or(0)
    }

    /// HTTP/1 sockets to `key` currently counted against the cap
    pub fn open_count(&self, key: &OriginKey) -> usize {
        self.lock()
            .get(key)
            .map(|slot| self.max_sockets_per_origin - slot.permits.available_permits())
            .unwrap_or(0)
    }

    /// ALPN the origin selected on its last TLS dial
    pub fn alpn(&self, key: &OriginKey) -> Option<Vec<u8>> {
        self.lock().get(key).and_then(|slot| slot.alpn.clone())
    }

    pub fn set_alpn(&self, key: &OriginKey, alpn: Option<Vec<u8>>) {
        let mut origins = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let slot = origins
            .entry(key.clone())
            .or_insert_with(|| OriginSlot::new(self.max_sockets_per_origin));
        slot.alpn = alpn;
    }

    /// The shared HTTP/2 session to `key`, if it is still open
    pub fn http2_session(&self, key: &OriginKey) -> Option<Arc<OriginHttp2Session>> {
        let mut origins = self.lock();
        let slot = origins.get_mut(key)?;
        match &slot.http2 {
            Some(session) if !session.is_closed() => Some(Arc::clone(session)),
            Some(_) => {
                slot.http2 = None;
                None
            }
            None => None,
        }
    }

    pub fn set_http2_session(&self, key: &OriginKey, session: Arc<OriginHttp2Session>) {
        let mut origins = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let slot = origins
            .entry(key.clone())
            .or_insert_with(|| OriginSlot::new(self.max_sockets_per_origin));
        slot.http2 = Some(session);
    }

    /// Drop every idle leg and shared session and refuse further requests.
    pub fn clear(&self) {
        let drained: Vec<OriginSlot> = {
            let mut origins = self.lock();
            self.closed.store(true, Ordering::SeqCst);
            origins.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            slot.permits.close();
            if let Some(session) = slot.http2 {
                session.close();
            }
        }
    }
}

impl Default for OriginPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SOCKETS_PER_ORIGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::stream::HEAD_LOG_LIMIT;
    use hyper_util::rt::TokioIo;
    use std::time::Duration;

    async fn leg(permit: Option<OwnedSemaphorePermit>) -> (Http1Leg, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(near))
            .await
            .unwrap();
        tokio::spawn(conn);
        let leg = Http1Leg::new(
            crate::mitm::resource::next_socket_id(),
            sender,
            HeadLog::keep_oldest(HEAD_LOG_LIMIT),
            permit,
        );
        (leg, far)
    }

    fn open(acquired: Http1Acquired) -> OwnedSemaphorePermit {
        match acquired {
            Http1Acquired::Open(permit) => permit,
            _ => panic!("expected a free slot"),
        }
    }

    #[test]
    fn test_origin_key_normalizes_host() {
        let key = OriginKey::new(true, "Example.COM", 443);
        assert_eq!(key, OriginKey::new(true, "example.com", 443));
        assert_ne!(key, OriginKey::new(false, "example.com", 443));
        assert_eq!(key.to_string(), "https://example.com:443");
    }

    #[tokio::test]
    async fn test_sockets_capped_per_origin() {
        let pool = OriginPool::new(2);
        let key = OriginKey::new(false, "a.test", 80);
        let _first = open(pool.acquire_http1(&key).await);
        let second = open(pool.acquire_http1(&key).await);
        assert_eq!(pool.open_count(&key), 2);

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire_http1(&key)).await;
        assert!(waiting.is_err());

        // Other origins are unaffected
        let other = OriginKey::new(false, "b.test", 80);
        assert!(matches!(pool.acquire_http1(&other).await, Http1Acquired::Open(_)));

        drop(second);
        assert!(matches!(pool.acquire_http1(&key).await, Http1Acquired::Open(_)));
    }

    #[tokio::test]
    async fn test_checkin_hands_leg_to_waiter() {
        let pool = Arc::new(OriginPool::new(1));
        let key = OriginKey::new(false, "a.test", 80);
        let permit = open(pool.acquire_http1(&key).await);
        let (leg, _far) = leg(Some(permit)).await;
        let socket_id = leg.socket_id;

        let waiter = {
            let pool = Arc::clone(&pool);
            let key = key.clone();
            tokio::spawn(async move { pool.acquire_http1(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.checkin_http1(&key, leg);

        match waiter.await.unwrap() {
            Http1Acquired::Idle(leg) => assert_eq!(leg.socket_id, socket_id),
            _ => panic!("expected the checked-in leg"),
        }
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[tokio::test]
    async fn test_idle_leg_reused_and_closed_leg_dropped() {
        let pool = OriginPool::new(2);
        let key = OriginKey::new(false, "a.test", 80);
        let (first, _far) = leg(Some(open(pool.acquire_http1(&key).await))).await;
        let socket_id = first.socket_id;
        pool.checkin_http1(&key, first);
        assert_eq!(pool.idle_count(&key), 1);

        match pool.acquire_http1(&key).await {
            Http1Acquired::Idle(leg) => {
                assert_eq!(leg.socket_id, socket_id);
                pool.checkin_http1(&key, leg);
            }
            _ => panic!("expected the idle leg"),
        }

        // A leg whose origin went away is not handed out again
        let (second, far) = leg(Some(open(pool.acquire_http1(&key).await))).await;
        drop(far);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.checkin_http1(&key, second);
        assert_eq!(pool.idle_count(&key), 1);
    }

    #[tokio::test]
    async fn test_unpooled_leg_not_kept() {
        let pool = OriginPool::new(2);
        let key = OriginKey::new(false, "a.test", 80);
        let (leg, _far) = leg(None).await;
        pool.checkin_http1(&key, leg);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[tokio::test]
    async fn test_clear_refuses_and_wakes_waiters() {
        let pool = Arc::new(OriginPool::new(1));
        let key = OriginKey::new(true, "a.test", 443);
        pool.set_alpn(&key, Some(b"http/1.1".to_vec()));
        assert_eq!(pool.alpn(&key), Some(b"http/1.1".to_vec()));
        let _held = open(pool.acquire_http1(&key).await);

        let waiter = {
            let pool = Arc::clone(&pool);
            let key = key.clone();
            tokio::spawn(async move { pool.acquire_http1(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.clear();

        assert!(matches!(waiter.await.unwrap(), Http1Acquired::Closed));
        assert!(matches!(pool.acquire_http1(&key).await, Http1Acquired::Closed));
        assert!(pool.alpn(&key).is_none());
    }
}
