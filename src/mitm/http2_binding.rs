//! HTTP/2 Session Binding
//!
//! Couples the browser-facing HTTP/2 session to the origin-facing one.
//! Control-plane events from either side arrive on a channel and are
//! applied in order:
//!
//! - browser PING is forwarded to the origin
//! - origin error/close destroys the browser session
//! - origin GOAWAY closes the browser session with the same code
//! - SETTINGS, frame errors, ALTSVC and ORIGIN are only observed
//!
//! Every forwarded operation first checks that the target session is still
//! open.
//!
//! Browser PINGs and origin ALTSVC/ORIGIN frames are read off the wire by
//! `FrameTap`, since `h2` never surfaces them.
//!
//! ## Limitations
//!
//! The `h2` crate only originates opaque PING payloads, so a forwarded PING
//! does not carry the browser's payload on the wire.

use crate::mitm::error::{MitmError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Origin SETTINGS as observed once the upstream session is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub max_concurrent_streams: usize,
    pub extended_connect_protocol: bool,
}

/// Control-plane event from either leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Http2Event {
    ClientPing { payload: [u8; 8] },
    ServerError { message: String },
    ServerClose,
    ServerGoAway { code: u32 },
    RemoteSettings(RemoteSettings),
    FrameError { stream_id: Option<u32>, error_code: u32 },
    AltSvc { origin: String, alt: String },
    Origin { origins: Vec<String> },
}

/// What the binding did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOutcome {
    Forwarded,
    Observed,
    ClientClosed { code: u32 },
    ClientDestroyed,
    /// Target session already closed
    Skipped,
}

/// Operations the binding performs on one HTTP/2 session
pub trait Http2SessionControl: Send + Sync {
    fn is_closed(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    fn ping(&self, payload: [u8; 8]) -> Result<()>;

    /// Graceful close with a GOAWAY code
    fn close(&self, code: u32);

    /// Immediate teardown
    fn destroy(&self, reason: Option<String>);
}

fn is_gone(session: &dyn Http2SessionControl) -> bool {
    session.is_closed() || session.is_destroyed()
}

/// Binding between one browser-facing and one origin-facing session
pub struct Http2SessionBinding {
    session_id: String,
    origin: String,
    client: Arc<dyn Http2SessionControl>,
    server: Arc<dyn Http2SessionControl>,
    pings_forwarded: AtomicU64,
    events_observed: AtomicU64,
}

impl Http2SessionBinding {
    pub fn new(
        session_id: impl Into<String>,
        origin: impl Into<String>,
        client: Arc<dyn Http2SessionControl>,
        server: Arc<dyn Http2SessionControl>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            origin: origin.into(),
            client,
            server,
            pings_forwarded: AtomicU64::new(0),
            events_observed: AtomicU64::new(0),
        }
    }

    /// Apply one event
    pub fn handle(&self, event: &Http2Event) -> BindingOutcome {
        match event {
            Http2Event::ClientPing { payload } => {
                if is_gone(self.server.as_ref()) {
                    return BindingOutcome::Skipped;
                }
                match self.server.ping(*payload) {
                    Ok(()) => {
                        self.pings_forwarded.fetch_add(1, Ordering::Relaxed);
                        BindingOutcome::Forwarded
                    }
                    Err(e) => {
                        warn!(session_id = %self.session_id, origin = %self.origin, error = %e, "Failed to forward PING");
                        BindingOutcome::Skipped
                    }
                }
            }
            Http2Event::ServerError { message } => {
                if self.client.is_destroyed() {
                    return BindingOutcome::Skipped;
                }
                warn!(session_id = %self.session_id, origin = %self.origin, error = %message, "Origin HTTP/2 session error");
                self.client.destroy(Some(message.clone()));
                BindingOutcome::ClientDestroyed
            }
            Http2Event::ServerClose => {
                if is_gone(self.client.as_ref()) {
                    return BindingOutcome::Skipped;
                }
                debug!(session_id = %self.session_id, origin = %self.origin, "Origin HTTP/2 session closed");
                self.client.destroy(None);
                BindingOutcome::ClientDestroyed
            }
            Http2Event::ServerGoAway { code } => {
                if is_gone(self.client.as_ref()) {
                    return BindingOutcome::Skipped;
                }
                info!(session_id = %self.session_id, origin = %self.origin, code, "Origin sent GOAWAY");
                self.client.close(*code);
                BindingOutcome::ClientClosed { code: *code }
            }
            other => {
                self.events_observed.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %self.session_id, origin = %self.origin, event = ?other, "HTTP/2 event observed");
                BindingOutcome::Observed
            }
        }
    }

    /// Consume events until the channel closes or `cancel` fires.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<Http2Event>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(&event);
                    }
                    None => break,
                },
            }
        }
        debug!(
            session_id = %self.session_id,
            origin = %self.origin,
            pings_forwarded = self.pings_forwarded(),
            events_observed = self.events_observed(),
            "HTTP/2 binding finished"
        );
    }

    pub fn pings_forwarded(&self) -> u64 {
        self.pings_forwarded.load(Ordering::Relaxed)
    }

    pub fn events_observed(&self) -> u64 {
        self.events_observed.load(Ordering::Relaxed)
    }
}

/// Command sent to the browser-facing accept loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSessionCommand {
    GoAway(h2::Reason),
    Destroy,
}

/// Control handle for an `h2::server::Connection` driven by an accept loop
pub struct H2ClientSessionHandle {
    commands: mpsc::UnboundedSender<ClientSessionCommand>,
    closed: AtomicBool,
    destroyed: AtomicBool,
}

impl H2ClientSessionHandle {
    pub fn new(commands: mpsc::UnboundedSender<ClientSessionCommand>) -> Self {
        Self {
            commands,
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The accept loop ended on its own
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Http2SessionControl for H2ClientSessionHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.commands.is_closed()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ping(&self, _payload: [u8; 8]) -> Result<()> {
        // The h2 server answers browser pings itself; nothing to originate.
        Err(MitmError::Http2("PING toward the browser is not originated".into()))
    }

    fn close(&self, code: u32) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .commands
            .send(ClientSessionCommand::GoAway(h2::Reason::from(code)));
    }

    fn destroy(&self, reason: Option<String>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        debug!(reason = ?reason, "Destroying browser-facing HTTP/2 session");
        let _ = self.commands.send(ClientSessionCommand::Destroy);
    }
}

/// Control handle for an `h2::client::Connection` driven in its own task
pub struct H2ServerSessionHandle {
    pings: mpsc::UnboundedSender<[u8; 8]>,
    driver: AbortHandle,
    closed: AtomicBool,
    destroyed: AtomicBool,
}

impl H2ServerSessionHandle {
    pub fn new(pings: mpsc::UnboundedSender<[u8; 8]>, driver: AbortHandle) -> Self {
        Self {
            pings,
            driver,
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Spawn the task that owns the connection's `PingPong`.
    pub fn spawn_pinger(mut ping_pong: h2::PingPong, mut payloads: mpsc::UnboundedReceiver<[u8; 8]>) {
        tokio::spawn(async move {
            while let Some(payload) = payloads.recv().await {
                match ping_pong.ping(h2::Ping::opaque()).await {
                    Ok(_) => debug!(payload = ?payload, "Forwarded PING acknowledged by origin"),
                    Err(e) => {
                        debug!(error = %e, "Origin PING failed");
                        break;
                    }
                }
            }
        });
    }
}

impl Http2SessionControl for H2ServerSessionHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.driver.is_finished()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ping(&self, payload: [u8; 8]) -> Result<()> {
        self.pings
            .send(payload)
            .map_err(|_| MitmError::Http2("origin session no longer accepts PING".into()))
    }

    fn close(&self, _code: u32) {
        // h2 clients cannot originate GOAWAY; dropping the driver closes the socket.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.driver.abort();
        }
    }

    fn destroy(&self, _reason: Option<String>) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.closed.store(true, Ordering::SeqCst);
            self.driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSession {
        closed: AtomicBool,
        destroyed: AtomicBool,
        pings: Mutex<Vec<[u8; 8]>>,
        close_codes: Mutex<Vec<u32>>,
    }

    impl Http2SessionControl for FakeSession {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn is_destroyed(&self) -> bool {
            self.destroyed.load(Ordering::SeqCst)
        }

        fn ping(&self, payload: [u8; 8]) -> Result<()> {
            self.pings.lock().unwrap().push(payload);
            Ok(())
        }

        fn close(&self, code: u32) {
            self.closed.store(true, Ordering::SeqCst);
            self.close_codes.lock().unwrap().push(code);
        }

        fn destroy(&self, _reason: Option<String>) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    fn binding() -> (Http2SessionBinding, Arc<FakeSession>, Arc<FakeSession>) {
        let client = Arc::new(FakeSession::default());
        let server = Arc::new(FakeSession::default());
        let binding = Http2SessionBinding::new(
            "s1",
            "https://a.test:443",
            client.clone() as Arc<dyn Http2SessionControl>,
            server.clone() as Arc<dyn Http2SessionControl>,
        );
        (binding, client, server)
    }

    #[test]
    fn test_client_ping_forwarded_with_payload() {
        let (binding, _client, server) = binding();
        let payload = *b"12345678";

        assert_eq!(
            binding.handle(&Http2Event::ClientPing { payload }),
            BindingOutcome::Forwarded
        );
        assert_eq!(*server.pings.lock().unwrap(), vec![payload]);
        assert_eq!(binding.pings_forwarded(), 1);
    }

    #[test]
    fn test_ping_skipped_after_server_closed() {
        let (binding, _client, server) = binding();
        server.closed.store(true, Ordering::SeqCst);

        assert_eq!(
            binding.handle(&Http2Event::ClientPing { payload: [0; 8] }),
            BindingOutcome::Skipped
        );
        assert!(server.pings.lock().unwrap().is_empty());
    }

    #[test]
    fn test_goaway_propagates_code() {
        let (binding, client, _server) = binding();

        assert_eq!(
            binding.handle(&Http2Event::ServerGoAway { code: 2 }),
            BindingOutcome::ClientClosed { code: 2 }
        );
        assert_eq!(*client.close_codes.lock().unwrap(), vec![2]);

        // Second GOAWAY finds the client already closed
        assert_eq!(
            binding.handle(&Http2Event::ServerGoAway { code: 0 }),
            BindingOutcome::Skipped
        );
    }

    #[test]
    fn test_server_error_destroys_client_once() {
        let (binding, client, _server) = binding();
        let event = Http2Event::ServerError {
            message: "connection reset".into(),
        };

        assert_eq!(binding.handle(&event), BindingOutcome::ClientDestroyed);
        assert!(client.is_destroyed());
        assert_eq!(binding.handle(&event), BindingOutcome::Skipped);
    }

    #[test]
    fn test_diagnostic_events_observed_only() {
        let (binding, client, server) = binding();
        let events = vec![
            Http2Event::RemoteSettings(RemoteSettings {
                max_concurrent_streams: 100,
                extended_connect_protocol: false,
            }),
            Http2Event::FrameError {
                stream_id: Some(3),
                error_code: 1,
            },
            Http2Event::AltSvc {
                origin: "https://a.test".into(),
                alt: "h3=\":443\"".into(),
            },
            Http2Event::Origin {
                origins: vec!["https://b.test".into()],
            },
        ];

        for event in &events {
            assert_eq!(binding.handle(event), BindingOutcome::Observed);
        }
        assert_eq!(binding.events_observed(), 4);
        assert!(!client.is_closed() && !client.is_destroyed());
        assert!(!server.is_closed() && !server.is_destroyed());
    }

    #[tokio::test]
    async fn test_run_processes_in_order_until_channel_closes() {
        let (binding, client, server) = binding();
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(Http2Event::ClientPing { payload: [1; 8] }).unwrap();
        tx.send(Http2Event::ServerGoAway { code: 0 }).unwrap();
        drop(tx);

        binding.run(rx, CancellationToken::new()).await;

        assert_eq!(server.pings.lock().unwrap().len(), 1);
        assert_eq!(*client.close_codes.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_client_handle_sends_commands_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = H2ClientSessionHandle::new(tx);

        handle.close(0);
        handle.close(0);
        handle.destroy(None);
        handle.destroy(None);

        assert_eq!(
            rx.recv().await,
            Some(ClientSessionCommand::GoAway(h2::Reason::NO_ERROR))
        );
        assert_eq!(rx.recv().await, Some(ClientSessionCommand::Destroy));
        assert!(rx.try_recv().is_err());
    }
}
