//! Request Session
//!
//! Root per-session context. Owns every session-scoped table:
//!
//! - resources and the sockets they ride on
//! - the milestone tracker
//! - the websocket message broker
//! - the upstream proxy slot
//! - the origin socket pool
//! - the request blocking rules
//!
//! Relays call into the session as protocol events fire; collaborators
//! observe the session through `subscribe()` and the websocket surface.
//! Nothing in here panics or propagates on a socket-level failure: open
//! resources are resolved with a typed `ResourceError` instead.
//!
//! Locks are `std::sync::Mutex` and are never held across an await point.
//! The state lock and the broker lock are never held at the same time.

use crate::mitm::error::{ResourceError, Result};
use crate::mitm::origin_pool::{OriginPool, DEFAULT_MAX_SOCKETS_PER_ORIGIN};
use crate::mitm::resource::{
    is_redirect_status, Resource, ResourceHeaders, ResourceId, ResourceInit, ResourceType,
    SocketId, SocketRecord,
};
use crate::mitm::resource_state::{now_millis, Milestone, ResourceStateTracker, ResourceStatesRow};
use crate::mitm::storage::SessionDb;
use crate::mitm::stream::SocketCounters;
use crate::mitm::upstream_proxy::{UpstreamProxyManager, UpstreamProxyProvider};
use crate::mitm::websocket_messages::{
    ListenerId, WebsocketListener, WebsocketMessage, WebsocketMessageBroker,
    WebsocketMessageEvent,
};
use base64::Engine;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A redirect target is matched to the next request for it within this window
pub const REDIRECT_WINDOW: Duration = Duration::from_secs(5);

/// Default capacity of the resource event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Lifecycle events delivered to collaborators
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    WillBeRequested(Resource),
    Loaded(LoadedResource),
    Failed {
        resource: Resource,
        error: ResourceError,
    },
}

/// Completed resource with its captured body
#[derive(Debug, Clone)]
pub struct LoadedResource {
    pub resource: Resource,
    body: Option<Bytes>,
}

impl LoadedResource {
    /// Captured response body, `None` when nothing was captured
    pub fn body(&self) -> Option<Bytes> {
        self.body.clone()
    }
}

/// Body answered when every request bypasses the origin
pub const EMPTY_DOCUMENT: &str = "<html lang=\"en\"><body>Empty</body></html>";

/// Local answer for a blocked request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl BlockedResponse {
    /// `200` with no body
    pub fn empty() -> Self {
        Self {
            status: 200,
            content_type: "text/plain",
            body: Bytes::new(),
        }
    }

    pub fn empty_document() -> Self {
        Self {
            status: 200,
            content_type: "text/html",
            body: Bytes::from_static(EMPTY_DOCUMENT.as_bytes()),
        }
    }
}

/// Custom block decision. `Some` answers the request locally.
pub type BlockHandler = Arc<dyn Fn(&Resource) -> Option<BlockedResponse> + Send + Sync>;

/// Requests answered locally instead of being sent upstream
#[derive(Clone, Default)]
pub struct BlockedResources {
    pub types: Vec<ResourceType>,
    /// Substrings matched against the full URL
    pub urls: Vec<String>,
    pub handler: Option<BlockHandler>,
}

impl BlockedResources {
    fn matches(&self, resource: &Resource) -> Option<BlockedResponse> {
        if let Some(response) = self.handler.as_ref().and_then(|handler| handler(resource)) {
            return Some(response);
        }
        let blocked = self.types.contains(&resource.resource_type)
            || self.urls.iter().any(|fragment| resource.url.contains(fragment.as_str()));
        blocked.then(BlockedResponse::empty)
    }
}

/// Construction options for a session
pub struct SessionOptions {
    pub mitm_enabled: bool,
    pub event_capacity: usize,
    pub proxy_provider: Option<Arc<dyn UpstreamProxyProvider>>,
    pub static_proxy: Option<String>,
    pub proxy_acquire_timeout: Duration,
    pub db: Option<Arc<SessionDb>>,
    pub max_sockets_per_origin: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mitm_enabled: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            proxy_provider: None,
            static_proxy: None,
            proxy_acquire_timeout: Duration::from_secs(30),
            db: None,
            max_sockets_per_origin: DEFAULT_MAX_SOCKETS_PER_ORIGIN,
        }
    }
}

struct RedirectHop {
    target_url: String,
    from_url: String,
    first_url: String,
    at: Instant,
}

#[derive(Default)]
struct SessionState {
    last_resource_id: ResourceId,
    resources: HashMap<ResourceId, Resource>,
    open_resources: HashSet<ResourceId>,
    unsaved_resources: BTreeSet<ResourceId>,
    sockets: HashMap<SocketId, SocketRecord>,
    socket_counters: HashMap<SocketId, Arc<SocketCounters>>,
    socket_resources: HashMap<SocketId, Vec<ResourceId>>,
    redirects: Vec<RedirectHop>,
    tracker: ResourceStateTracker,
}

impl SessionState {
    /// Record a milestone and retire the resource if it is terminal.
    fn record(&mut self, resource_id: ResourceId, milestone: Milestone, at: i64) -> Option<i64> {
        let stored = self.tracker.record(resource_id, milestone, at);
        if stored.is_some() && milestone.is_terminal() {
            self.open_resources.remove(&resource_id);
        }
        stored
    }

    fn sync_socket(&mut self, socket_id: SocketId) {
        let Some(counters) = self.socket_counters.get(&socket_id).cloned() else {
            return;
        };
        if let Some(socket) = self.sockets.get_mut(&socket_id) {
            socket.sync_counters(&counters);
        }
    }

    fn open_on_socket(&self, socket_id: SocketId) -> Vec<ResourceId> {
        self.socket_resources
            .get(&socket_id)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.open_resources.contains(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Per-browser-session interception context
pub struct RequestSession {
    session_id: String,
    mitm_enabled: AtomicBool,
    current_command_id: Mutex<Option<u64>>,
    state: Mutex<SessionState>,
    websockets: Mutex<WebsocketMessageBroker>,
    upstream_proxy: UpstreamProxyManager,
    origin_pool: OriginPool,
    events: broadcast::Sender<ResourceEvent>,
    cancel: CancellationToken,
    db: Option<Arc<SessionDb>>,
    pending_pushes: AtomicUsize,
    blocked: RwLock<BlockedResources>,
    bypass_all: AtomicBool,
    closed: AtomicBool,
}

impl RequestSession {
    pub fn new(session_id: impl Into<String>, options: SessionOptions) -> Arc<Self> {
        let session_id = session_id.into();
        let cancel = CancellationToken::new();
        let upstream_proxy = match options.static_proxy {
            Some(url) => UpstreamProxyManager::with_static(session_id.clone(), url),
            None => UpstreamProxyManager::new(
                session_id.clone(),
                options.proxy_provider,
                options.proxy_acquire_timeout,
                cancel.child_token(),
            ),
        };
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        debug!(session_id = %session_id, mitm_enabled = options.mitm_enabled, "Session created");

        Arc::new(Self {
            session_id,
            mitm_enabled: AtomicBool::new(options.mitm_enabled),
            current_command_id: Mutex::new(None),
            state: Mutex::new(SessionState::default()),
            websockets: Mutex::new(WebsocketMessageBroker::new()),
            upstream_proxy,
            origin_pool: OriginPool::new(options.max_sockets_per_origin),
            events,
            cancel,
            db: options.db,
            pending_pushes: AtomicUsize::new(0),
            blocked: RwLock::new(BlockedResources::default()),
            bypass_all: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_websockets(&self) -> MutexGuard<'_, WebsocketMessageBroker> {
        self.websockets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ResourceEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_mitm_enabled(&self) -> bool {
        self.mitm_enabled.load(Ordering::SeqCst)
    }

    /// Toggle interception for connections classified from now on. Tunnels
    /// opened while it is off are relayed byte-for-byte with no records.
    pub fn set_mitm_enabled(&self, enabled: bool) {
        self.mitm_enabled.store(enabled, Ordering::SeqCst);
        info!(session_id = %self.session_id, enabled, "MITM toggled");
    }

    /// Command id stamped onto websocket messages received from now on
    pub fn set_command_id(&self, command_id: Option<u64>) {
        *self
            .current_command_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = command_id;
    }

    pub fn current_command_id(&self) -> Option<u64> {
        *self
            .current_command_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token canceled when the session closes; relays select on children of it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn upstream_proxy(&self) -> &UpstreamProxyManager {
        &self.upstream_proxy
    }

    pub fn origin_pool(&self) -> &OriginPool {
        &self.origin_pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------

    pub fn register_socket(&self, socket: SocketRecord) -> SocketId {
        let id = socket.id;
        debug!(session_id = %self.session_id, socket_id = id, host = %socket.host, port = socket.port, "Socket registered");
        let mut state = self.lock_state();
        state.sockets.insert(id, socket);
        state.socket_counters.entry(id).or_default();
        state.socket_resources.entry(id).or_default();
        id
    }

    /// Traffic counters fed by the socket's stream.
    pub fn socket_counters(&self, socket_id: SocketId) -> Option<Arc<SocketCounters>> {
        self.lock_state().socket_counters.get(&socket_id).cloned()
    }

    /// Mutate a socket record in place (addresses, ALPN, byte counters).
    pub fn update_socket(&self, socket_id: SocketId, update: impl FnOnce(&mut SocketRecord)) {
        if let Some(socket) = self.lock_state().sockets.get_mut(&socket_id) {
            update(socket);
        }
    }

    pub fn socket(&self, socket_id: SocketId) -> Option<SocketRecord> {
        let mut state = self.lock_state();
        state.sync_socket(socket_id);
        state.sockets.get(&socket_id).cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.lock_state().sockets.len()
    }

    /// Stamp a socket-level milestone on the socket and every open resource
    /// currently attached to it.
    pub fn record_socket_milestone(&self, socket_id: SocketId, milestone: Milestone) {
        let at = now_millis();
        let mut state = self.lock_state();
        let Some(socket) = state.sockets.get_mut(&socket_id) else {
            return;
        };
        if !socket.stamp(milestone, at) {
            return;
        }
        for resource_id in state.open_on_socket(socket_id) {
            state.record(resource_id, milestone, at);
        }
    }

    /// Attach a resource to a socket opened after the resource was created.
    /// The resource inherits the socket's milestones.
    pub fn attach_socket(&self, resource_id: ResourceId, socket_id: SocketId) {
        let mut state = self.lock_state();
        let Some(milestones) = state.sockets.get(&socket_id).map(|s| s.milestones.clone()) else {
            return;
        };
        let Some(resource) = state.resources.get_mut(&resource_id) else {
            return;
        };
        resource.socket_id = Some(socket_id);
        state.unsaved_resources.insert(resource_id);
        let attached = state.socket_resources.entry(socket_id).or_default();
        if !attached.contains(&resource_id) {
            attached.push(resource_id);
        }
        for (milestone, at) in milestones {
            state.record(resource_id, milestone, at);
        }
    }

    /// The socket closed. Resources still open on it fail with `ConnectionClosed`.
    pub fn on_socket_closed(&self, socket_id: SocketId) {
        let at = now_millis();
        let failed = {
            let mut state = self.lock_state();
            state.sync_socket(socket_id);
            let Some(socket) = state.sockets.get_mut(&socket_id) else {
                return;
            };
            if !socket.mark_closed(at) {
                return;
            }
            debug!(session_id = %self.session_id, socket_id, "Socket closed");
            self.terminate_open(&mut state, socket_id, at, "socket closed")
        };
        self.emit_failures(failed);
    }

    /// The socket errored. Resources still open on it are marked errored
    /// and fail with `ConnectionClosed`, once each.
    pub fn on_socket_error(&self, socket_id: SocketId, error: &str) {
        let at = now_millis();
        let failed = {
            let mut state = self.lock_state();
            state.sync_socket(socket_id);
            let Some(socket) = state.sockets.get_mut(&socket_id) else {
                return;
            };
            if !socket.mark_errored(at, error) {
                return;
            }
            warn!(session_id = %self.session_id, socket_id, error = %error, "Socket error");
            self.terminate_open(&mut state, socket_id, at, error)
        };
        self.emit_failures(failed);
    }

    /// Close and forget a socket.
    pub fn deregister_socket(&self, socket_id: SocketId) -> Option<SocketRecord> {
        self.on_socket_closed(socket_id);
        let mut state = self.lock_state();
        state.socket_resources.remove(&socket_id);
        state.socket_counters.remove(&socket_id);
        state.sockets.remove(&socket_id)
    }

    fn terminate_open(
        &self,
        state: &mut SessionState,
        socket_id: SocketId,
        at: i64,
        reason: &str,
    ) -> Vec<(Resource, ResourceError)> {
        let open = state.open_on_socket(socket_id);
        let mut failed = Vec::with_capacity(open.len());
        for resource_id in open {
            state.record(resource_id, Milestone::Errored, at);
            if let Some(resource) = state.resources.get(&resource_id) {
                failed.push((
                    resource.clone(),
                    ResourceError::ConnectionClosed(reason.to_string()),
                ));
            }
        }
        failed
    }

    fn emit_failures(&self, failed: Vec<(Resource, ResourceError)>) {
        for (resource, error) in failed {
            debug!(session_id = %self.session_id, resource_id = resource.id, error = %error, "Resource failed");
            self.emit(ResourceEvent::Failed { resource, error });
        }
    }

    // ------------------------------------------------------------------
    // Blocking
    // ------------------------------------------------------------------

    pub fn set_blocked_resources(&self, blocked: BlockedResources) {
        debug!(
            session_id = %self.session_id,
            types = blocked.types.len(),
            urls = blocked.urls.len(),
            has_handler = blocked.handler.is_some(),
            "Blocked resources updated"
        );
        *self.blocked.write().unwrap_or_else(|e| e.into_inner()) = blocked;
    }

    /// Answer every request with an empty document without contacting
    /// any origin.
    pub fn set_bypass_all_with_empty_response(&self, bypass: bool) {
        self.bypass_all.store(bypass, Ordering::SeqCst);
    }

    /// Local response for `resource` if it must not reach the origin.
    pub fn blocked_response(&self, resource: &Resource) -> Option<BlockedResponse> {
        if self.bypass_all.load(Ordering::SeqCst) {
            return Some(BlockedResponse::empty_document());
        }
        let rules = self.blocked.read().unwrap_or_else(|e| e.into_inner()).clone();
        rules.matches(resource)
    }

    /// Record a locally answered request as blocked.
    pub fn resource_blocked(&self, resource_id: ResourceId, response: &BlockedResponse) {
        self.set_response(
            resource_id,
            response.status,
            ResourceHeaders::from_pairs(vec![("Content-Type", response.content_type)]),
        );
        if let Some(resource) = self.resource(resource_id) {
            info!(session_id = %self.session_id, resource_id, url = %resource.url, "Request blocked");
            self.resource_failed(resource_id, ResourceError::Blocked(resource.url));
        }
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Register a new resource. Returns `None` once the session is closed.
    pub fn create_resource(&self, init: ResourceInit) -> Option<Resource> {
        if self.is_closed() {
            return None;
        }

        let resource = {
            let mut state = self.lock_state();
            state.last_resource_id += 1;
            let id = state.last_resource_id;
            let mut resource = Resource::from_init(id, &self.session_id, init);

            state
                .redirects
                .retain(|hop| hop.at.elapsed() <= REDIRECT_WINDOW);
            if let Some(pos) = state
                .redirects
                .iter()
                .position(|hop| hop.target_url == resource.url)
            {
                let hop = state.redirects.remove(pos);
                resource.is_from_redirect = true;
                resource.previous_url = Some(hop.from_url);
                resource.first_redirecting_url = Some(hop.first_url);
            }

            let inherited = resource
                .socket_id
                .and_then(|sid| state.sockets.get(&sid))
                .map(|s| s.milestones.clone())
                .unwrap_or_default();
            if let Some(socket_id) = resource.socket_id {
                state.socket_resources.entry(socket_id).or_default().push(id);
            }

            state.resources.insert(id, resource.clone());
            state.open_resources.insert(id);
            state.unsaved_resources.insert(id);
            for (milestone, at) in inherited {
                state.record(id, milestone, at);
            }
            state.record(id, Milestone::Created, now_millis());
            resource
        };

        debug!(
            session_id = %self.session_id,
            resource_id = resource.id,
            method = %resource.method,
            url = %resource.url,
            "Resource will be requested"
        );
        self.emit(ResourceEvent::WillBeRequested(resource.clone()));
        Some(resource)
    }

    pub fn resource(&self, resource_id: ResourceId) -> Option<Resource> {
        self.lock_state().resources.get(&resource_id).cloned()
    }

    /// Most recent resource for `method` + `url`
    pub fn find_resource(&self, method: &str, url: &str) -> Option<Resource> {
        self.lock_state()
            .resources
            .values()
            .filter(|r| r.method.eq_ignore_ascii_case(method) && r.url == url)
            .max_by_key(|r| r.id)
            .cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.lock_state().resources.len()
    }

    pub fn is_resource_open(&self, resource_id: ResourceId) -> bool {
        self.lock_state().open_resources.contains(&resource_id)
    }

    /// Record a milestone at the current time
    pub fn record_state(&self, resource_id: ResourceId, milestone: Milestone) -> Option<i64> {
        self.record_state_at(resource_id, milestone, now_millis())
    }

    pub fn record_state_at(
        &self,
        resource_id: ResourceId,
        milestone: Milestone,
        timestamp: i64,
    ) -> Option<i64> {
        self.lock_state().record(resource_id, milestone, timestamp)
    }

    /// Milestones of a resource in recorded order
    pub fn resource_states(&self, resource_id: ResourceId) -> Vec<(Milestone, i64)> {
        self.lock_state().tracker.snapshot(resource_id)
    }

    pub fn resource_states_row(&self, resource_id: ResourceId) -> ResourceStatesRow {
        self.lock_state().tracker.row(resource_id)
    }

    /// Store response status and headers; remembers redirect targets.
    pub fn set_response(&self, resource_id: ResourceId, status: u16, headers: ResourceHeaders) {
        let mut state = self.lock_state();
        let Some(resource) = state.resources.get_mut(&resource_id) else {
            return;
        };
        resource.set_response(status, headers);

        let hop = match (&resource.redirected_to_url, is_redirect_status(status)) {
            (Some(target), true) => Some(RedirectHop {
                target_url: target.clone(),
                from_url: resource.url.clone(),
                first_url: resource
                    .first_redirecting_url
                    .clone()
                    .unwrap_or_else(|| resource.url.clone()),
                at: Instant::now(),
            }),
            _ => None,
        };
        state.unsaved_resources.insert(resource_id);
        if let Some(hop) = hop {
            debug!(session_id = %self.session_id, resource_id, to = %hop.target_url, "Redirect recorded");
            state.redirects.push(hop);
        }
    }

    pub fn mark_served_from_cache(&self, resource_id: ResourceId) {
        let mut state = self.lock_state();
        if let Some(resource) = state.resources.get_mut(&resource_id) {
            resource.served_from_cache = true;
            state.unsaved_resources.insert(resource_id);
        }
        state.record(resource_id, Milestone::ServedFromCache, now_millis());
    }

    /// The exchange completed. Emits `Loaded` once.
    pub fn resource_loaded(&self, resource_id: ResourceId, body: Option<Bytes>) {
        let resource = {
            let mut state = self.lock_state();
            if !state.open_resources.remove(&resource_id) {
                return;
            }
            state.tracker.record(resource_id, Milestone::BodyReceived, now_millis());
            state.resources.get(&resource_id).cloned()
        };
        if let Some(resource) = resource {
            debug!(
                session_id = %self.session_id,
                resource_id,
                status = ?resource.status,
                "Resource loaded"
            );
            self.emit(ResourceEvent::Loaded(LoadedResource { resource, body }));
        }
    }

    /// The exchange failed. Records `Errored` (or `Blocked`) and emits `Failed` once.
    pub fn resource_failed(&self, resource_id: ResourceId, error: ResourceError) {
        let milestone = match error {
            ResourceError::Blocked(_) => Milestone::Blocked,
            _ => Milestone::Errored,
        };
        self.fail_resource(resource_id, error, milestone);
    }

    /// Fail with an explicit terminal milestone.
    pub(crate) fn fail_resource(
        &self,
        resource_id: ResourceId,
        error: ResourceError,
        milestone: Milestone,
    ) {
        let resource = {
            let mut state = self.lock_state();
            if !state.open_resources.contains(&resource_id) {
                return;
            }
            state.record(resource_id, milestone, now_millis());
            state.open_resources.remove(&resource_id);
            state.resources.get(&resource_id).cloned()
        };
        if let Some(resource) = resource {
            self.emit_failures(vec![(resource, error)]);
        }
    }

    pub(crate) fn push_started(&self) {
        self.pending_pushes.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn push_finished(&self) {
        self.pending_pushes.fetch_sub(1, Ordering::SeqCst);
    }

    /// Push promises not yet resolved or failed
    pub fn pending_push_count(&self) -> usize {
        self.pending_pushes.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // WebSocket messages
    // ------------------------------------------------------------------

    /// Record a relayed frame. Frames without a resource are dropped.
    pub fn record_websocket_message(
        &self,
        resource_id: Option<ResourceId>,
        message: Bytes,
        is_binary: bool,
        is_from_server: bool,
    ) -> Option<WebsocketMessage> {
        if self.is_closed() {
            debug!(session_id = %self.session_id, "Dropping websocket message after close");
            return None;
        }
        let event = WebsocketMessageEvent {
            resource_id,
            message,
            is_binary,
            is_from_server,
            timestamp: now_millis(),
            received_at_command_id: self.current_command_id(),
        };
        self.lock_websockets().record(event)
    }

    pub fn get_messages(&self, resource_id: ResourceId) -> Vec<WebsocketMessage> {
        self.lock_websockets().get_messages(resource_id)
    }

    /// Replays recorded history, then delivers new messages.
    pub fn listen(&self, resource_id: ResourceId, listener: WebsocketListener) -> ListenerId {
        self.lock_websockets().listen(resource_id, listener)
    }

    pub fn unlisten(&self, resource_id: ResourceId, listener_id: ListenerId) -> bool {
        self.lock_websockets().unlisten(resource_id, listener_id)
    }

    pub fn unflushed_message_count(&self) -> usize {
        self.lock_websockets().unflushed_count()
    }

    // ------------------------------------------------------------------
    // Persistence and teardown
    // ------------------------------------------------------------------

    /// Write dirty state rows, resources and unflushed messages.
    pub async fn flush(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let (rows, resources) = {
            let mut state = self.lock_state();
            let rows = state.tracker.take_dirty_rows();
            let unsaved = std::mem::take(&mut state.unsaved_resources);
            let resources: Vec<Resource> = unsaved
                .iter()
                .filter_map(|id| state.resources.get(id).cloned())
                .collect();
            (rows, resources)
        };
        let messages = self.lock_websockets().take_unflushed();

        if let Err(e) = db.save_websocket_messages(&messages).await {
            warn!(session_id = %self.session_id, error = %e, count = messages.len(), "Failed to flush websocket messages");
            self.lock_websockets().restore_unflushed(messages);
            self.restore_unsaved(&rows, &resources);
            return Err(e.into());
        }
        if let Err(e) = db.save_resource_states(&rows).await {
            warn!(session_id = %self.session_id, error = %e, count = rows.len(), "Failed to flush resource states");
            self.restore_unsaved(&rows, &resources);
            return Err(e.into());
        }
        if let Err(e) = db.save_resources(&resources).await {
            warn!(session_id = %self.session_id, error = %e, count = resources.len(), "Failed to flush resources");
            self.restore_unsaved(&[], &resources);
            return Err(e.into());
        }

        debug!(
            session_id = %self.session_id,
            states = rows.len(),
            resources = resources.len(),
            messages = messages.len(),
            "Session flushed"
        );
        Ok(())
    }

    /// Requeue rows and resources a failed flush did not write.
    fn restore_unsaved(&self, rows: &[ResourceStatesRow], resources: &[Resource]) {
        let mut state = self.lock_state();
        state.tracker.mark_dirty(rows.iter().map(|r| r.resource_id));
        state
            .unsaved_resources
            .extend(resources.iter().map(|r| r.id));
    }

    /// Rows and resources waiting for the next flush
    pub fn unflushed_state_count(&self) -> (usize, usize) {
        let state = self.lock_state();
        (state.tracker.dirty_count(), state.unsaved_resources.len())
    }

    /// Close the session: fail open resources, flush, then release sockets
    /// and the upstream proxy. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.session_id, "Closing session");

        let at = now_millis();
        let failed: Vec<(Resource, ResourceError)> = {
            let mut state = self.lock_state();
            let open: Vec<ResourceId> = state.open_resources.iter().copied().collect();
            let mut failed = Vec::with_capacity(open.len());
            for resource_id in open {
                state.record(resource_id, Milestone::PrematurelyClosed, at);
                if let Some(resource) = state.resources.get(&resource_id) {
                    failed.push((resource.clone(), ResourceError::Canceled));
                }
            }
            let ids: Vec<SocketId> = state.sockets.keys().copied().collect();
            for socket_id in ids {
                state.sync_socket(socket_id);
                if let Some(socket) = state.sockets.get_mut(&socket_id) {
                    socket.mark_closed(at);
                }
            }
            failed
        };
        self.emit_failures(failed);

        if let Err(e) = self.flush().await {
            warn!(session_id = %self.session_id, error = %e, "Final session flush failed");
        }

        self.cancel.cancel();
        self.origin_pool.clear();
        self.upstream_proxy.close().await;
        debug!(session_id = %self.session_id, "Session closed");
    }
}

/// Process-wide map of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<RequestSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<RequestSession>) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.session_id().to_string(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<RequestSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<RequestSession>> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the session named by a `Proxy-Authorization` header value.
    pub fn from_proxy_authorization(&self, header: &str) -> Option<Arc<RequestSession>> {
        session_id_from_proxy_authorization(header).and_then(|id| self.get(&id))
    }

    /// Remove and close every session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<RequestSession>> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.close().await;
        }
    }
}

/// Session id from `Basic base64(user:sessionId)`
pub fn session_id_from_proxy_authorization(header: &str) -> Option<String> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_, session_id) = decoded.split_once(':')?;
    (!session_id.is_empty()).then(|| session_id.to_string())
}
