//! HTTP/2 Push Promise Handler
//!
//! Materializes an origin PUSH_PROMISE as a synthetic resource correlated
//! to the request that triggered it. Per pushed stream:
//!
//! ```text
//! Created -> AwaitingResponse -> Resolved
//!                 |
//!                 +-> Errored
//! ```
//!
//! The pending response is always settled, with an error when the pushed
//! stream resets or the session closes, and teardown runs exactly once
//! whichever path triggers it.

use crate::mitm::error::ResourceError;
use crate::mitm::request_session::RequestSession;
use crate::mitm::resource::{Resource, ResourceHeaders, ResourceId, ResourceInit, SocketId};
use crate::mitm::resource_state::Milestone;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Lifecycle of one pushed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Created,
    AwaitingResponse,
    Resolved,
    Errored,
}

/// Response head of a pushed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedResponse {
    pub status: u16,
    pub headers: ResourceHeaders,
}

/// Settles once with the pushed response or the reason it never came
pub type PushResponseReceiver = oneshot::Receiver<Result<PushedResponse, ResourceError>>;

pub struct PushPromiseHandler {
    session: Arc<RequestSession>,
    resource: Resource,
    state: PushState,
    response_tx: Option<oneshot::Sender<Result<PushedResponse, ResourceError>>>,
    response_rx: Option<PushResponseReceiver>,
    registered: bool,
}

impl PushPromiseHandler {
    /// Register the synthetic resource for a promise received while
    /// `parent_id` was in flight. `None` when the session records nothing.
    pub fn create(
        session: Arc<RequestSession>,
        parent_id: ResourceId,
        request: &http::request::Parts,
        socket_id: Option<SocketId>,
    ) -> Option<Self> {
        let headers = ResourceHeaders::from_header_map(&request.headers);
        let is_ssl = request.uri.scheme_str() != Some("http");
        let mut init = ResourceInit::new(request.method.as_str(), request.uri.to_string(), headers)
            .pushed_by(parent_id)
            .ssl(is_ssl);
        if let Some(socket_id) = socket_id {
            init = init.on_socket(socket_id);
        }

        let resource = session.create_resource(init)?;
        session.record_state(resource.id, Milestone::ServerPushReceived);
        session.push_started();

        debug!(
            session_id = %session.session_id(),
            resource_id = resource.id,
            parent_id,
            url = %resource.url,
            "Push promise received"
        );

        let (tx, rx) = oneshot::channel();
        Some(Self {
            session,
            resource,
            state: PushState::Created,
            response_tx: Some(tx),
            response_rx: Some(rx),
            registered: true,
        })
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource.id
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    /// The pushed stream was handed to the browser; its response is due.
    pub fn await_response(&mut self) {
        if self.state == PushState::Created {
            self.state = PushState::AwaitingResponse;
        }
    }

    /// Take the pending response. Moves the push to `AwaitingResponse`.
    pub fn response(&mut self) -> Option<PushResponseReceiver> {
        let rx = self.response_rx.take()?;
        self.await_response();
        Some(rx)
    }

    /// Response headers arrived on the pushed stream.
    pub fn resolve(&mut self, status: u16, headers: ResourceHeaders) -> bool {
        if !matches!(self.state, PushState::Created | PushState::AwaitingResponse) {
            return false;
        }
        self.state = PushState::Resolved;
        self.session
            .record_state(self.resource.id, Milestone::HeadersReceived);
        self.session
            .set_response(self.resource.id, status, headers.clone());
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Ok(PushedResponse { status, headers }));
        }
        true
    }

    /// The pushed body finished. Only valid once resolved.
    pub fn complete(&mut self, body: Option<Bytes>) {
        if self.state != PushState::Resolved {
            return;
        }
        self.session.resource_loaded(self.resource.id, body);
        self.cleanup();
    }

    /// The pushed stream failed before completing. `PrematurelyClosed`
    /// marks a push the browser never received.
    pub fn fail(&mut self, error: ResourceError, milestone: Milestone) -> bool {
        if self.state == PushState::Errored || !self.registered {
            return false;
        }
        self.state = PushState::Errored;
        debug!(
            session_id = %self.session.session_id(),
            resource_id = self.resource.id,
            error = %error,
            "Push promise failed"
        );
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
        self.session
            .fail_resource(self.resource.id, error, milestone);
        self.cleanup();
        true
    }

    /// Browser push support is off or the browser leg is HTTP/1.
    pub fn refuse(&mut self) -> bool {
        self.fail(
            ResourceError::Protocol("push refused by browser".into()),
            Milestone::PrematurelyClosed,
        )
    }

    /// The pushed resource matched the session's blocking rules.
    pub fn block(&mut self) -> bool {
        let url = self.resource.url.clone();
        self.fail(ResourceError::Blocked(url), Milestone::Blocked)
    }

    fn cleanup(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        self.response_tx.take();
        self.session.push_finished();
    }

    pub fn is_finished(&self) -> bool {
        !self.registered
    }
}

impl Drop for PushPromiseHandler {
    fn drop(&mut self) {
        if self.registered {
            self.fail(ResourceError::Canceled, Milestone::PrematurelyClosed);
        }
    }
}
