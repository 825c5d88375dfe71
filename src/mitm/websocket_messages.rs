//! WebSocket Message Broker
//!
//! Records frames relayed over upgraded connections and fans them out to
//! listeners registered per resource. Each message is stored before any
//! listener sees it, and a listener attached late is first replayed the
//! full history for its resource.
//!
//! Listeners run while the broker is locked; they must not call back into
//! the broker.

use crate::mitm::resource::ResourceId;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handle returned by `listen`
pub type ListenerId = u64;

/// Callback invoked for every message of a resource
pub type WebsocketListener = Arc<dyn Fn(&WebsocketMessage) + Send + Sync>;

/// A recorded WebSocket frame. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebsocketMessage {
    /// Per-session message counter
    pub message_id: u64,
    pub resource_id: ResourceId,
    pub message: Bytes,
    pub is_binary: bool,
    pub is_from_server: bool,
    pub timestamp: i64,
    pub received_at_command_id: Option<u64>,
}

/// Incoming frame to be recorded
#[derive(Debug, Clone)]
pub struct WebsocketMessageEvent {
    /// `None` when the frame belongs to a connection with no resource
    pub resource_id: Option<ResourceId>,
    pub message: Bytes,
    pub is_binary: bool,
    pub is_from_server: bool,
    pub timestamp: i64,
    pub received_at_command_id: Option<u64>,
}

/// Per-session message store and fan-out
#[derive(Default)]
pub struct WebsocketMessageBroker {
    last_message_id: u64,
    next_listener_id: ListenerId,
    messages: HashMap<ResourceId, Vec<WebsocketMessage>>,
    listeners: HashMap<ResourceId, Vec<(ListenerId, WebsocketListener)>>,
    unflushed: Vec<WebsocketMessage>,
}

impl WebsocketMessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist then notify. Frames without a resource id are dropped.
    pub fn record(&mut self, event: WebsocketMessageEvent) -> Option<WebsocketMessage> {
        let Some(resource_id) = event.resource_id else {
            debug!(
                is_from_server = event.is_from_server,
                "Dropping websocket message without resource id"
            );
            return None;
        };

        self.last_message_id += 1;
        let message = WebsocketMessage {
            message_id: self.last_message_id,
            resource_id,
            message: event.message,
            is_binary: event.is_binary,
            is_from_server: event.is_from_server,
            timestamp: event.timestamp,
            received_at_command_id: event.received_at_command_id,
        };

        self.messages
            .entry(resource_id)
            .or_default()
            .push(message.clone());
        self.unflushed.push(message.clone());

        if let Some(listeners) = self.listeners.get(&resource_id) {
            for (_, listener) in listeners {
                listener(&message);
            }
        }

        Some(message)
    }

    /// Register a listener, replaying recorded history first.
    pub fn listen(&mut self, resource_id: ResourceId, listener: WebsocketListener) -> ListenerId {
        if let Some(history) = self.messages.get(&resource_id) {
            for message in history {
                listener(message);
            }
        }

        self.next_listener_id += 1;
        let id = self.next_listener_id;
        self.listeners
            .entry(resource_id)
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one listener. Returns false if it was not registered.
    pub fn unlisten(&mut self, resource_id: ResourceId, listener_id: ListenerId) -> bool {
        let Some(listeners) = self.listeners.get_mut(&resource_id) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener_id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.listeners.remove(&resource_id);
        }
        removed
    }

    /// All messages recorded for a resource, in order
    pub fn get_messages(&self, resource_id: ResourceId) -> Vec<WebsocketMessage> {
        self.messages.get(&resource_id).cloned().unwrap_or_default()
    }

    pub fn listener_count(&self, resource_id: ResourceId) -> usize {
        self.listeners.get(&resource_id).map(Vec::len).unwrap_or(0)
    }

    /// Messages not yet written to durable storage
    pub fn take_unflushed(&mut self) -> Vec<WebsocketMessage> {
        std::mem::take(&mut self.unflushed)
    }

    pub fn unflushed_count(&self) -> usize {
        self.unflushed.len()
    }

    /// Put messages back after a failed flush, ahead of newer ones
    pub fn restore_unflushed(&mut self, mut messages: Vec<WebsocketMessage>) {
        messages.append(&mut self.unflushed);
        self.unflushed = messages;
    }
}
