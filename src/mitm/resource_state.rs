//! Resource State Tracker
//!
//! Append-only, per-resource timeline of protocol milestones. Each
//! milestone is write-once: a duplicate protocol event never overwrites
//! the first timestamp. Timestamps never go backwards within a resource.
//!
//! The tracker is the source for the `resource_states` table, which has
//! one row per resource and one nullable INTEGER column per milestone.

use crate::mitm::resource::ResourceId;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Named milestones of a resource's lifecycle, in canonical column order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Milestone {
    Created,
    UpstreamProxyAcquired,
    DnsResolved,
    Connected,
    TlsHandshakeComplete,
    Http2SessionCreated,
    RequestSent,
    ServerPushReceived,
    ClientPushSent,
    HeadersReceived,
    ServedFromCache,
    BodyReceived,
    Blocked,
    PrematurelyClosed,
    Closed,
    Errored,
}

impl Milestone {
    pub const ALL: [Milestone; 16] = [
        Milestone::Created,
        Milestone::UpstreamProxyAcquired,
        Milestone::DnsResolved,
        Milestone::Connected,
        Milestone::TlsHandshakeComplete,
        Milestone::Http2SessionCreated,
        Milestone::RequestSent,
        Milestone::ServerPushReceived,
        Milestone::ClientPushSent,
        Milestone::HeadersReceived,
        Milestone::ServedFromCache,
        Milestone::BodyReceived,
        Milestone::Blocked,
        Milestone::PrematurelyClosed,
        Milestone::Closed,
        Milestone::Errored,
    ];

    /// Column name in the `resource_states` table
    pub fn column_name(&self) -> &'static str {
        match self {
            Milestone::Created => "created",
            Milestone::UpstreamProxyAcquired => "upstream_proxy_acquired",
            Milestone::DnsResolved => "dns_resolved",
            Milestone::Connected => "connected",
            Milestone::TlsHandshakeComplete => "tls_handshake_complete",
            Milestone::Http2SessionCreated => "http2_session_created",
            Milestone::RequestSent => "request_sent",
            Milestone::ServerPushReceived => "server_push_received",
            Milestone::ClientPushSent => "client_push_sent",
            Milestone::HeadersReceived => "headers_received",
            Milestone::ServedFromCache => "served_from_cache",
            Milestone::BodyReceived => "body_received",
            Milestone::Blocked => "blocked",
            Milestone::PrematurelyClosed => "prematurely_closed",
            Milestone::Closed => "closed",
            Milestone::Errored => "errored",
        }
    }

    /// Terminal milestones end a resource's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Milestone::Closed | Milestone::Errored | Milestone::PrematurelyClosed | Milestone::Blocked
        )
    }

    /// Milestones that belong to the underlying socket rather than the
    /// exchange itself
    pub fn is_socket_level(&self) -> bool {
        matches!(
            self,
            Milestone::UpstreamProxyAcquired
                | Milestone::DnsResolved
                | Milestone::Connected
                | Milestone::TlsHandshakeComplete
                | Milestone::Http2SessionCreated
        )
    }
}

/// One row of the `resource_states` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatesRow {
    pub resource_id: ResourceId,
    /// One entry per milestone in `Milestone::ALL` order
    pub values: Vec<(Milestone, Option<i64>)>,
}

impl ResourceStatesRow {
    pub fn get(&self, milestone: Milestone) -> Option<i64> {
        self.values
            .iter()
            .find(|(m, _)| *m == milestone)
            .and_then(|(_, ts)| *ts)
    }
}

/// Per-session milestone tracker
#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    states: HashMap<ResourceId, Vec<(Milestone, i64)>>,
    dirty: BTreeSet<ResourceId>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a milestone. Returns the stored timestamp if this call set
    /// it, or `None` if the milestone was already recorded.
    ///
    /// The stored timestamp is clamped to the latest one already recorded
    /// for the resource.
    pub fn record(
        &mut self,
        resource_id: ResourceId,
        milestone: Milestone,
        timestamp: i64,
    ) -> Option<i64> {
        let entries = self.states.entry(resource_id).or_default();
        if entries.iter().any(|(m, _)| *m == milestone) {
            return None;
        }
        let latest = entries.last().map(|(_, ts)| *ts).unwrap_or(i64::MIN);
        let stored = timestamp.max(latest);
        entries.push((milestone, stored));
        self.dirty.insert(resource_id);
        Some(stored)
    }

    /// Milestones in recorded order
    pub fn snapshot(&self, resource_id: ResourceId) -> Vec<(Milestone, i64)> {
        self.states.get(&resource_id).cloned().unwrap_or_default()
    }

    pub fn get(&self, resource_id: ResourceId, milestone: Milestone) -> Option<i64> {
        self.states
            .get(&resource_id)?
            .iter()
            .find(|(m, _)| *m == milestone)
            .map(|(_, ts)| *ts)
    }

    pub fn has(&self, resource_id: ResourceId, milestone: Milestone) -> bool {
        self.get(resource_id, milestone).is_some()
    }

    /// Whether any terminal milestone has been recorded
    pub fn is_finished(&self, resource_id: ResourceId) -> bool {
        self.states
            .get(&resource_id)
            .map(|entries| entries.iter().any(|(m, _)| m.is_terminal()))
            .unwrap_or(false)
    }

    /// Table-shaped row for a resource
    pub fn row(&self, resource_id: ResourceId) -> ResourceStatesRow {
        let entries = self.states.get(&resource_id);
        let values = Milestone::ALL
            .iter()
            .map(|m| {
                let ts = entries.and_then(|e| e.iter().find(|(x, _)| x == m).map(|(_, ts)| *ts));
                (*m, ts)
            })
            .collect();
        ResourceStatesRow {
            resource_id,
            values,
        }
    }

    /// Mark resources for rewriting on the next `take_dirty_rows`
    pub fn mark_dirty(&mut self, resource_ids: impl IntoIterator<Item = ResourceId>) {
        self.dirty.extend(resource_ids);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Rows changed since the last call
    pub fn take_dirty_rows(&mut self) -> Vec<ResourceStatesRow> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty.into_iter().map(|id| self.row(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
