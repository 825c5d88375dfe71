//! Resource and socket records
//!
//! A `Resource` is one logical exchange (request/response or upgraded
//! websocket) within a session. A `SocketRecord` is one upstream TCP/TLS
//! connection; HTTP/2 multiplexes many resources over one socket.

use crate::mitm::resource_state::Milestone;
use crate::mitm::stream::SocketCounters;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

/// Session-unique resource identifier
pub type ResourceId = u64;

/// Process-unique socket identifier
pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a socket id, unique for the lifetime of the process.
pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Status codes treated as redirects
pub const REDIRECT_CODES: [u16; 7] = [300, 301, 302, 303, 305, 307, 308];

pub fn is_redirect_status(status: u16) -> bool {
    REDIRECT_CODES.contains(&status)
}

/// Header list kept twice: as received (original casing and order) and
/// lowercased for lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceHeaders {
    original: Vec<(String, String)>,
    normalized: Vec<(String, String)>,
}

impl ResourceHeaders {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let original: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let normalized = original
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        Self {
            original,
            normalized,
        }
    }

    /// Build from an `http::HeaderMap`. Names are already lowercase there;
    /// non-UTF-8 values are kept lossily.
    pub fn from_header_map(headers: &http::HeaderMap) -> Self {
        Self::from_pairs(headers.iter().map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        }))
    }

    /// Prefer the header lines read off the wire, which keep their casing
    /// and order. They are used only when they carry the same names as the
    /// parsed map; anything else falls back to the map.
    pub fn from_wire(raw: Option<Vec<(String, String)>>, headers: &http::HeaderMap) -> Self {
        match raw {
            Some(raw) if same_names(&raw, headers) => Self::from_pairs(raw),
            _ => Self::from_header_map(headers),
        }
    }

    /// Headers as received
    pub fn original(&self) -> &[(String, String)] {
        &self.original
    }

    /// Lowercased copy
    pub fn normalized(&self) -> &[(String, String)] {
        &self.normalized
    }

    /// First value for a (case-insensitive) header name
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.normalized
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }
}

fn same_names(raw: &[(String, String)], headers: &http::HeaderMap) -> bool {
    if raw.len() != headers.len() {
        return false;
    }
    let mut wire: Vec<String> = raw.iter().map(|(k, _)| k.to_ascii_lowercase()).collect();
    let mut parsed: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
    wire.sort_unstable();
    parsed.sort_unstable();
    wire.iter().zip(&parsed).all(|(w, p)| w == p)
}

/// Resource type, as a browser would classify the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Script,
    Image,
    Font,
    Media,
    Manifest,
    Fetch,
    Xhr,
    Websocket,
    Preflight,
    Other,
}

impl ResourceType {
    /// Classify from request method, headers and URL.
    pub fn determine(method: &str, url: &str, headers: &ResourceHeaders) -> Self {
        if method.eq_ignore_ascii_case("OPTIONS")
            && headers.get("access-control-request-method").is_some()
        {
            return Self::Preflight;
        }

        if headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        {
            return Self::Websocket;
        }

        match headers.get("sec-fetch-dest") {
            Some("document") | Some("iframe") | Some("frame") => return Self::Document,
            Some("style") => return Self::Stylesheet,
            Some("script") | Some("worker") | Some("sharedworker") | Some("serviceworker") => {
                return Self::Script
            }
            Some("image") => return Self::Image,
            Some("font") => return Self::Font,
            Some("audio") | Some("video") | Some("track") => return Self::Media,
            Some("manifest") => return Self::Manifest,
            Some("websocket") => return Self::Websocket,
            Some("empty") => {
                return if headers
                    .get("x-requested-with")
                    .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
                    .unwrap_or(false)
                {
                    Self::Xhr
                } else {
                    Self::Fetch
                };
            }
            _ => {}
        }

        if let Some(mode) = headers.get("sec-fetch-mode") {
            if mode == "navigate" {
                return Self::Document;
            }
        }

        let path = url::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_default();
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        match ext {
            "js" | "mjs" => return Self::Script,
            "css" => return Self::Stylesheet,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif" => return Self::Image,
            "woff" | "woff2" | "ttf" | "otf" | "eot" => return Self::Font,
            "mp4" | "webm" | "mp3" | "ogg" | "wav" => return Self::Media,
            "webmanifest" => return Self::Manifest,
            _ => {}
        }

        match headers.get("accept") {
            Some(accept) if accept.starts_with("text/html") => Self::Document,
            Some(accept) if accept.starts_with("text/css") => Self::Stylesheet,
            Some(accept) if accept.starts_with("image/") => Self::Image,
            Some(accept) if accept.starts_with("application/json") => Self::Fetch,
            _ => Self::Other,
        }
    }
}

/// One logical HTTP or WebSocket exchange
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    pub session_id: String,
    pub socket_id: Option<SocketId>,
    pub method: String,
    pub url: String,
    pub request_headers: ResourceHeaders,
    pub response_headers: Option<ResourceHeaders>,
    pub status: Option<u16>,
    pub resource_type: ResourceType,
    pub is_ssl: bool,
    pub is_http2: bool,
    pub is_http2_push: bool,
    /// Initiating resource for pushes
    pub parent_resource_id: Option<ResourceId>,
    /// Document that issued the request, from `referer`
    pub document_url: Option<String>,
    pub is_from_redirect: bool,
    pub previous_url: Option<String>,
    pub first_redirecting_url: Option<String>,
    pub redirected_to_url: Option<String>,
    pub served_from_cache: bool,
    pub request_time: DateTime<Utc>,
}

/// Fields needed to register a new resource
#[derive(Debug, Clone)]
pub struct ResourceInit {
    pub method: String,
    pub url: String,
    pub request_headers: ResourceHeaders,
    pub socket_id: Option<SocketId>,
    pub is_ssl: bool,
    pub is_http2: bool,
    pub is_http2_push: bool,
    pub parent_resource_id: Option<ResourceId>,
}

impl ResourceInit {
    pub fn new(method: impl Into<String>, url: impl Into<String>, headers: ResourceHeaders) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            request_headers: headers,
            socket_id: None,
            is_ssl: false,
            is_http2: false,
            is_http2_push: false,
            parent_resource_id: None,
        }
    }

    pub fn on_socket(mut self, socket_id: SocketId) -> Self {
        self.socket_id = Some(socket_id);
        self
    }

    pub fn ssl(mut self, is_ssl: bool) -> Self {
        self.is_ssl = is_ssl;
        self
    }

    pub fn http2(mut self, is_http2: bool) -> Self {
        self.is_http2 = is_http2;
        self
    }

    pub fn pushed_by(mut self, parent: ResourceId) -> Self {
        self.is_http2_push = true;
        self.is_http2 = true;
        self.parent_resource_id = Some(parent);
        self
    }
}

impl Resource {
    pub(crate) fn from_init(id: ResourceId, session_id: &str, init: ResourceInit) -> Self {
        let resource_type = ResourceType::determine(&init.method, &init.url, &init.request_headers);
        let document_url = init.request_headers.get("referer").map(str::to_string);
        Self {
            id,
            session_id: session_id.to_string(),
            socket_id: init.socket_id,
            method: init.method,
            url: init.url,
            request_headers: init.request_headers,
            response_headers: None,
            status: None,
            resource_type,
            is_ssl: init.is_ssl,
            is_http2: init.is_http2,
            is_http2_push: init.is_http2_push,
            parent_resource_id: init.parent_resource_id,
            document_url,
            is_from_redirect: false,
            previous_url: None,
            first_redirecting_url: None,
            redirected_to_url: None,
            served_from_cache: false,
            request_time: Utc::now(),
        }
    }

    /// Record response status/headers. A redirect records its resolved
    /// `Location` as `redirected_to_url`.
    pub fn set_response(&mut self, status: u16, headers: ResourceHeaders) {
        if is_redirect_status(status) {
            if let Some(location) = headers.get("location") {
                self.redirected_to_url = url::Url::parse(&self.url)
                    .and_then(|base| base.join(location))
                    .map(|u| u.to_string())
                    .ok()
                    .or_else(|| Some(location.to_string()));
            }
        }
        self.status = Some(status);
        self.response_headers = Some(headers);
    }
}

/// One upstream TCP/TLS connection
#[derive(Debug, Clone, Serialize)]
pub struct SocketRecord {
    pub id: SocketId,
    pub host: String,
    pub port: u16,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub alpn: Option<String>,
    pub server_name: Option<String>,
    pub dns_resolved_ip: Option<IpAddr>,
    pub created_at: i64,
    pub dns_lookup_at: Option<i64>,
    pub connected_at: Option<i64>,
    pub tls_handshake_at: Option<i64>,
    pub first_byte_at: Option<i64>,
    pub error_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub error: Option<String>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Milestones in firing order, inherited by resources attached later
    pub milestones: Vec<(Milestone, i64)>,
}

impl SocketRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: next_socket_id(),
            host: host.into(),
            port,
            local_addr: None,
            remote_addr: None,
            alpn: None,
            server_name: None,
            dns_resolved_ip: None,
            created_at: Utc::now().timestamp_millis(),
            dns_lookup_at: None,
            connected_at: None,
            tls_handshake_at: None,
            first_byte_at: None,
            error_at: None,
            closed_at: None,
            error: None,
            bytes_read: 0,
            bytes_written: 0,
            milestones: Vec::new(),
        }
    }

    /// Copy live traffic counters into the record.
    pub fn sync_counters(&mut self, counters: &SocketCounters) {
        self.bytes_read = counters.bytes_read();
        self.bytes_written = counters.bytes_written();
        if self.first_byte_at.is_none() {
            self.first_byte_at = counters.first_byte_at();
        }
    }

    /// Stamp a milestone once. Returns false if already set.
    pub fn stamp(&mut self, milestone: Milestone, at: i64) -> bool {
        if self.milestones.iter().any(|(m, _)| *m == milestone) {
            return false;
        }
        match milestone {
            Milestone::DnsResolved => self.dns_lookup_at = Some(at),
            Milestone::Connected => self.connected_at = Some(at),
            Milestone::TlsHandshakeComplete => self.tls_handshake_at = Some(at),
            _ => {}
        }
        self.milestones.push((milestone, at));
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.closed_at.is_some() || self.error_at.is_some()
    }

    /// Set the close time; immutable once set.
    pub fn mark_closed(&mut self, at: i64) -> bool {
        if self.closed_at.is_some() {
            return false;
        }
        self.closed_at = Some(at);
        true
    }

    /// Set the error time and message; immutable once set.
    pub fn mark_errored(&mut self, at: i64, error: impl Into<String>) -> bool {
        if self.error_at.is_some() {
            return false;
        }
        self.error_at = Some(at);
        self.error = Some(error.into());
        true
    }
}
