//! MITM (Man-in-the-Middle) interception module
//!
//! Session-scoped interception core. It includes:
//! - Root CA and forged leaf certificates with a shared certificate store
//! - TLS interception with ALPN mirrored between browser and origin
//! - HTTP/1.1 and HTTP/2 relays that record every exchange as a Resource
//! - Per-resource lifecycle milestones and SQLite session persistence
//! - Shared HTTP response cache with conditional revalidation
//! - HTTP/2 push promise replay and session control binding
//! - WebSocket message recording and per-session upstream proxies
//! - Per-origin socket pool with shared HTTP/2 origin sessions
//! - Resource blocking by type, URL fragment or callback

pub mod cert_store;
pub mod certificate_authority;
pub mod error;
pub mod frame_tap;
pub mod http1_mitm;
pub mod http2_binding;
pub mod http2_mitm;
pub mod http2_push;
pub mod interceptor;
pub mod origin_pool;
pub mod request_session;
pub mod resource;
pub mod resource_state;
pub mod response_cache;
pub mod storage;
pub mod stream;
pub mod tls_config;
pub mod upstream_proxy;
pub mod websocket_messages;

// Re-export main types
pub use cert_store::{CertificateRecord, CertificateStorage, CertificateStore};
pub use certificate_authority::{CaConfig, CertificateAuthority, RootCa};
pub use error::{ErrorClass, MitmError, ResourceError, Result};
pub use frame_tap::{FrameParser, FrameTap, ObservedFrame};
pub use http1_mitm::{blocked_reply, Http1Relay};
pub use http2_binding::{BindingOutcome, Http2Event, Http2SessionBinding, Http2SessionControl};
pub use http2_mitm::{handle_http2_mitm, serve_http2_client, H2Error, Http2Config, OriginHttp2Session};
pub use http2_push::{PushPromiseHandler, PushState};
pub use interceptor::{
    BypassReason, ConnectionContext, InterceptedProtocol, InterceptionResult, MitmInterceptor,
    UpstreamConnector,
};
pub use origin_pool::{OriginKey, OriginPool, DEFAULT_MAX_SOCKETS_PER_ORIGIN};
pub use request_session::{
    BlockHandler, BlockedResources, BlockedResponse, LoadedResource, RequestSession, ResourceEvent,
    SessionOptions, SessionRegistry, EMPTY_DOCUMENT,
};
pub use resource::{Resource, ResourceHeaders, ResourceId, ResourceInit, ResourceType, SocketId, SocketRecord};
pub use resource_state::{Milestone, ResourceStateTracker, ResourceStatesRow};
pub use response_cache::{CachedHttpResponse, HttpResponseCache, SharedResponseCache};
pub use storage::{NetworkDb, SessionDb, StorageError};
pub use stream::{HeadLog, HeadTap, SocketCounters};
pub use tls_config::{ClientTlsConfig, SniUtils, TlsConfigError, TlsVersion, UpstreamTlsConfig};
pub use upstream_proxy::{UpstreamProxyManager, UpstreamProxyProvider};
pub use websocket_messages::{WebsocketMessage, WebsocketMessageBroker};
