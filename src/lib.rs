//! Session MITM - Session-scoped interception core for automated browsers
//!
//! Sits between an automated browser and the network. Each browser session
//! gets its own `RequestSession`, which records every request flowing
//! through the proxy as a Resource, together with its lifecycle milestones,
//! its response and any WebSocket messages.
//!
//! ## Features
//!
//! - **TLS interception**: forged leaf certificates signed by a local root CA,
//!   ALPN mirrored so the browser and origin always speak the same protocol
//! - **HTTP/1.1 & HTTP/2**: full relays, including HTTP/2 server push
//! - **Resource timeline**: write-once milestones persisted to SQLite
//! - **Shared response cache**: fresh hits served locally, stale entries
//!   revalidated with `If-None-Match`
//! - **WebSocket recording**: text and binary messages per resource
//! - **Upstream proxies**: per-session proxy acquired from a provider
//! - **Connection reuse**: per-origin socket pool, shared HTTP/2 sessions
//! - **Blocking**: requests answered locally by type, URL or callback
//!
//! ## Usage
//!
//! ```rust,no_run
//! use session_mitm::{MitmProxyServer, ProxyConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Arc::new(MitmProxyServer::from_config(ProxyConfig::from_env()?).await?);
//!     let session = server
//!         .create_session("session-1", server.session_options())
//!         .await?;
//!     let mut events = session.subscribe();
//!
//!     let listener = server.bind().await?;
//!     tokio::spawn(Arc::clone(&server).run(listener));
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `mitm` - interception core: sessions, relays, certificates, caches
//! - `server` - listener binding requests to sessions
//! - `config` - environment-driven configuration
//! - `dns` - cached origin resolution

pub mod config;
pub mod dns;
pub mod mitm;
pub mod server;

// Re-export commonly used types

/// Configuration types
pub use config::ProxyConfig;

/// Listener
pub use server::MitmProxyServer;

/// Interception core
pub use mitm::{
    BlockedResources, BlockedResponse, CertificateAuthority, CertificateStore, Http2Config,
    HttpResponseCache, LoadedResource, Milestone, MitmError, MitmInterceptor, OriginKey,
    RequestSession, Resource, ResourceError, ResourceEvent, SessionOptions, SessionRegistry,
    UpstreamProxyManager, UpstreamProxyProvider, WebsocketMessage,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
