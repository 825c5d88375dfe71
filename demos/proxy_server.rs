//! Standalone interception proxy with one session.
//!
//! Configure with `SESSION_MITM_*` variables (or a `.env` file), then point
//! a browser at the listener with `Proxy-Authorization: Basic
//! base64(user:<session id>)` and trust the root certificate written to
//! `SESSION_MITM_ROOT_PEM` (default `session-mitm-root.pem`).

use anyhow::{Context, Result};
use session_mitm::{MitmProxyServer, ProxyConfig, ResourceEvent};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = ProxyConfig::from_env()?;
    info!(listen = %config.listen_addr(), "Configuration loaded");

    let server = Arc::new(MitmProxyServer::from_config(config).await?);

    let root_path =
        std::env::var("SESSION_MITM_ROOT_PEM").unwrap_or_else(|_| "session-mitm-root.pem".into());
    tokio::fs::write(&root_path, server.interceptor().root_cert_pem())
        .await
        .with_context(|| format!("Failed to write root certificate to {}", root_path))?;
    info!(path = %root_path, "Root certificate written");

    let session_id = std::env::var("SESSION_MITM_DEMO_SESSION").unwrap_or_else(|_| "demo".into());
    let session = server
        .create_session(&session_id, server.session_options())
        .await?;
    info!(session_id = %session_id, "Session ready");

    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ResourceEvent::WillBeRequested(r)) => {
                    info!(id = r.id, method = %r.method, url = %r.url, "Request");
                }
                Ok(ResourceEvent::Loaded(loaded)) => {
                    let r = &loaded.resource;
                    info!(
                        id = r.id,
                        status = ?r.status,
                        cached = r.served_from_cache,
                        bytes = loaded.body().map(|b| b.len()).unwrap_or(0),
                        "Loaded"
                    );
                }
                Ok(ResourceEvent::Failed { resource, error }) => {
                    warn!(id = resource.id, url = %resource.url, error = %error, "Failed");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let listener = server.bind().await?;
    let shutdown_server = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown_server.shutdown();
    });

    server.run(listener).await
}

/// Graceful shutdown on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
