//! Upstream Proxy Manager
//!
//! Holds the single upstream proxy URL bound to a session. An external
//! provider decides which proxy to use per navigation; the manager makes
//! sure the previous URL is released before a new one is adopted and that
//! nothing is released twice.
//!
//! Also provides `connect_via_proxy`, which opens a tunnel to an origin
//! through an `http://` proxy with `CONNECT`.

use crate::mitm::error::{MitmError, Result};
use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for a proxy's CONNECT response head
const MAX_CONNECT_HEAD: usize = 16 * 1024;
const MAX_CONNECT_HEADERS: usize = 32;

/// Injected acquisition/release policy
#[async_trait]
pub trait UpstreamProxyProvider: Send + Sync {
    /// `Ok(None)` keeps the current proxy
    async fn acquire_proxy_url(
        &self,
        session_id: &str,
        navigation_url: &str,
    ) -> std::result::Result<Option<String>, String>;

    async fn release_proxy_url(&self, session_id: &str, proxy_url: &str);
}

#[derive(Debug, Default)]
struct ProxySlot {
    current: Option<String>,
    /// The current URL came from the provider and must be released
    acquired: bool,
    closed: bool,
}

/// Per-session upstream proxy binding
pub struct UpstreamProxyManager {
    session_id: String,
    provider: Option<Arc<dyn UpstreamProxyProvider>>,
    slot: Mutex<ProxySlot>,
    acquire_timeout: Duration,
    cancel: CancellationToken,
}

impl UpstreamProxyManager {
    pub fn new(
        session_id: impl Into<String>,
        provider: Option<Arc<dyn UpstreamProxyProvider>>,
        acquire_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            provider,
            slot: Mutex::new(ProxySlot::default()),
            acquire_timeout,
            cancel,
        }
    }

    /// A fixed proxy that is never released to a provider
    pub fn with_static(session_id: impl Into<String>, proxy_url: impl Into<String>) -> Self {
        let manager = Self::new(session_id, None, Duration::from_secs(30), CancellationToken::new());
        Self {
            slot: Mutex::new(ProxySlot {
                current: Some(proxy_url.into()),
                ..ProxySlot::default()
            }),
            ..manager
        }
    }

    /// Acquire a proxy for a navigation. The slot lock is held for the
    /// whole acquisition so `close` waits for it.
    pub async fn start(&self, navigation_url: &str) -> Result<Option<String>> {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Ok(slot.current.clone());
        }
        let Some(provider) = &self.provider else {
            return Ok(slot.current.clone());
        };

        let acquired = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(MitmError::Canceled("upstream proxy acquisition".into()));
            }
            result = tokio::time::timeout(
                self.acquire_timeout,
                provider.acquire_proxy_url(&self.session_id, navigation_url),
            ) => result,
        };

        let new_url = match acquired {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "Upstream proxy acquisition failed");
                return Err(MitmError::UpstreamProxy(e));
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "Upstream proxy acquisition timed out");
                return Err(MitmError::Timeout("upstream proxy acquisition".into()));
            }
        };

        match new_url {
            None => Ok(slot.current.clone()),
            Some(url) if slot.current.as_deref() == Some(url.as_str()) => {
                slot.acquired = true;
                Ok(Some(url))
            }
            Some(url) => {
                if let (Some(old), true) = (slot.current.take(), slot.acquired) {
                    debug!(session_id = %self.session_id, proxy = %old, "Releasing previous upstream proxy");
                    provider.release_proxy_url(&self.session_id, &old).await;
                }
                info!(session_id = %self.session_id, proxy = %url, navigation_url = %navigation_url, "Upstream proxy bound");
                slot.current = Some(url.clone());
                slot.acquired = true;
                Ok(Some(url))
            }
        }
    }

    /// Currently bound proxy URL
    pub async fn current(&self) -> Option<String> {
        self.slot.lock().await.current.clone()
    }

    /// Release the held proxy. Idempotent.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return;
        }
        slot.closed = true;

        let current = slot.current.take();
        if let (Some(url), true, Some(provider)) = (current, slot.acquired, &self.provider) {
            debug!(session_id = %self.session_id, proxy = %url, "Releasing upstream proxy");
            provider.release_proxy_url(&self.session_id, &url).await;
        }
        slot.acquired = false;
    }

    pub async fn is_closed(&self) -> bool {
        self.slot.lock().await.closed
    }
}

/// Open a TCP tunnel to `host:port` through an HTTP proxy.
pub async fn connect_via_proxy(proxy_url: &str, host: &str, port: u16) -> Result<TcpStream> {
    let url = url::Url::parse(proxy_url)
        .map_err(|e| MitmError::UpstreamProxy(format!("invalid proxy url: {}", e)))?;
    if url.scheme() != "http" {
        return Err(MitmError::UpstreamProxy(format!(
            "unsupported proxy scheme: {}",
            url.scheme()
        )));
    }
    let proxy_host = url
        .host_str()
        .ok_or_else(|| MitmError::UpstreamProxy("proxy url has no host".into()))?;
    let proxy_port = url.port_or_known_default().unwrap_or(80);

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| MitmError::UpstreamProxy(format!("connect to proxy failed: {}", e)))?;

    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let credentials = (!url.username().is_empty())
        .then(|| format!("{}:{}", url.username(), url.password().unwrap_or("")));
    proxy_connect(&mut stream, &authority, credentials.as_deref())
        .await
        .map_err(|e| match e {
            MitmError::UpstreamProxyAuth { challenge, .. } => MitmError::UpstreamProxyAuth {
                proxy: proxy_host.to_string(),
                challenge,
            },
            other => other,
        })?;

    debug!(proxy = %proxy_host, target = %authority, "Tunnel via upstream proxy established");
    Ok(stream)
}

/// Send `CONNECT authority` on an open proxy connection and check the answer.
///
/// The head is read byte-wise so no tunneled bytes are consumed.
pub async fn proxy_connect<S>(stream: &mut S, authority: &str, credentials: Option<&str>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = credentials {
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_HEAD {
            return Err(MitmError::UpstreamProxy(
                "proxy response head too large".into(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(MitmError::UpstreamProxy(
                "proxy closed during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_CONNECT_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(MitmError::UpstreamProxy(
                "incomplete CONNECT response".into(),
            ))
        }
        Err(e) => {
            return Err(MitmError::UpstreamProxy(format!(
                "malformed CONNECT response: {}",
                e
            )))
        }
    }

    let code = response
        .code
        .ok_or_else(|| MitmError::UpstreamProxy("CONNECT response without status".into()))?;
    match code {
        200..=299 => Ok(()),
        407 => {
            let challenge = response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("proxy-authenticate"))
                .map(|h| String::from_utf8_lossy(h.value).into_owned())
                .unwrap_or_default();
            Err(MitmError::UpstreamProxyAuth {
                proxy: String::new(),
                challenge,
            })
        }
        _ => Err(MitmError::UpstreamProxy(format!(
            "proxy refused CONNECT with {} {}",
            code,
            response.reason.unwrap_or("")
        ))),
    }
}
