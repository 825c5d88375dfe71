use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mitm::http2_mitm::Http2Config;
use crate::mitm::origin_pool::DEFAULT_MAX_SOCKETS_PER_ORIGIN;
use crate::mitm::response_cache::DEFAULT_MAX_ITEMS;

/// Bodies larger than this are relayed but not captured
pub const DEFAULT_MAX_CAPTURED_BODY: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listener
    pub host: String,
    pub port: u16,

    // Storage
    pub network_db_path: PathBuf,
    pub session_db_dir: PathBuf,

    // Response cache
    pub response_cache_max_items: usize,
    pub max_captured_body: usize,

    // Certificates
    pub cert_renew_before_minutes: i64,
    pub leaf_validity_days: i64,

    // Upstream
    pub verify_upstream_certificates: bool,
    pub connect_timeout_seconds: u64,
    pub tls_handshake_timeout_seconds: u64,
    pub proxy_acquire_timeout_seconds: u64,
    pub max_sockets_per_origin: usize,

    // DNS configuration
    pub dns_cache_size: usize,
    pub dns_cache_ttl_seconds: u64,
    pub dns_resolver_timeout_seconds: u64,

    // Sessions
    pub event_capacity: usize,
    pub mitm_enabled_by_default: bool,

    // HTTP/2
    pub http2: Http2Config,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            network_db_path: PathBuf::from("network.db"),
            session_db_dir: PathBuf::from("sessions"),
            response_cache_max_items: DEFAULT_MAX_ITEMS,
            max_captured_body: DEFAULT_MAX_CAPTURED_BODY,
            cert_renew_before_minutes: 60,
            leaf_validity_days: 365,
            verify_upstream_certificates: true,
            connect_timeout_seconds: 10,
            tls_handshake_timeout_seconds: 10,
            proxy_acquire_timeout_seconds: 30,
            max_sockets_per_origin: DEFAULT_MAX_SOCKETS_PER_ORIGIN,
            dns_cache_size: 1000,
            dns_cache_ttl_seconds: 300,
            dns_resolver_timeout_seconds: 5,
            event_capacity: 1024,
            mitm_enabled_by_default: true,
            http2: Http2Config::default(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        let host = env::var("SESSION_MITM_HOST").unwrap_or(defaults.host);
        let port = env_or("SESSION_MITM_PORT", defaults.port)?;

        let network_db_path = env::var("SESSION_MITM_NETWORK_DB")
            .map(PathBuf::from)
            .unwrap_or(defaults.network_db_path);
        let session_db_dir = env::var("SESSION_MITM_SESSION_DB_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.session_db_dir);

        let response_cache_max_items = env_or(
            "SESSION_MITM_RESPONSE_CACHE_MAX_ITEMS",
            defaults.response_cache_max_items,
        )?;
        let max_captured_body =
            env_or("SESSION_MITM_MAX_CAPTURED_BODY", defaults.max_captured_body)?;

        let cert_renew_before_minutes = env_or(
            "SESSION_MITM_CERT_RENEW_BEFORE_MINUTES",
            defaults.cert_renew_before_minutes,
        )?;
        let leaf_validity_days =
            env_or("SESSION_MITM_LEAF_VALIDITY_DAYS", defaults.leaf_validity_days)?;

        let verify_upstream_certificates = env_or(
            "SESSION_MITM_VERIFY_UPSTREAM",
            defaults.verify_upstream_certificates,
        )?;
        let connect_timeout_seconds = env_or(
            "SESSION_MITM_CONNECT_TIMEOUT_SECONDS",
            defaults.connect_timeout_seconds,
        )?;
        let tls_handshake_timeout_seconds = env_or(
            "SESSION_MITM_TLS_HANDSHAKE_TIMEOUT_SECONDS",
            defaults.tls_handshake_timeout_seconds,
        )?;
        let proxy_acquire_timeout_seconds = env_or(
            "SESSION_MITM_PROXY_ACQUIRE_TIMEOUT_SECONDS",
            defaults.proxy_acquire_timeout_seconds,
        )?;

        let max_sockets_per_origin = env_or(
            "SESSION_MITM_MAX_SOCKETS_PER_ORIGIN",
            defaults.max_sockets_per_origin,
        )?;

        let dns_cache_size = env_or("SESSION_MITM_DNS_CACHE_SIZE", defaults.dns_cache_size)?;
        let dns_cache_ttl_seconds = env_or(
            "SESSION_MITM_DNS_CACHE_TTL_SECONDS",
            defaults.dns_cache_ttl_seconds,
        )?;
        let dns_resolver_timeout_seconds = env_or(
            "SESSION_MITM_DNS_RESOLVER_TIMEOUT_SECONDS",
            defaults.dns_resolver_timeout_seconds,
        )?;

        let event_capacity = env_or("SESSION_MITM_EVENT_CAPACITY", defaults.event_capacity)?;
        let mitm_enabled_by_default = env_or(
            "SESSION_MITM_ENABLED_BY_DEFAULT",
            defaults.mitm_enabled_by_default,
        )?;

        let http2 = Http2Config {
            initial_window_size: env_or(
                "SESSION_MITM_H2_INITIAL_WINDOW_SIZE",
                defaults.http2.initial_window_size,
            )?,
            initial_connection_window_size: env_or(
                "SESSION_MITM_H2_CONNECTION_WINDOW_SIZE",
                defaults.http2.initial_connection_window_size,
            )?,
            max_concurrent_streams: env_or(
                "SESSION_MITM_H2_MAX_CONCURRENT_STREAMS",
                defaults.http2.max_concurrent_streams,
            )?,
            max_frame_size: env_or(
                "SESSION_MITM_H2_MAX_FRAME_SIZE",
                defaults.http2.max_frame_size,
            )?,
            enable_server_push: env_or(
                "SESSION_MITM_H2_ENABLE_PUSH",
                defaults.http2.enable_server_push,
            )?,
        };

        let config = Self {
            host,
            port,
            network_db_path,
            session_db_dir,
            response_cache_max_items,
            max_captured_body,
            cert_renew_before_minutes,
            leaf_validity_days,
            verify_upstream_certificates,
            connect_timeout_seconds,
            tls_handshake_timeout_seconds,
            proxy_acquire_timeout_seconds,
            max_sockets_per_origin,
            dns_cache_size,
            dns_cache_ttl_seconds,
            dns_resolver_timeout_seconds,
            event_capacity,
            mitm_enabled_by_default,
            http2,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a cache or a timeout outright.
    pub fn validate(&self) -> Result<()> {
        if self.response_cache_max_items == 0 {
            anyhow::bail!("response cache must hold at least one item");
        }
        if self.dns_cache_size == 0 {
            anyhow::bail!("DNS cache size must be greater than zero");
        }
        if self.max_sockets_per_origin == 0 {
            anyhow::bail!("at least one socket per origin is required");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("event channel capacity must be greater than zero");
        }
        if self.connect_timeout_seconds == 0
            || self.tls_handshake_timeout_seconds == 0
            || self.proxy_acquire_timeout_seconds == 0
            || self.dns_resolver_timeout_seconds == 0
        {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.cert_renew_before_minutes < 0 || self.leaf_validity_days <= 0 {
            anyhow::bail!("certificate lifetimes must be positive");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_seconds)
    }

    pub fn proxy_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_acquire_timeout_seconds)
    }

    pub fn dns_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_cache_ttl_seconds)
    }

    pub fn dns_resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_resolver_timeout_seconds)
    }

    /// SQLite file for one session's resource states and messages
    pub fn session_db_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.session_db_dir.join(format!("{}.db", safe))
    }
}
