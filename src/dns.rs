//! Origin DNS resolution with an LRU + TTL cache.
//!
//! Shared by all sessions; the resolved address is recorded on the socket
//! that uses it.

use crate::mitm::error::{MitmError, Result};
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

struct CachedResolution {
    ips: Vec<IpAddr>,
    resolved_at: Instant,
}

pub struct DnsResolver {
    resolver: Arc<TokioAsyncResolver>,
    cache: Mutex<LruCache<String, CachedResolution>>,
    resolver_timeout: Duration,
    cache_ttl: Duration,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("resolver_timeout", &self.resolver_timeout)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl DnsResolver {
    pub fn new(cache_size: usize, cache_ttl: Duration, resolver_timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = resolver_timeout;
        opts.attempts = 2;

        // System resolver first (respects /etc/resolv.conf); Google DNS if unavailable
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            warn!("Failed to load system DNS config, falling back to Google DNS");
            TokioAsyncResolver::tokio(ResolverConfig::google(), opts)
        });

        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver: Arc::new(resolver),
            cache: Mutex::new(LruCache::new(capacity)),
            resolver_timeout,
            cache_ttl,
        }
    }

    /// Resolve `host` to its first address. IP literals are returned as-is.
    pub async fn lookup(&self, host: &str) -> Result<IpAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(host) {
                if cached.resolved_at.elapsed() < self.cache_ttl {
                    if let Some(ip) = cached.ips.first() {
                        debug!(host = %host, ip = %ip, "DNS cache hit");
                        return Ok(*ip);
                    }
                }
            }
        }

        let ips: Vec<IpAddr> = match timeout(self.resolver_timeout, self.resolver.lookup_ip(host)).await
        {
            Ok(Ok(lookup)) => lookup.iter().collect(),
            Ok(Err(e)) => return Err(MitmError::dns(host, e.to_string())),
            Err(_) => return Err(MitmError::dns(host, "resolution timed out")),
        };

        let Some(first) = ips.first().copied() else {
            return Err(MitmError::dns(host, "no addresses found"));
        };
        debug!(host = %host, ips = ?ips, "Resolved host");

        self.cache.lock().await.put(
            host.to_string(),
            CachedResolution {
                ips,
                resolved_at: Instant::now(),
            },
        );

        Ok(first)
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(300), Duration::from_secs(5))
    }
}
