//! HTTP Response Cache
//!
//! LRU cache of static, cacheable responses keyed by URL. Shared by all
//! sessions because entries describe the origin, not the browsing session.
//!
//! Entries are only admitted with an ETag and without `no-store`. A fresh
//! entry (by `max-age` or `expires`) short-circuits the origin fetch; a
//! stale one is revalidated with `If-None-Match`.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use http::{HeaderMap, Method, Response, StatusCode};
use lru::LruCache;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Process-wide cache handle
pub type SharedResponseCache = Arc<Mutex<HttpResponseCache>>;

/// Default bound on cached items
pub const DEFAULT_MAX_ITEMS: usize = 500;

/// A cached response body with its validators
#[derive(Debug, Clone)]
pub struct CachedHttpResponse {
    pub url: String,
    pub body: Bytes,
    pub etag: String,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_modified: Option<String>,
    pub cache_control: Option<String>,
    pub stored_at: DateTime<Utc>,
}

impl CachedHttpResponse {
    /// Fresh entries can be served without contacting the origin
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now < exp).unwrap_or(false)
    }

    /// Response head for serving this entry to the browser
    pub fn response_head(&self) -> Result<Response<()>, http::Error> {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(http::header::ETAG, self.etag.as_str())
            .header(http::header::CONTENT_LENGTH, self.body.len());
        if let Some(ct) = &self.content_type {
            builder = builder.header(http::header::CONTENT_TYPE, ct.as_str());
        }
        if let Some(ce) = &self.content_encoding {
            builder = builder.header(http::header::CONTENT_ENCODING, ce.as_str());
        }
        if let Some(cc) = &self.cache_control {
            builder = builder.header(http::header::CACHE_CONTROL, cc.as_str());
        }
        if let Some(lm) = &self.last_modified {
            builder = builder.header(http::header::LAST_MODIFIED, lm.as_str());
        }
        builder.body(())
    }
}

/// Result of a cache consultation for an outgoing request
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Serve directly
    Fresh(Arc<CachedHttpResponse>),
    /// Revalidate with the ETag, serve on 304
    Stale(Arc<CachedHttpResponse>),
    Miss,
}

/// Only plain GETs are served from or admitted to the cache.
pub fn is_cacheable_request(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::GET
        && !headers.contains_key(http::header::RANGE)
        && !headers.contains_key(http::header::AUTHORIZATION)
}

/// Whether the browser sent its own validators
pub fn has_conditional_headers(headers: &HeaderMap) -> bool {
    headers.contains_key(http::header::IF_NONE_MATCH)
        || headers.contains_key(http::header::IF_MODIFIED_SINCE)
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn max_age(cache_control: &str) -> Option<i64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|v| v.trim_matches('"').parse::<i64>().ok())
}

fn has_directive(cache_control: &str, name: &str) -> bool {
    cache_control
        .split(',')
        .map(str::trim)
        .any(|directive| directive.eq_ignore_ascii_case(name))
}

/// LRU response cache
pub struct HttpResponseCache {
    items: LruCache<String, Arc<CachedHttpResponse>>,
    max_items: usize,
    hits: u64,
    misses: u64,
}

impl HttpResponseCache {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: LruCache::unbounded(),
            max_items,
            hits: 0,
            misses: 0,
        }
    }

    /// Wrap a new cache for sharing across sessions
    pub fn shared(max_items: usize) -> SharedResponseCache {
        Arc::new(Mutex::new(Self::new(max_items)))
    }

    /// Look up a URL, promoting it to most-recently-used on hit
    pub fn get(&mut self, url: &str) -> Option<Arc<CachedHttpResponse>> {
        match self.items.get(url) {
            Some(entry) => {
                self.hits += 1;
                Some(Arc::clone(entry))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Classify a URL against the cache at `now`
    pub fn lookup(&mut self, url: &str, now: DateTime<Utc>) -> CacheLookup {
        match self.get(url) {
            Some(entry) if entry.is_fresh(now) => CacheLookup::Fresh(entry),
            Some(entry) => CacheLookup::Stale(entry),
            None => CacheLookup::Miss,
        }
    }

    /// Admit a response. Returns false when it is not cacheable.
    pub fn add(&mut self, url: &str, body: Bytes, headers: &HeaderMap) -> bool {
        self.add_at(url, body, headers, Utc::now())
    }

    pub fn add_at(
        &mut self,
        url: &str,
        body: Bytes,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> bool {
        let cache_control = header_str(headers, http::header::CACHE_CONTROL);
        if let Some(cc) = &cache_control {
            if has_directive(cc, "no-store") {
                debug!(url = %url, "Not caching no-store response");
                return false;
            }
        }

        let Some(etag) = header_str(headers, http::header::ETAG) else {
            debug!(url = %url, "Not caching response without ETag");
            return false;
        };

        let expires_at = match cache_control.as_deref() {
            Some(cc) if has_directive(cc, "no-cache") => Some(now),
            Some(cc) if max_age(cc).is_some() => {
                max_age(cc).map(|secs| now + Duration::seconds(secs))
            }
            _ => header_str(headers, http::header::EXPIRES).and_then(|exp| {
                DateTime::parse_from_rfc2822(&exp)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        };

        let entry = CachedHttpResponse {
            url: url.to_string(),
            body,
            etag,
            content_encoding: header_str(headers, http::header::CONTENT_ENCODING),
            content_type: header_str(headers, http::header::CONTENT_TYPE),
            expires_at,
            last_modified: header_str(headers, http::header::LAST_MODIFIED),
            cache_control,
            stored_at: now,
        };

        self.items.put(url.to_string(), Arc::new(entry));
        self.clean_cache();
        true
    }

    /// Evict least-recently-used entries beyond `max_items`. Returns the
    /// number evicted.
    pub fn clean_cache(&mut self) -> usize {
        let mut evicted = 0;
        while self.items.len() > self.max_items {
            if let Some((url, _)) = self.items.pop_lru() {
                debug!(url = %url, "Evicted cached response");
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    /// Check presence without touching recency
    pub fn contains(&self, url: &str) -> bool {
        self.items.contains(url)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl Default for HttpResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

/// What a relay does with an outgoing request
#[derive(Debug, Clone)]
pub enum CachePlan {
    /// Answer from the cache without contacting the origin
    Serve(Arc<CachedHttpResponse>),
    /// `If-None-Match` was added; a 304 is answered from this entry
    Revalidate(Arc<CachedHttpResponse>),
    /// Fetch from the origin. `cacheable` responses are offered to `add`.
    Fetch { cacheable: bool },
}

impl CachePlan {
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, CachePlan::Fetch { cacheable: false })
    }
}

/// Consult the shared cache for a request, adding a validator to `headers`
/// when a stale entry can be revalidated.
pub async fn plan_request(
    cache: &SharedResponseCache,
    url: &str,
    method: &Method,
    headers: &mut HeaderMap,
) -> CachePlan {
    if !is_cacheable_request(method, headers) {
        return CachePlan::Fetch { cacheable: false };
    }

    let lookup = cache.lock().await.lookup(url, Utc::now());
    match lookup {
        CacheLookup::Fresh(entry) => CachePlan::Serve(entry),
        CacheLookup::Stale(entry) if !has_conditional_headers(headers) => {
            match http::HeaderValue::from_str(&entry.etag) {
                Ok(etag) => {
                    headers.insert(http::header::IF_NONE_MATCH, etag);
                    CachePlan::Revalidate(entry)
                }
                Err(_) => CachePlan::Fetch { cacheable: true },
            }
        }
        _ => CachePlan::Fetch { cacheable: true },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_rejects_no_store() {
        let mut cache = HttpResponseCache::new(10);
        let h = headers(&[("etag", "\"abc\""), ("cache-control", "no-store")]);

        assert!(!cache.add("https://a.test/x.js", Bytes::from_static(b"x"), &h));
        assert!(cache.get("https://a.test/x.js").is_none());
    }

    #[test]
    fn test_rejects_missing_etag() {
        let mut cache = HttpResponseCache::new(10);
        let h = headers(&[("cache-control", "public, max-age=600")]);

        assert!(!cache.add("https://a.test/x.js", Bytes::from_static(b"x"), &h));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_parses_fields() {
        let mut cache = HttpResponseCache::new(10);
        let h = headers(&[
            ("etag", "\"v1\""),
            ("cache-control", "public, max-age=600"),
            ("content-type", "application/javascript"),
            ("content-encoding", "gzip"),
            ("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]);
        let now = Utc::now();
        assert!(cache.add_at("https://a.test/app.js", Bytes::from_static(b"js"), &h, now));

        let entry = cache.get("https://a.test/app.js").unwrap();
        assert_eq!(entry.etag, "\"v1\"");
        assert_eq!(entry.content_type.as_deref(), Some("application/javascript"));
        assert_eq!(entry.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(entry.expires_at, Some(now + Duration::seconds(600)));
        assert!(entry.is_fresh(now + Duration::seconds(599)));
        assert!(!entry.is_fresh(now + Duration::seconds(601)));
    }

    #[test]
    fn test_expires_header_used_without_max_age() {
        let mut cache = HttpResponseCache::new(10);
        let h = headers(&[
            ("etag", "\"v1\""),
            ("expires", "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]);
        cache.add("https://a.test/old.css", Bytes::new(), &h);

        let entry = cache.get("https://a.test/old.css").unwrap();
        assert!(entry.expires_at.is_some());
        assert!(!entry.is_fresh(Utc::now()));
    }

    #[test]
    fn test_lookup_fresh_and_stale() {
        let mut cache = HttpResponseCache::new(10);
        let now = Utc::now();
        cache.add_at(
            "https://a.test/fresh.js",
            Bytes::new(),
            &headers(&[("etag", "\"1\""), ("cache-control", "max-age=60")]),
            now,
        );
        cache.add_at(
            "https://a.test/stale.js",
            Bytes::new(),
            &headers(&[("etag", "\"2\""), ("cache-control", "no-cache")]),
            now,
        );

        assert!(matches!(
            cache.lookup("https://a.test/fresh.js", now),
            CacheLookup::Fresh(_)
        ));
        assert!(matches!(
            cache.lookup("https://a.test/stale.js", now),
            CacheLookup::Stale(_)
        ));
        assert!(matches!(
            cache.lookup("https://a.test/none.js", now),
            CacheLookup::Miss
        ));
    }

    #[test]
    fn test_lru_eviction_by_access_order() {
        let mut cache = HttpResponseCache::new(2);
        let h = headers(&[("etag", "\"e\"")]);

        cache.add("a", Bytes::new(), &h);
        cache.add("b", Bytes::new(), &h);

        // Touch "a" so "b" becomes least recently used
        assert!(cache.get("a").is_some());
        cache.add("c", Bytes::new(), &h);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_cacheable_request() {
        let mut h = HeaderMap::new();
        assert!(is_cacheable_request(&Method::GET, &h));
        assert!(!is_cacheable_request(&Method::POST, &h));

        h.insert("range", HeaderValue::from_static("bytes=0-10"));
        assert!(!is_cacheable_request(&Method::GET, &h));
    }

    #[test]
    fn test_cached_response_head() {
        let mut cache = HttpResponseCache::new(2);
        cache.add(
            "https://a.test/app.js",
            Bytes::from_static(b"console.log(1)"),
            &headers(&[("etag", "\"v\""), ("content-type", "text/javascript")]),
        );
        let entry = cache.get("https://a.test/app.js").unwrap();
        let head = entry.response_head().unwrap();

        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(head.headers()["content-length"], "14");
        assert_eq!(head.headers()["etag"], "\"v\"");
    }

    #[tokio::test]
    async fn test_plan_adds_validator_for_stale_entry() {
        let cache = HttpResponseCache::shared(10);
        cache.lock().await.add(
            "https://a.test/app.js",
            Bytes::from_static(b"js"),
            &headers(&[("etag", "\"v2\""), ("cache-control", "no-cache")]),
        );

        let mut request = HeaderMap::new();
        let plan = plan_request(&cache, "https://a.test/app.js", &Method::GET, &mut request).await;
        assert!(matches!(plan, CachePlan::Revalidate(_)));
        assert_eq!(request["if-none-match"], "\"v2\"");

        // Browser validators are left alone
        let mut own = headers(&[("if-none-match", "\"mine\"")]);
        let plan = plan_request(&cache, "https://a.test/app.js", &Method::GET, &mut own).await;
        assert!(matches!(plan, CachePlan::Fetch { cacheable: true }));
        assert_eq!(own["if-none-match"], "\"mine\"");

        let mut post = HeaderMap::new();
        let plan = plan_request(&cache, "https://a.test/app.js", &Method::POST, &mut post).await;
        assert!(!plan.is_cacheable());
    }
}
