//! Two named cache tiers per resource
//!
//! - Full tier: the complete body of a non-Range 200 response, keyed by the
//!   normalized target URL, living `cache_ttl_secs`.
//! - Preload tier: the first `preload_size_bytes` of the resource, fetched by
//!   a separate Range request and keyed by URL plus a window marker, living
//!   half as long.
//!
//! Range requests only ever consult the preload tier, plain GETs only the
//! full tier. Lookup failures read as misses; write failures are reported to
//! the caller, which logs and drops them.

use crate::cache::{CacheEntry, CacheStore, CacheTier};
use crate::error::{ProxyError, Result};
use crate::fetcher::{FetchPlan, UpstreamFetcher};
use crate::identity::IdentitySpoofer;
use crate::models::{content_range_total, RangeSpec};
use crate::normalizer::cacheable_headers;
use crate::profile::DeploymentProfile;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

/// A preload-tier hit, already cut down to the requested slice
#[derive(Debug, Clone)]
pub struct PreloadHit {
    pub entry: CacheEntry,
    pub start: u64,
    pub end: u64,
    /// Full resource length, if the stored window recorded it
    pub total: Option<u64>,
    pub body: Bytes,
}

impl PreloadHit {
    /// `Content-Range` value for the served slice
    pub fn content_range(&self) -> String {
        match self.total {
            Some(total) => format!("bytes {}-{}/{}", self.start, self.end, total),
            None => format!("bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Tiered cache manager over an injected store
#[derive(Clone)]
pub struct TieredCache {
    store: Arc<dyn CacheStore>,
}

impl TieredCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        TieredCache { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Full-tier key: the target URL canonicalized, fragment dropped.
    /// The query string is kept since it often selects the resource.
    pub fn full_key(target: &str) -> String {
        match Url::parse(target) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => target.to_string(),
        }
    }

    /// Preload-tier key; the window marker keeps it apart from the full key
    pub fn preload_key(target: &str, profile: &DeploymentProfile) -> String {
        format!(
            "{}#preload=0-{}",
            Self::full_key(target),
            profile.preload_window_end()
        )
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache lookup failed for {}, treating as miss: {}", key, e);
                None
            }
        }
    }

    /// Full-tier lookup for a non-Range GET
    pub async fn lookup_full(&self, target: &str) -> Option<CacheEntry> {
        let key = Self::full_key(target);
        let found = self.get(&key).await;
        debug!(
            "Full tier {}: {}",
            if found.is_some() { "hit" } else { "miss" },
            key
        );
        found
    }

    /// Preload-tier lookup for a Range request.
    ///
    /// Hits only when the requested start lies inside the cached window; the
    /// end is clamped to the window. Suffix and multi-part ranges always miss.
    pub async fn lookup_preload(
        &self,
        target: &str,
        range_header: &str,
        profile: &DeploymentProfile,
    ) -> Option<PreloadHit> {
        let range = match RangeSpec::from_header(range_header) {
            Ok(range) => range,
            Err(e) => {
                debug!("Range {} not servable from preload tier: {}", range_header, e);
                return None;
            }
        };

        if range.start >= profile.preload_size_bytes {
            return None;
        }

        let key = Self::preload_key(target, profile);
        let entry = self.get(&key).await?;

        let window_len = entry.body.len() as u64;
        if range.start >= window_len {
            return None;
        }

        let window_end = window_len - 1;
        let end = range.end.map_or(window_end, |end| end.min(window_end));
        let total = entry
            .headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);
        let body = entry.body.slice(range.start as usize..=end as usize);

        debug!("Preload tier hit: {} bytes {}-{}", key, range.start, end);
        Some(PreloadHit {
            entry,
            start: range.start,
            end,
            total,
            body,
        })
    }

    /// Whether a fresh preload window exists for the target
    pub async fn has_preload(&self, target: &str, profile: &DeploymentProfile) -> bool {
        self.get(&Self::preload_key(target, profile)).await.is_some()
    }

    /// Store a complete body in the full tier. Only 200 responses are eligible.
    pub async fn store_full(
        &self,
        target: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        profile: &DeploymentProfile,
    ) -> Result<bool> {
        if status != StatusCode::OK {
            return Ok(false);
        }

        let key = Self::full_key(target);
        let size = body.len();
        let entry = CacheEntry {
            key: key.clone(),
            kind: CacheTier::Full,
            status: status.as_u16(),
            headers,
            body,
            written_at: UNIX_EPOCH,
            ttl: Duration::ZERO,
        };
        self.store.put(&key, entry, profile.cache_ttl()).await?;

        info!("Cached audio file: {} ({} bytes)", target, size);
        Ok(true)
    }

    /// Fetch bytes `0..preload_size_bytes-1` with a separate Range request and
    /// store them in the preload tier.
    ///
    /// Returns `Ok(false)` when the upstream does not answer 206; a full-body
    /// 200 is never stored as a window.
    pub async fn populate_preload(
        &self,
        fetcher: &UpstreamFetcher,
        spoofer: &IdentitySpoofer,
        target: &str,
        profile: &DeploymentProfile,
    ) -> Result<bool> {
        let window = RangeSpec::closed_header(0, profile.preload_window_end());
        let identity = spoofer.identity_for(target, Some(&window));
        let plan = FetchPlan {
            method: Method::GET,
            url: target,
            identity: &identity,
            profile,
            is_range: true,
        };

        let outcome = fetcher.fetch(&plan).await?;
        let status = outcome.response.status;
        if status != StatusCode::PARTIAL_CONTENT {
            debug!("Preload of {} answered {}, not caching", target, status);
            return Ok(false);
        }

        let headers = cacheable_headers(&outcome.response.headers);
        let body = outcome.response.body.into_bytes().await?;
        if body.is_empty() || body.len() as u64 > profile.preload_size_bytes {
            return Err(ProxyError::CacheError(format!(
                "preload window for {} has unexpected size {}",
                target,
                body.len()
            )));
        }

        let key = Self::preload_key(target, profile);
        let size = body.len();
        let entry = CacheEntry {
            key: key.clone(),
            kind: CacheTier::Preload,
            status: status.as_u16(),
            headers,
            body,
            written_at: UNIX_EPOCH,
            ttl: Duration::ZERO,
        };
        self.store.put(&key, entry, profile.preload_ttl()).await?;

        info!("Preloaded {} bytes for {}", size, target);
        Ok(true)
    }

    /// Drop both tiers for a target; returns how many entries were removed
    pub async fn evict(&self, target: &str, profile: &DeploymentProfile) -> Result<usize> {
        let mut removed = 0;
        if self.store.evict(&Self::full_key(target)).await? {
            removed += 1;
        }
        if self.store.evict(&Self::preload_key(target, profile)).await? {
            removed += 1;
        }
        Ok(removed)
    }
}
