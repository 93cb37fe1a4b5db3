//! Request handler: the core proxy contract
//!
//! [`handle_proxy_request`] turns a validated [`ProxyRequest`] into a
//! [`ResponseEnvelope`] using only the injected [`ProxyDeps`]. Flow:
//!
//! 1. Resolve the deployment profile from request metadata
//! 2. Consult the tier matching the request kind (preload for Range, full otherwise)
//! 3. On a miss, fetch upstream with retries and a spoofed identity
//! 4. Normalize the reply and hand it back while cache writes run in the background
//!
//! Cache failures never change what the client receives.

use crate::background::TaskScheduler;
use crate::cache::{CacheStore, CacheTier};
use crate::capture::CaptureStream;
use crate::error::ProxyError;
use crate::fetcher::{FetchPlan, UpstreamFetcher};
use crate::identity::IdentitySpoofer;
use crate::metrics::ProxyMetrics;
use crate::models::{CacheSource, ProxyRequest, RequestKind};
use crate::normalizer::{self, cacheable_headers, Diagnostics, ResponseEnvelope};
use crate::profile::{DeploymentProfile, ProfileResolver, RequestMetadata};
use crate::tiered_cache::TieredCache;
use crate::transport::{HttpTransport, ResponseBody};
use bytes::Bytes;
use futures::FutureExt;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on a body captured into the full tier
pub const DEFAULT_MAX_CACHEABLE_BYTES: usize = 50 * 1024 * 1024;

/// Pause before the preload window fetch so it does not compete with the
/// response that triggered it
pub const DEFAULT_PRELOAD_SETTLE: Duration = Duration::from_millis(100);

/// Everything the handler needs, supplied by the host
#[derive(Clone)]
pub struct ProxyDeps {
    pub fetcher: UpstreamFetcher,
    pub spoofer: Arc<IdentitySpoofer>,
    pub resolver: Arc<ProfileResolver>,
    pub scheduler: Arc<dyn TaskScheduler>,
    /// `None` disables both cache tiers
    pub cache: Option<TieredCache>,
    pub metrics: Option<ProxyMetrics>,
    pub max_cacheable_bytes: usize,
    pub preload_settle: Duration,
}

impl ProxyDeps {
    pub fn new(transport: Arc<dyn HttpTransport>, scheduler: Arc<dyn TaskScheduler>) -> Self {
        ProxyDeps {
            fetcher: UpstreamFetcher::new(transport),
            spoofer: Arc::new(IdentitySpoofer::default()),
            resolver: Arc::new(ProfileResolver::default()),
            scheduler,
            cache: None,
            metrics: None,
            max_cacheable_bytes: DEFAULT_MAX_CACHEABLE_BYTES,
            preload_settle: DEFAULT_PRELOAD_SETTLE,
        }
    }

    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(TieredCache::new(store));
        self
    }

    pub fn with_spoofer(mut self, spoofer: IdentitySpoofer) -> Self {
        self.spoofer = Arc::new(spoofer);
        self
    }

    pub fn with_resolver(mut self, resolver: ProfileResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_metrics(mut self, metrics: ProxyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_max_cacheable_bytes(mut self, max: usize) -> Self {
        self.max_cacheable_bytes = max;
        self
    }

    pub fn with_preload_settle(mut self, settle: Duration) -> Self {
        self.preload_settle = settle;
        self
    }
}

/// Entry point for the proxy path: preflight, validation, then the proxy itself
pub async fn route(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    deps: &ProxyDeps,
) -> ResponseEnvelope {
    if method == Method::OPTIONS {
        return normalizer::preflight();
    }

    match ProxyRequest::from_parts(method, uri, headers) {
        Ok(request) => handle_proxy_request(request, deps).await,
        Err(e) => {
            debug!("Rejected proxy request: {}", e);
            normalizer::error_envelope(&e, None)
        }
    }
}

/// Serve one validated request
pub async fn handle_proxy_request(request: ProxyRequest, deps: &ProxyDeps) -> ResponseEnvelope {
    let started = Instant::now();
    let kind = request.kind();

    if let Some(metrics) = &deps.metrics {
        metrics.record_request(kind, request.is_head());
    }

    let resolved = deps.resolver.resolve(&RequestMetadata {
        headers: &request.headers,
        user_agent: request.user_agent.as_deref(),
        host: request.host.as_deref(),
    });
    let profile = resolved.profile;

    debug!(
        "{} {} ({}, profile {})",
        request.method, request.target, kind, resolved.name
    );

    let envelope = match lookup_cache(&request, &profile, deps, started).await {
        Some(hit) => hit,
        None => fetch_and_normalize(&request, &profile, deps, started).await,
    };

    if let Some(metrics) = &deps.metrics {
        metrics.record_request_duration(kind, started.elapsed());
    }
    envelope
}

async fn lookup_cache(
    request: &ProxyRequest,
    profile: &DeploymentProfile,
    deps: &ProxyDeps,
    started: Instant,
) -> Option<ResponseEnvelope> {
    let cache = deps.cache.as_ref()?;
    if request.is_head() {
        return None;
    }

    match &request.range {
        Some(range) => {
            let hit = cache.lookup_preload(&request.target, range, profile).await;
            if let Some(metrics) = &deps.metrics {
                metrics.record_cache_lookup(CacheTier::Preload, hit.is_some());
            }
            let hit = hit?;
            let diag = Diagnostics::hit(started, RequestKind::Range, CacheSource::Preload);
            Some(normalizer::from_preload_hit(
                hit,
                &request.target,
                profile,
                &diag,
            ))
        }
        None => {
            let entry = cache.lookup_full(&request.target).await;
            if let Some(metrics) = &deps.metrics {
                metrics.record_cache_lookup(CacheTier::Full, entry.is_some());
            }
            let entry = entry?;
            let diag = Diagnostics::hit(started, RequestKind::Full, CacheSource::Edge);
            Some(normalizer::from_full_hit(
                entry,
                &request.target,
                profile,
                &diag,
            ))
        }
    }
}

async fn fetch_and_normalize(
    request: &ProxyRequest,
    profile: &DeploymentProfile,
    deps: &ProxyDeps,
    started: Instant,
) -> ResponseEnvelope {
    let kind = request.kind();
    let identity = deps
        .spoofer
        .identity_for(&request.target, request.range.as_deref());
    let plan = FetchPlan {
        method: request.method.clone(),
        url: &request.target,
        identity: &identity,
        profile,
        is_range: request.is_range(),
    };

    let outcome = match deps.fetcher.fetch(&plan).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let attempts = match &e {
                ProxyError::UpstreamExhausted { attempts, .. } => *attempts,
                _ => 1,
            };
            if let Some(metrics) = &deps.metrics {
                metrics.record_failed_attempts(attempts);
            }
            warn!("Proxy request for {} failed: {}", request.target, e);
            let diag = Diagnostics::origin(started, kind, attempts.saturating_sub(1));
            return normalizer::error_envelope(&e, Some(&diag));
        }
    };

    if let Some(metrics) = &deps.metrics {
        metrics.record_attempts(&outcome.attempts);
    }

    let diag = Diagnostics::origin(started, kind, outcome.retries_used());
    let mut envelope = normalizer::normalize(
        outcome.response,
        &request.target,
        request.is_range(),
        profile,
        &diag,
    );

    if request.is_head() {
        envelope.body = ResponseBody::Empty;
        return envelope;
    }

    if request.method == Method::GET {
        if let Some(cache) = &deps.cache {
            if !request.is_range() && envelope.status == StatusCode::OK {
                capture_full(&mut envelope, cache, &request.target, profile, deps);
            }
            schedule_preload(cache, &request.target, profile, deps);
        }
    }

    envelope
}

/// Tee the response body into the full tier once the client has received it
fn capture_full(
    envelope: &mut ResponseEnvelope,
    cache: &TieredCache,
    target: &str,
    profile: &DeploymentProfile,
    deps: &ProxyDeps,
) {
    let body = std::mem::replace(&mut envelope.body, ResponseBody::Empty);
    let headers = cacheable_headers(&envelope.headers);
    let limit = deps.max_cacheable_bytes;

    let pending: futures::future::BoxFuture<'static, Option<Bytes>> = match body {
        ResponseBody::Stream(stream) => {
            let (capture, receiver) = CaptureStream::new(stream, limit);
            envelope.body = ResponseBody::Stream(Box::pin(capture));
            async move { receiver.await.ok() }.boxed()
        }
        ResponseBody::Full(bytes) => {
            envelope.body = ResponseBody::Full(bytes.clone());
            let fits = bytes.len() <= limit;
            async move { fits.then_some(bytes) }.boxed()
        }
        ResponseBody::Empty => return,
    };

    let cache = cache.clone();
    let target = target.to_string();
    let profile = profile.clone();
    let metrics = deps.metrics.clone();

    deps.scheduler.schedule(
        "cache-full",
        async move {
            let result = match pending.await {
                Some(body) => {
                    match cache
                        .store_full(&target, StatusCode::OK, headers, body, &profile)
                        .await
                    {
                        Ok(true) => "stored",
                        Ok(false) => "skipped",
                        Err(e) => {
                            warn!("Failed to cache {}: {}", target, e);
                            "failed"
                        }
                    }
                }
                None => {
                    debug!("Body of {} not captured, skipping full-tier write", target);
                    "skipped"
                }
            };
            if let Some(metrics) = metrics {
                metrics.record_cache_write(CacheTier::Full, result);
            }
        }
        .boxed(),
    );
}

/// Fetch and store the preload window unless a fresh one already exists
fn schedule_preload(
    cache: &TieredCache,
    target: &str,
    profile: &DeploymentProfile,
    deps: &ProxyDeps,
) {
    let cache = cache.clone();
    let target = target.to_string();
    let profile = profile.clone();
    let fetcher = deps.fetcher.clone();
    let spoofer = deps.spoofer.clone();
    let metrics = deps.metrics.clone();
    let settle = deps.preload_settle;

    deps.scheduler.schedule(
        "cache-preload",
        async move {
            if cache.has_preload(&target, &profile).await {
                return;
            }
            tokio::time::sleep(settle).await;

            let result = match cache
                .populate_preload(&fetcher, &spoofer, &target, &profile)
                .await
            {
                Ok(true) => {
                    info!("Preload window ready for {}", target);
                    "stored"
                }
                Ok(false) => "skipped",
                Err(e) => {
                    warn!("Preload failed for {}: {}", target, e);
                    "failed"
                }
            };
            if let Some(metrics) = metrics {
                metrics.record_cache_write(CacheTier::Preload, result);
            }
        }
        .boxed(),
    );
}
