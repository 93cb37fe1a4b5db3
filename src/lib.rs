//! Audio Relay
//!
//! A range-aware streaming proxy for remote audio files. Clients ask for
//! `GET /api/audio?url=<target>` (optionally with a `Range` header) and get
//! the audio back with permissive CORS, a stable Content-Type and diagnostic
//! headers, fetched through a spoofed browser identity and served from a
//! two-tier cache when possible.
//!
//! # Features
//!
//! - **Deployment Profiles**: TTL, preload size, timeout and retry budget chosen per request
//!   from a data-driven rule table
//! - **Identity Spoofing**: deterministic User-Agent per URL plus Referer/Origin derived from the target
//! - **Bounded Retries**: strictly sequential attempts, each with its own timeout
//! - **Tiered Cache**: full bodies for plain GETs, a preload window for Range requests
//! - **Background Population**: cache writes run after the response is handed off and are
//!   drained on shutdown
//! - **Proxy Chain Fallback**: buffered base64 transfer for JSON-only clients
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use audio_relay::{BackgroundTasks, MemoryCacheStore, ProxyDeps, ReqwestTransport};
//! use audio_relay::handler::route;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tasks = Arc::new(BackgroundTasks::new());
//! let deps = ProxyDeps::new(Arc::new(ReqwestTransport::new()?), tasks.clone())
//!     .with_cache(Arc::new(MemoryCacheStore::new()));
//!
//! let uri = "/api/audio?url=https://example.com/a.mp3".parse()?;
//! let response = route(&http::Method::GET, &uri, &http::HeaderMap::new(), &deps).await;
//! println!("{} {:?}", response.status, response.header_str("x-cache-status"));
//!
//! tasks.drain().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`handle_proxy_request`]: the core contract, `(request, deps) -> ResponseEnvelope`
//! - [`ProfileResolver`]: picks the [`DeploymentProfile`] for a request
//! - [`IdentitySpoofer`]: builds outbound headers
//! - [`UpstreamFetcher`]: retry loop over an injected [`HttpTransport`]
//! - [`TieredCache`]: full and preload tiers over an injected [`CacheStore`]
//! - [`normalizer`]: header allow-list, Content-Type and status decisions, envelopes
//! - [`ProxyChain`]: buffered fallback chain with base64 transport
//! - [`server`]: hyper HTTP/1 adapter

pub mod background;
pub mod cache;
pub mod capture;
pub mod config;
pub mod error;
pub mod fallback;
pub mod fetcher;
pub mod handler;
pub mod identity;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod profile;
pub mod server;
pub mod tiered_cache;
pub mod transport;

pub use background::{BackgroundTasks, TaskScheduler};
pub use cache::{
    CacheEntry, CacheStore, CacheTier, Clock, FileCacheStore, ManualClock, MemoryCacheStore,
    SystemClock,
};
pub use config::{CacheConfig, FallbackConfig, ProxyConfig};
pub use error::{ProxyError, Result};
pub use fallback::{BufferedPayload, FetchStage, ProxyChain};
pub use fetcher::{RetryPolicy, UpstreamFetcher};
pub use handler::{handle_proxy_request, route, ProxyDeps};
pub use identity::{IdentitySpoofer, SpoofedIdentity};
pub use metrics::ProxyMetrics;
pub use models::{CacheSource, CacheStatus, ProxyRequest, RangeSpec, RequestKind};
pub use normalizer::ResponseEnvelope;
pub use profile::{DeploymentProfile, ProfileResolver, ProfileRule, ResolvedProfile, Signal};
pub use server::AppState;
pub use tiered_cache::TieredCache;
pub use transport::{HttpTransport, ReqwestTransport, ResponseBody};
