//! Prometheus metrics for the relay
//!
//! Every collector lives in a private [`Registry`] so several relays (or
//! tests) in one process never clash on the global default registry.

use crate::cache::CacheTier;
use crate::fetcher::{AttemptOutcome, UpstreamAttempt};
use crate::models::RequestKind;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metrics collector shared by the handler, fallback chain and server
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Requests by kind (range/full/head)
    requests_total: CounterVec,

    /// Cache lookups by tier and result (hit/miss)
    cache_lookups_total: CounterVec,

    /// Upstream attempts by outcome (success/http_error/network_error/timeout)
    upstream_attempts_total: CounterVec,

    /// Background cache writes by tier and result (stored/skipped/failed)
    cache_writes_total: CounterVec,

    /// Fallback chain stages by stage and result
    fallback_stages_total: CounterVec,

    /// Time to produce the response envelope
    request_duration_seconds: HistogramVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new("audio_relay_requests_total", "Total number of proxy requests"),
            &["kind"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cache_lookups_total = CounterVec::new(
            Opts::new(
                "audio_relay_cache_lookups_total",
                "Cache lookups by tier and result",
            ),
            &["tier", "result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let upstream_attempts_total = CounterVec::new(
            Opts::new(
                "audio_relay_upstream_attempts_total",
                "Upstream fetch attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(upstream_attempts_total.clone()))?;

        let cache_writes_total = CounterVec::new(
            Opts::new(
                "audio_relay_cache_writes_total",
                "Background cache writes by tier and result",
            ),
            &["tier", "result"],
        )?;
        registry.register(Box::new(cache_writes_total.clone()))?;

        let fallback_stages_total = CounterVec::new(
            Opts::new(
                "audio_relay_fallback_stages_total",
                "Fallback chain stages by stage and result",
            ),
            &["stage", "result"],
        )?;
        registry.register(Box::new(fallback_stages_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "audio_relay_request_duration_seconds",
                "Time to produce the proxy response in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["kind"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            cache_lookups_total,
            upstream_attempts_total,
            cache_writes_total,
            fallback_stages_total,
            request_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, kind: RequestKind, head: bool) {
        let label = if head {
            "head"
        } else {
            match kind {
                RequestKind::Range => "range",
                RequestKind::Full => "full",
            }
        };
        self.requests_total.with_label_values(&[label]).inc();
    }

    pub fn record_cache_lookup(&self, tier: CacheTier, hit: bool) {
        self.cache_lookups_total
            .with_label_values(&[tier.as_str(), if hit { "hit" } else { "miss" }])
            .inc();
    }

    pub fn record_attempts(&self, attempts: &[UpstreamAttempt]) {
        for attempt in attempts {
            let outcome = match attempt.outcome {
                AttemptOutcome::Success(_) => "success",
                AttemptOutcome::HttpError(_) => "http_error",
                AttemptOutcome::NetworkError(_) => "network_error",
                AttemptOutcome::TimedOut => "timeout",
            };
            self.upstream_attempts_total
                .with_label_values(&[outcome])
                .inc();
        }
    }

    /// Attempts that ended in exhaustion only report their count
    pub fn record_failed_attempts(&self, count: usize) {
        self.upstream_attempts_total
            .with_label_values(&["failed"])
            .inc_by(count as f64);
    }

    pub fn record_cache_write(&self, tier: CacheTier, result: &str) {
        self.cache_writes_total
            .with_label_values(&[tier.as_str(), result])
            .inc();
    }

    pub fn record_fallback_stage(&self, stage: &str, success: bool) {
        self.fallback_stages_total
            .with_label_values(&[stage, if success { "success" } else { "failure" }])
            .inc();
    }

    pub fn record_request_duration(&self, kind: RequestKind, duration: Duration) {
        self.request_duration_seconds
            .with_label_values(&[kind.as_str()])
            .observe(duration.as_secs_f64());
    }

    /// Render every collector in Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Current value of a labelled request counter
    pub fn requests(&self, kind: &str) -> u64 {
        self.requests_total.with_label_values(&[kind]).get() as u64
    }

    /// Current value of a labelled cache lookup counter
    pub fn cache_lookups(&self, tier: CacheTier, result: &str) -> u64 {
        self.cache_lookups_total
            .with_label_values(&[tier.as_str(), result])
            .get() as u64
    }

    /// Current value of a labelled cache write counter
    pub fn cache_writes(&self, tier: CacheTier, result: &str) -> u64 {
        self.cache_writes_total
            .with_label_values(&[tier.as_str(), result])
            .get() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_registries_do_not_clash() {
        let a = ProxyMetrics::new().unwrap();
        let b = ProxyMetrics::new().unwrap();
        a.record_request(RequestKind::Range, false);
        assert_eq!(a.requests("range"), 1);
        assert_eq!(b.requests("range"), 0);
    }

    #[test]
    fn test_gather_text_contains_families() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.record_request(RequestKind::Full, false);
        metrics.record_cache_lookup(CacheTier::Full, true);
        metrics.record_cache_write(CacheTier::Preload, "stored");
        metrics.record_fallback_stage("builtin", false);
        metrics.record_request_duration(RequestKind::Full, Duration::from_millis(12));

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("audio_relay_requests_total{kind=\"full\"} 1"));
        assert!(text.contains("audio_relay_cache_lookups_total"));
        assert!(text.contains("audio_relay_cache_writes_total"));
        assert!(text.contains("audio_relay_fallback_stages_total"));
        assert!(text.contains("audio_relay_request_duration_seconds_bucket"));
        assert_eq!(metrics.cache_lookups(CacheTier::Full, "hit"), 1);
    }
}
