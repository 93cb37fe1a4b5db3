//! Upstream fetcher with bounded, sequential retries

use crate::error::{ProxyError, Result};
use crate::identity::SpoofedIdentity;
use crate::profile::DeploymentProfile;
use crate::transport::{HttpTransport, UpstreamRequest, UpstreamResponse};
use http::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Timeout multiplier for full-file fetches against raw-content hosts
const RAW_FULL_TIMEOUT_FACTOR: f64 = 1.5;
/// Timeout multiplier for small range probes against ordinary hosts
const RANGE_TIMEOUT_FACTOR: f64 = 0.8;

/// Outcome of one upstream attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(u16),
    HttpError(u16),
    NetworkError(String),
    TimedOut,
}

/// Record of one upstream attempt
#[derive(Debug, Clone)]
pub struct UpstreamAttempt {
    pub index: usize,
    pub started_at: Instant,
    pub outcome: AttemptOutcome,
}

/// Retry policy: `max_retries` retries after the first attempt, fixed delay between them
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        RetryPolicy { max_retries, delay }
    }

    pub fn from_profile(profile: &DeploymentProfile) -> Self {
        Self::new(profile.max_retries, profile.retry_delay())
    }

    /// Check if we should retry after `attempt` (zero-based) failed
    pub fn should_retry(&self, attempt: usize, error: &ProxyError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Total attempts this policy allows
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Per-attempt timeout after host/range scaling
pub fn attempt_timeout(profile: &DeploymentProfile, is_range: bool, raw_content: bool) -> Duration {
    let base = profile.per_attempt_timeout().as_millis() as f64;
    let scaled = if raw_content && !is_range {
        base * RAW_FULL_TIMEOUT_FACTOR
    } else if !raw_content && is_range {
        base * RANGE_TIMEOUT_FACTOR
    } else {
        base
    };
    Duration::from_millis(scaled.round() as u64)
}

/// What to fetch and how
#[derive(Debug, Clone)]
pub struct FetchPlan<'a> {
    pub method: Method,
    pub url: &'a str,
    pub identity: &'a SpoofedIdentity,
    pub profile: &'a DeploymentProfile,
    pub is_range: bool,
}

/// A successful upstream response and the attempts it took
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: UpstreamResponse,
    pub attempts: Vec<UpstreamAttempt>,
}

impl FetchOutcome {
    /// Retries actually used (attempts beyond the first)
    pub fn retries_used(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }
}

/// Executes the retry loop against one target
#[derive(Clone)]
pub struct UpstreamFetcher {
    transport: Arc<dyn HttpTransport>,
}

impl UpstreamFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        UpstreamFetcher { transport }
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Single attempt bounded by its own timer; non-[200,400) statuses are errors
    async fn try_fetch(&self, plan: &FetchPlan<'_>, limit: Duration) -> Result<UpstreamResponse> {
        let request = UpstreamRequest {
            method: plan.method.clone(),
            url: plan.url.to_string(),
            headers: plan.identity.headers.clone(),
        };

        let response = match timeout(limit, self.transport.send(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::Timeout(format!(
                    "no response within {}ms",
                    limit.as_millis()
                )))
            }
        };

        if !response.is_acceptable() {
            return Err(ProxyError::from_status(response.status.as_u16()));
        }

        Ok(response)
    }

    /// Fetch with retries.
    ///
    /// Attempts are strictly sequential and never exceed `max_retries + 1`.
    /// On exhaustion the error carries the last status the upstream sent (if
    /// any) and the last failure message.
    pub async fn fetch(&self, plan: &FetchPlan<'_>) -> Result<FetchOutcome> {
        let policy = RetryPolicy::from_profile(plan.profile);
        let limit = attempt_timeout(plan.profile, plan.is_range, plan.identity.raw_content);
        let mut attempts = Vec::with_capacity(policy.max_attempts());
        let mut last_status = None;
        let mut attempt = 0;

        loop {
            let started_at = Instant::now();

            match self.try_fetch(plan, limit).await {
                Ok(response) => {
                    debug!(
                        "Upstream {} answered {} on attempt {}",
                        plan.url,
                        response.status,
                        attempt + 1
                    );
                    attempts.push(UpstreamAttempt {
                        index: attempt,
                        started_at,
                        outcome: AttemptOutcome::Success(response.status.as_u16()),
                    });
                    return Ok(FetchOutcome { response, attempts });
                }
                Err(e) => {
                    let outcome = match &e {
                        ProxyError::UpstreamStatus { status } => {
                            last_status = Some(*status);
                            AttemptOutcome::HttpError(*status)
                        }
                        ProxyError::Timeout(_) => AttemptOutcome::TimedOut,
                        other => AttemptOutcome::NetworkError(other.to_string()),
                    };
                    attempts.push(UpstreamAttempt {
                        index: attempt,
                        started_at,
                        outcome,
                    });

                    if !policy.should_retry(attempt, &e) {
                        warn!(
                            "Upstream {} failed after {} attempts: {}",
                            plan.url,
                            attempt + 1,
                            e
                        );
                        return Err(ProxyError::UpstreamExhausted {
                            attempts: attempt + 1,
                            last_status,
                            message: e.to_string(),
                        });
                    }

                    warn!(
                        "Proxy attempt {} for {} failed, retrying after {:?}: {}",
                        attempt + 1,
                        plan.url,
                        policy.delay,
                        e
                    );
                    sleep(policy.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
