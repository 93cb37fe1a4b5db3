//! Deployment profile resolution
//!
//! A profile bundles the tuning knobs that differ between hosting
//! environments: cache lifetime, preload window, per-attempt timeout and
//! retry budget. The resolver walks an ordered rule table and returns the
//! first profile whose detection signal matches the inbound request; no rule
//! matching yields the default profile. Resolution is pure and never fails.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Tuning bundle selected once per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentProfile {
    /// Full-tier cache lifetime; the preload tier lives half as long
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Size of the preload window (`0..preload_size_bytes-1`)
    #[serde(default = "default_preload_size")]
    pub preload_size_bytes: u64,

    /// Base per-attempt timeout before host/range scaling
    #[serde(default = "default_timeout_ms")]
    pub per_attempt_timeout_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_preload_size() -> u64 {
    1024 * 1024
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> usize {
    1
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for DeploymentProfile {
    fn default() -> Self {
        DeploymentProfile {
            cache_ttl_secs: default_cache_ttl(),
            preload_size_bytes: default_preload_size(),
            per_attempt_timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl DeploymentProfile {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Preload entries live roughly half as long as full entries
    pub fn preload_ttl(&self) -> Duration {
        Duration::from_secs((self.cache_ttl_secs / 2).max(1))
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Inclusive end offset of the preload window
    pub fn preload_window_end(&self) -> u64 {
        self.preload_size_bytes.saturating_sub(1)
    }
}

/// One detection signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// A platform proxy header is present
    Header { name: String },
    /// The `Host` header ends with the given suffix
    HostSuffix { suffix: String },
    /// The `User-Agent` or `Host` contains the marker (case-insensitive)
    Marker { marker: String },
    /// The `User-Agent` contains every token (case-insensitive)
    UserAgentAll { tokens: Vec<String> },
}

/// Name reported when no rule matches
pub const DEFAULT_PROFILE_NAME: &str = "standard";

/// Request metadata the resolver looks at
#[derive(Debug, Clone, Copy)]
pub struct RequestMetadata<'a> {
    pub headers: &'a HeaderMap,
    pub user_agent: Option<&'a str>,
    pub host: Option<&'a str>,
}

impl Signal {
    fn matches(&self, meta: &RequestMetadata<'_>) -> bool {
        let user_agent = meta.user_agent.unwrap_or_default().to_ascii_lowercase();
        let host = meta.host.unwrap_or_default().to_ascii_lowercase();

        match self {
            Signal::Header { name } => meta.headers.contains_key(name.as_str()),
            Signal::HostSuffix { suffix } => {
                let host = host.split(':').next().unwrap_or_default();
                host.ends_with(&suffix.to_ascii_lowercase())
            }
            Signal::Marker { marker } => {
                let marker = marker.to_ascii_lowercase();
                user_agent.contains(&marker) || host.contains(&marker)
            }
            Signal::UserAgentAll { tokens } => {
                !tokens.is_empty()
                    && tokens
                        .iter()
                        .all(|t| user_agent.contains(&t.to_ascii_lowercase()))
            }
        }
    }
}

/// A named profile and the signals that select it (any signal matches)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRule {
    pub name: String,
    pub when: Vec<Signal>,
    pub profile: DeploymentProfile,
}

impl ProfileRule {
    fn matches(&self, meta: &RequestMetadata<'_>) -> bool {
        self.when.iter().any(|signal| signal.matches(meta))
    }
}

/// Built-in rule table, ordered strongest signal first: platform headers and
/// hostnames, then User-Agent markers.
pub fn builtin_rules() -> Vec<ProfileRule> {
    vec![
        ProfileRule {
            name: "cloudflare".to_string(),
            when: vec![
                Signal::Header { name: "cf-ray".to_string() },
                Signal::HostSuffix { suffix: ".pages.dev".to_string() },
            ],
            profile: DeploymentProfile {
                cache_ttl_secs: 7200,
                preload_size_bytes: 2 * 1024 * 1024,
                per_attempt_timeout_ms: 10_000,
                max_retries: 1,
                retry_delay_ms: 100,
            },
        },
        ProfileRule {
            name: "vercel".to_string(),
            when: vec![
                Signal::Header { name: "x-vercel-id".to_string() },
                Signal::HostSuffix { suffix: ".vercel.app".to_string() },
            ],
            profile: DeploymentProfile {
                cache_ttl_secs: 86_400,
                preload_size_bytes: 1024 * 1024,
                per_attempt_timeout_ms: 6_000,
                max_retries: 1,
                retry_delay_ms: 100,
            },
        },
        ProfileRule {
            name: "edgeone".to_string(),
            when: vec![
                Signal::HostSuffix { suffix: ".edgeone.app".to_string() },
                Signal::Marker { marker: "edgeone".to_string() },
            ],
            profile: DeploymentProfile {
                cache_ttl_secs: 7200,
                preload_size_bytes: 2 * 1024 * 1024,
                per_attempt_timeout_ms: 10_000,
                max_retries: 1,
                retry_delay_ms: 100,
            },
        },
        ProfileRule {
            name: "mobile-chrome".to_string(),
            when: vec![Signal::UserAgentAll {
                tokens: vec!["android".to_string(), "chrome".to_string()],
            }],
            profile: DeploymentProfile {
                cache_ttl_secs: 7200,
                preload_size_bytes: 1024 * 1024,
                per_attempt_timeout_ms: 15_000,
                max_retries: 2,
                retry_delay_ms: 500,
            },
        },
    ]
}

/// Profile chosen for a request, with the name of the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
    pub name: String,
    pub profile: DeploymentProfile,
}

/// Data-driven profile resolver
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    rules: Vec<ProfileRule>,
    default_profile: DeploymentProfile,
    /// Deployment identity fixed at process start; wins over request signals
    pinned: Option<ResolvedProfile>,
}

impl Default for ProfileResolver {
    fn default() -> Self {
        Self::new(builtin_rules(), DeploymentProfile::default())
    }
}

impl ProfileResolver {
    pub fn new(rules: Vec<ProfileRule>, default_profile: DeploymentProfile) -> Self {
        ProfileResolver {
            rules,
            default_profile,
            pinned: None,
        }
    }

    /// Pin the resolver to a named rule (static deployment identity).
    ///
    /// `standard` pins the default profile. Unknown names leave request-based
    /// detection in place.
    pub fn with_deployment(mut self, name: &str) -> Self {
        self.pinned = if name == DEFAULT_PROFILE_NAME {
            Some(self.default_resolved())
        } else {
            self.rules
                .iter()
                .find(|rule| rule.name == name)
                .map(|rule| ResolvedProfile {
                    name: rule.name.clone(),
                    profile: rule.profile.clone(),
                })
        };
        self
    }

    fn default_resolved(&self) -> ResolvedProfile {
        ResolvedProfile {
            name: DEFAULT_PROFILE_NAME.to_string(),
            profile: self.default_profile.clone(),
        }
    }

    pub fn rules(&self) -> &[ProfileRule] {
        &self.rules
    }

    /// Resolve the profile for one request
    pub fn resolve(&self, meta: &RequestMetadata<'_>) -> ResolvedProfile {
        if let Some(pinned) = &self.pinned {
            return pinned.clone();
        }

        let resolved = self
            .rules
            .iter()
            .find(|rule| rule.matches(meta))
            .map(|rule| ResolvedProfile {
                name: rule.name.clone(),
                profile: rule.profile.clone(),
            })
            .unwrap_or_else(|| self.default_resolved());

        debug!("Resolved deployment profile: {}", resolved.name);
        resolved
    }
}
