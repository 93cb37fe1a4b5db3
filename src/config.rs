//! Configuration management for the audio relay

use crate::cache::{CacheStore, FileCacheStore, MemoryCacheStore};
use crate::error::{ProxyError, Result};
use crate::identity::{default_raw_content_hosts, IdentitySpoofer};
use crate::profile::{
    builtin_rules, DeploymentProfile, ProfileResolver, ProfileRule, DEFAULT_PROFILE_NAME,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable holding the custom proxy URL
pub const ENV_CUSTOM_PROXY: &str = "GIT_URL";
/// Environment variable overriding the listen address
pub const ENV_LISTEN: &str = "AUDIO_RELAY_LISTEN";
/// Environment variable pinning the deployment profile
pub const ENV_DEPLOYMENT: &str = "AUDIO_RELAY_DEPLOYMENT";

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the HTTP server binds to (default: "0.0.0.0:8080")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Static deployment identity; names a profile rule that wins over
    /// request-based detection
    #[serde(default)]
    pub deployment: Option<String>,

    /// Profile used when no rule matches
    #[serde(default)]
    pub default_profile: DeploymentProfile,

    /// Ordered detection table; empty means the built-in table
    #[serde(default)]
    pub profiles: Vec<ProfileRule>,

    /// User-Agent table for identity spoofing; empty means the built-in table
    #[serde(default)]
    pub user_agents: Vec<String>,

    /// Hosts serving raw file content
    #[serde(default = "default_raw_content_hosts")]
    pub raw_content_hosts: Vec<String>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Whether `/metrics` is served (default: true)
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Cache backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether either tier is used at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// "memory" or "file" (default: "memory")
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Directory of the file backend
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Largest body captured into the full tier (default: 50MB)
    #[serde(default = "default_max_cacheable_bytes")]
    pub max_cacheable_bytes: usize,
}

/// Buffered fetch chain configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackConfig {
    /// Try the in-process streaming proxy first (default: true)
    #[serde(default = "default_true")]
    pub builtin_enabled: bool,

    /// User-configured proxy, called as `<url>?url=<target>`
    #[serde(default)]
    pub custom_proxy_url: Option<String>,

    /// Deadline for each custom/direct stage (default: 20000ms)
    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,

    /// Bodies larger than this are encoded in smaller chunks with periodic
    /// yields (default: 5MB)
    #[serde(default = "default_yield_threshold")]
    pub yield_threshold_bytes: usize,
}

impl FallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Configured custom proxy, ignoring blank values
    pub fn custom_proxy(&self) -> Option<&str> {
        self.custom_proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_cache_dir() -> String {
    "/var/cache/audio-relay".to_string()
}

fn default_max_cacheable_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_fallback_timeout_ms() -> u64 {
    20_000
}

fn default_yield_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: default_true(),
            backend: default_backend(),
            dir: default_cache_dir(),
            max_cacheable_bytes: default_max_cacheable_bytes(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            builtin_enabled: default_true(),
            custom_proxy_url: None,
            timeout_ms: default_fallback_timeout_ms(),
            yield_threshold_bytes: default_yield_threshold(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            deployment: None,
            default_profile: DeploymentProfile::default(),
            profiles: Vec::new(),
            user_agents: Vec::new(),
            raw_content_hosts: default_raw_content_hosts(),
            cache: CacheConfig::default(),
            fallback: FallbackConfig::default(),
            metrics_enabled: default_true(),
        }
    }
}

fn validate_profile(name: &str, profile: &DeploymentProfile) -> Result<()> {
    if profile.per_attempt_timeout_ms == 0 {
        return Err(ProxyError::ConfigError(format!(
            "profile '{}': per_attempt_timeout_ms must be greater than 0",
            name
        )));
    }
    if profile.cache_ttl_secs == 0 {
        return Err(ProxyError::ConfigError(format!(
            "profile '{}': cache_ttl_secs must be greater than 0",
            name
        )));
    }
    if profile.preload_size_bytes == 0 {
        return Err(ProxyError::ConfigError(format!(
            "profile '{}': preload_size_bytes must be greater than 0",
            name
        )));
    }
    Ok(())
}

impl ProxyConfig {
    /// Load configuration from a YAML file, then validate it
    ///
    /// Environment overrides are not applied here; call
    /// [`ProxyConfig::apply_env_overrides`] afterwards.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document is a valid all-defaults config
        let config: ProxyConfig = if content.trim().is_empty() {
            ProxyConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Apply `GIT_URL`, `AUDIO_RELAY_LISTEN` and `AUDIO_RELAY_DEPLOYMENT`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`ProxyConfig::apply_env_overrides`] with an injectable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get(ENV_CUSTOM_PROXY) {
            info!("Custom proxy configured from {}", ENV_CUSTOM_PROXY);
            self.fallback.custom_proxy_url = Some(url);
        }
        if let Some(listen) = get(ENV_LISTEN) {
            self.listen_address = listen;
        }
        if let Some(deployment) = get(ENV_DEPLOYMENT) {
            self.deployment = Some(deployment);
        }
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - every profile needs non-zero timeout, TTL and preload size
    /// - cache backend must be "memory" or "file"
    /// - the custom proxy URL must be http(s)
    /// - `deployment` must name a known rule
    pub fn validate(&self) -> Result<()> {
        validate_profile("default", &self.default_profile)?;
        for rule in &self.profiles {
            if rule.name.trim().is_empty() {
                return Err(ProxyError::ConfigError(
                    "profile rule name must not be empty".to_string(),
                ));
            }
            validate_profile(&rule.name, &rule.profile)?;
        }

        match self.cache.backend.as_str() {
            "memory" | "file" => {}
            other => {
                return Err(ProxyError::ConfigError(format!(
                    "cache backend must be 'memory' or 'file', got '{}'",
                    other
                )))
            }
        }
        if self.cache.backend == "file" && self.cache.dir.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "cache dir must not be empty for the file backend".to_string(),
            ));
        }

        if let Some(url) = self.fallback.custom_proxy() {
            let lower = url.to_ascii_lowercase();
            if !(lower.starts_with("http://") || lower.starts_with("https://")) {
                return Err(ProxyError::ConfigError(format!(
                    "custom_proxy_url must be an http(s) URL, got '{}'",
                    url
                )));
            }
        }
        if self.fallback.timeout_ms == 0 {
            return Err(ProxyError::ConfigError(
                "fallback timeout_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(deployment) = &self.deployment {
            let known = self.rules().iter().any(|rule| &rule.name == deployment)
                || deployment == DEFAULT_PROFILE_NAME;
            if !known {
                return Err(ProxyError::ConfigError(format!(
                    "deployment '{}' does not name a profile rule",
                    deployment
                )));
            }
        }

        Ok(())
    }

    /// Effective rule table
    pub fn rules(&self) -> Vec<ProfileRule> {
        if self.profiles.is_empty() {
            builtin_rules()
        } else {
            self.profiles.clone()
        }
    }

    pub fn build_resolver(&self) -> ProfileResolver {
        let resolver = ProfileResolver::new(self.rules(), self.default_profile.clone());
        match &self.deployment {
            Some(name) => resolver.with_deployment(name),
            None => resolver,
        }
    }

    pub fn build_spoofer(&self) -> IdentitySpoofer {
        IdentitySpoofer::new(self.user_agents.clone(), self.raw_content_hosts.clone())
    }

    /// Construct the configured cache store, `None` when caching is off
    pub async fn build_store(&self) -> Result<Option<Arc<dyn CacheStore>>> {
        if !self.cache.enabled {
            return Ok(None);
        }

        let store: Arc<dyn CacheStore> = match self.cache.backend.as_str() {
            "file" => Arc::new(FileCacheStore::new(&self.cache.dir).await?),
            _ => Arc::new(MemoryCacheStore::new()),
        };
        Ok(Some(store))
    }
}
