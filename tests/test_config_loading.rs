use audio_relay::profile::RequestMetadata;
use audio_relay::{ProxyConfig, Signal};
use http::HeaderMap;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_example_config() {
    let config = ProxyConfig::from_file("audio_relay.yaml");
    assert!(config.is_ok(), "Failed to load example config: {:?}", config.err());

    let config = config.unwrap();
    assert_eq!(config.listen_address, "0.0.0.0:8080");
    assert_eq!(config.deployment, None);
    assert_eq!(config.default_profile.cache_ttl_secs, 3600);
    assert_eq!(config.default_profile.preload_size_bytes, 1024 * 1024);
    assert_eq!(config.profiles.len(), 2);
    assert_eq!(config.profiles[0].name, "cloudflare");
    assert_eq!(
        config.profiles[0].when[0],
        Signal::Header {
            name: "cf-ray".to_string()
        }
    );
    assert_eq!(config.raw_content_hosts.len(), 3);
    assert!(config.cache.enabled);
    assert_eq!(config.cache.backend, "memory");
    assert_eq!(config.cache.max_cacheable_bytes, 50 * 1024 * 1024);
    assert_eq!(config.fallback.custom_proxy(), None);
    assert_eq!(config.fallback.timeout(), Duration::from_secs(20));
    assert!(config.metrics_enabled);
}

#[test]
fn test_load_minimal_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("minimal.yaml");
    std::fs::write(
        &path,
        r#"
default_profile:
  max_retries: 3
"#,
    )
    .unwrap();

    let config = ProxyConfig::from_file(&path).unwrap();
    assert_eq!(config.default_profile.max_retries, 3);
    // Check defaults are applied
    assert_eq!(config.default_profile.cache_ttl_secs, 3600);
    assert_eq!(config.default_profile.per_attempt_timeout_ms, 10_000);
    assert!(config.profiles.is_empty());
    assert!(!config.rules().is_empty(), "Built-in rules fill an empty table");
    assert!(config.fallback.builtin_enabled);
}

#[test]
fn test_load_invalid_config() {
    let dir = TempDir::new().unwrap();

    let zero_timeout = dir.path().join("zero_timeout.yaml");
    std::fs::write(
        &zero_timeout,
        r#"
default_profile:
  per_attempt_timeout_ms: 0
"#,
    )
    .unwrap();
    assert!(
        ProxyConfig::from_file(&zero_timeout).is_err(),
        "Should fail validation for a zero attempt timeout"
    );

    let bad_backend = dir.path().join("bad_backend.yaml");
    std::fs::write(&bad_backend, "cache:\n  backend: redis\n").unwrap();
    assert!(ProxyConfig::from_file(&bad_backend).is_err());

    let bad_proxy = dir.path().join("bad_proxy.yaml");
    std::fs::write(
        &bad_proxy,
        "fallback:\n  custom_proxy_url: ftp://proxy.example.com\n",
    )
    .unwrap();
    assert!(ProxyConfig::from_file(&bad_proxy).is_err());

    let unknown_deployment = dir.path().join("unknown_deployment.yaml");
    std::fs::write(&unknown_deployment, "deployment: mainframe\n").unwrap();
    assert!(ProxyConfig::from_file(&unknown_deployment).is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = ProxyConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}

#[test]
fn test_overrides_then_pinned_deployment() {
    let mut config = ProxyConfig::from_file("audio_relay.yaml").unwrap();
    let env: HashMap<&str, &str> = [
        ("GIT_URL", "https://proxy.example.com/fetch"),
        ("AUDIO_RELAY_DEPLOYMENT", "mobile-chrome"),
        ("AUDIO_RELAY_LISTEN", "   "),
    ]
    .into_iter()
    .collect();
    config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));
    config.validate().unwrap();

    assert_eq!(
        config.fallback.custom_proxy(),
        Some("https://proxy.example.com/fetch")
    );
    // Blank values are ignored
    assert_eq!(config.listen_address, "0.0.0.0:8080");

    // A pinned deployment wins over request signals
    let resolver = config.build_resolver();
    let mut headers = HeaderMap::new();
    headers.insert("cf-ray", "abc".parse().unwrap());
    let resolved = resolver.resolve(&RequestMetadata {
        headers: &headers,
        user_agent: None,
        host: None,
    });
    assert_eq!(resolved.name, "mobile-chrome");
    assert_eq!(resolved.profile.max_retries, 2);
}

#[tokio::test]
async fn test_build_file_store() {
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("audio-cache");
    let yaml = format!(
        "cache:\n  backend: file\n  dir: {}\n",
        cache_dir.display()
    );

    let config = ProxyConfig::from_yaml(&yaml).unwrap();
    let store = config.build_store().await.unwrap();
    assert!(store.is_some());
    assert!(cache_dir.is_dir(), "File backend creates its directory");

    let disabled = ProxyConfig::from_yaml("cache:\n  enabled: false\n").unwrap();
    assert!(disabled.build_store().await.unwrap().is_none());
}

#[test]
fn test_pinned_standard_deployment_uses_default_profile() {
    let config = ProxyConfig::from_yaml(
        r#"
deployment: standard
default_profile:
  max_retries: 4
"#,
    )
    .unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("cf-ray", "abc".parse().unwrap());
    let resolved = config.build_resolver().resolve(&RequestMetadata {
        headers: &headers,
        user_agent: Some("Mozilla/5.0 (Linux; Android 14) Chrome/120.0 Mobile"),
        host: Some("relay.pages.dev"),
    });
    assert_eq!(resolved.name, "standard");
    assert_eq!(resolved.profile.max_retries, 4);
}
