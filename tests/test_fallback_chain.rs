//! Buffered fetch chain: stage ordering, base64 transport and the JSON endpoint

use audio_relay::error::ProxyError;
use audio_relay::{
    BackgroundTasks, DeploymentProfile, FallbackConfig, FetchStage, MemoryCacheStore,
    ProfileResolver, ProxyChain, ProxyDeps, ReqwestTransport,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn deps(tasks: Arc<BackgroundTasks>) -> ProxyDeps {
    let profile = DeploymentProfile {
        max_retries: 0,
        retry_delay_ms: 0,
        per_attempt_timeout_ms: 2000,
        preload_size_bytes: 16,
        ..Default::default()
    };
    ProxyDeps::new(Arc::new(ReqwestTransport::new().unwrap()), tasks)
        .with_cache(Arc::new(MemoryCacheStore::new()))
        .with_resolver(ProfileResolver::new(Vec::new(), profile))
        .with_preload_settle(Duration::ZERO)
}

fn chain(tasks: Arc<BackgroundTasks>, custom: Option<String>, builtin: bool) -> ProxyChain {
    ProxyChain::new(
        deps(tasks),
        FallbackConfig {
            builtin_enabled: builtin,
            custom_proxy_url: custom,
            timeout_ms: 2000,
            yield_threshold_bytes: 1024,
        },
    )
}

async fn json_of(envelope: audio_relay::ResponseEnvelope) -> serde_json::Value {
    let body = envelope.body.into_bytes().await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[test]
fn test_stage_order() {
    let tasks = Arc::new(BackgroundTasks::new());
    let full = chain(tasks.clone(), Some("https://proxy.example/fetch".into()), true);
    assert_eq!(
        full.stages(),
        vec![
            FetchStage::Builtin,
            FetchStage::Custom("https://proxy.example/fetch".into()),
            FetchStage::Direct,
        ]
    );

    let direct_only = chain(tasks, Some("   ".into()), false);
    assert_eq!(direct_only.stages(), vec![FetchStage::Direct]);
}

#[tokio::test]
async fn test_builtin_stage_serves_base64() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/song.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;

    let tasks = Arc::new(BackgroundTasks::new());
    let chain = chain(tasks.clone(), None, true);
    let payload = chain
        .fetch_buffered(&format!("{}/song.mp3", server.uri()))
        .await
        .unwrap();

    assert_eq!(payload.content_type, "audio/mpeg");
    assert_eq!(STANDARD.decode(&payload.base64).unwrap(), body);
    tasks.drain().await;
}

#[tokio::test]
async fn test_custom_stage_used_after_builtin_fails() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blocked.mp3"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&origin)
        .await;

    let target = format!("{}/blocked.mp3", origin.uri());

    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/relay"))
        .and(query_param("url", target.as_str()))
        .and(header("x-target-url", target.as_str()))
        .and(header("x-proxy-type", "audio-fetch"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/ogg")
                .set_body_bytes(b"proxied".to_vec()),
        )
        .expect(1)
        .mount(&proxy)
        .await;

    let tasks = Arc::new(BackgroundTasks::new());
    let chain = chain(tasks.clone(), Some(format!("{}/relay", proxy.uri())), true);
    let payload = chain.fetch_buffered(&target).await.unwrap();

    assert_eq!(payload.content_type, "audio/ogg");
    assert_eq!(payload.base64, STANDARD.encode(b"proxied"));
    tasks.drain().await;
}

#[tokio::test]
async fn test_all_stages_failing_reports_last_message() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.mp3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;

    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/relay"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&proxy)
        .await;

    let tasks = Arc::new(BackgroundTasks::new());
    let chain = chain(tasks.clone(), Some(format!("{}/relay", proxy.uri())), true);
    let err = chain
        .fetch_buffered(&format!("{}/gone.mp3", origin.uri()))
        .await
        .unwrap_err();

    match err {
        ProxyError::FallbackExhausted { message, stages } => {
            assert_eq!(stages.len(), 3);
            // The in-process proxy's own error message is kept
            assert_eq!(stages[0], "builtin: Stage answered 404: Upstream 404");
            assert!(stages[1].starts_with("custom"));
            assert!(stages[2].starts_with("direct"));
            // Direct fetch ran last
            assert_eq!(message, "Upstream 404");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    tasks.drain().await;
}

#[tokio::test]
async fn test_endpoint_validation_messages() {
    let tasks = Arc::new(BackgroundTasks::new());
    let chain = chain(tasks, None, true);

    let missing = chain.handle(&Method::POST, br#"{}"#).await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(json_of(missing).await["error"], "Missing url");

    let not_string = chain.handle(&Method::POST, br#"{"url": 42}"#).await;
    assert_eq!(json_of(not_string).await["error"], "Missing url");

    let ftp = chain
        .handle(&Method::POST, br#"{"url": "ftp://example.com/a.mp3"}"#)
        .await;
    assert_eq!(ftp.status, StatusCode::BAD_REQUEST);
    assert_eq!(json_of(ftp).await["error"], "Only http/https allowed");

    let custom = chain
        .handle(
            &Method::POST,
            br#"{"action": "customProxy", "url": "https://example.com/a.mp3"}"#,
        )
        .await;
    assert_eq!(custom.status, StatusCode::BAD_REQUEST);
    assert_eq!(json_of(custom).await["error"], "Custom proxy not configured");

    let get = chain.handle(&Method::GET, b"").await;
    assert_eq!(get.status, StatusCode::METHOD_NOT_ALLOWED);

    let options = chain.handle(&Method::OPTIONS, b"").await;
    assert_eq!(options.status, StatusCode::NO_CONTENT);
    assert_eq!(
        options.header_str("access-control-allow-methods"),
        Some("POST, OPTIONS")
    );
}

#[tokio::test]
async fn test_get_config_action() {
    let tasks = Arc::new(BackgroundTasks::new());

    let configured = chain(tasks.clone(), Some("https://proxy.example/fetch".into()), true);
    let json = json_of(
        configured
            .handle(&Method::POST, br#"{"action": "getConfig"}"#)
            .await,
    )
    .await;
    assert_eq!(json["customProxyUrl"], "https://proxy.example/fetch");
    assert_eq!(json["hasCustomProxy"], true);

    let bare = chain(tasks, None, true);
    let json = json_of(bare.handle(&Method::POST, br#"{"action": "getConfig"}"#).await).await;
    assert_eq!(json["customProxyUrl"], "");
    assert_eq!(json["hasCustomProxy"], false);
}

#[tokio::test]
async fn test_custom_proxy_action_surfaces_upstream_status() {
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/relay"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&proxy)
        .await;

    let tasks = Arc::new(BackgroundTasks::new());
    let chain = chain(tasks, Some(format!("{}/relay", proxy.uri())), true);
    let response = chain
        .handle(
            &Method::POST,
            br#"{"action": "customProxy", "url": "https://example.com/a.mp3"}"#,
        )
        .await;

    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_of(response).await["error"], "Custom proxy upstream 429");
}
