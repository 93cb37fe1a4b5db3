//! HTTP front end over a real socket

use audio_relay::server::{serve, AppState};
use audio_relay::{BackgroundTasks, ProxyConfig, ReqwestTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Running {
    addr: SocketAddr,
    tasks: Arc<BackgroundTasks>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<audio_relay::Result<()>>,
}

async fn start(config: ProxyConfig) -> Running {
    let tasks = Arc::new(BackgroundTasks::new());
    let transport = Arc::new(ReqwestTransport::new().unwrap());
    let state = Arc::new(
        AppState::from_config(&config, transport, tasks.clone())
            .await
            .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(serve(listener, state, async {
        let _ = stopped.await;
    }));

    Running {
        addr,
        tasks,
        stop,
        handle,
    }
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
        self.tasks.drain().await;
    }
}

#[tokio::test]
async fn test_health_and_not_found() {
    let relay = start(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let health = client.get(relay.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let json: serde_json::Value = health.json().await.unwrap();
    assert_eq!(json["status"], "healthy");

    let missing = client.get(relay.url("/nope")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_streams_audio_and_exposes_metrics() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tune.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(vec![7u8; 20_000]),
        )
        .mount(&upstream)
        .await;

    let relay = start(ProxyConfig::default()).await;
    let client = reqwest::Client::new();
    let target = format!("{}/tune.mp3", upstream.uri());

    let response = client
        .get(relay.url("/api/audio"))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "audio/mpeg");
    assert_eq!(response.headers()["x-cache-status"], "MISS");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.bytes().await.unwrap().len(), 20_000);

    relay.tasks.drain().await;

    let again = client
        .get(relay.url("/proxy"))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(again.headers()["x-cache-status"], "HIT");
    assert_eq!(again.bytes().await.unwrap().len(), 20_000);

    let metrics = client
        .get(relay.url("/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("audio_relay_requests_total{kind=\"full\"} 2"));
    assert!(metrics.contains("audio_relay_cache_lookups_total{result=\"hit\",tier=\"full\"} 1"));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_preflight_and_method_checks() {
    let relay = start(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let preflight = client
        .request(reqwest::Method::OPTIONS, relay.url("/api/audio"))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 204);
    assert_eq!(
        preflight.headers()["access-control-allow-methods"],
        "GET, HEAD, OPTIONS"
    );

    let post = client
        .post(relay.url("/api/audio?url=https://example.com/a.mp3"))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 405);
    assert_eq!(post.headers()["access-control-allow-origin"], "*");

    let missing = client.get(relay.url("/api/audio")).send().await.unwrap();
    assert_eq!(missing.status(), 400);
    let json: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(json["error"], "Missing url parameter");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_fetch_endpoint_over_http() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip.ogg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/ogg")
                .set_body_bytes(b"abc".to_vec()),
        )
        .mount(&upstream)
        .await;

    let relay = start(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(relay.url("/api/fetch"))
        .json(&serde_json::json!({ "url": format!("{}/clip.ogg", upstream.uri()) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["base64"], "YWJj");
    assert_eq!(json["contentType"], "audio/ogg");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_metrics_can_be_disabled() {
    let config = ProxyConfig {
        metrics_enabled: false,
        ..Default::default()
    };
    let relay = start(config).await;

    let response = reqwest::get(relay.url("/metrics")).await.unwrap();
    assert_eq!(response.status(), 404);

    relay.shutdown().await;
}
