//! Buffered fetch chain for clients that cannot take a binary stream
//!
//! Stages run in order: the in-process streaming proxy, the user-configured
//! proxy, then a direct fetch. The first stage that yields a 2xx body wins;
//! the body is buffered, base64-encoded in chunks and returned as
//! `{ "base64", "contentType" }`. Only when every stage fails is an error
//! reported, carrying the most recent stage's message.

use crate::config::FallbackConfig;
use crate::error::{ProxyError, Result};
use crate::handler::{handle_proxy_request, ProxyDeps};
use crate::models::{validate_target, ProxyRequest};
use crate::normalizer::{self, ResponseEnvelope};
use crate::transport::UpstreamRequest;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Chunk size for ordinary bodies (a multiple of 3 so chunk encodings concatenate)
const CHUNK_BYTES: usize = 3 * 10_922;
/// Chunk size once the body crosses the yield threshold
const LARGE_CHUNK_BYTES: usize = 3 * 5_461;
/// Chunks encoded between yields for large bodies
const CHUNKS_PER_YIELD: usize = 10;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
const PROXY_TYPE: &str = "audio-fetch";

/// One stage of the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStage {
    Builtin,
    Custom(String),
    Direct,
}

impl FetchStage {
    pub fn name(&self) -> &'static str {
        match self {
            FetchStage::Builtin => "builtin",
            FetchStage::Custom(_) => "custom",
            FetchStage::Direct => "direct",
        }
    }
}

impl fmt::Display for FetchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Buffered transfer result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedPayload {
    pub base64: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

/// JSON body accepted by the buffered fetch endpoint
#[derive(Debug, Default, Deserialize)]
struct FetchCommand {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    url: Option<serde_json::Value>,
}

/// Base64-encode `body` in chunks, yielding to the runtime periodically when
/// the body is larger than `yield_threshold` bytes.
pub async fn encode_base64_chunked(body: &[u8], yield_threshold: usize) -> String {
    let large = body.len() > yield_threshold;
    let chunk_size = if large { LARGE_CHUNK_BYTES } else { CHUNK_BYTES };

    let mut encoded = String::with_capacity(body.len().div_ceil(3) * 4);
    for (index, chunk) in body.chunks(chunk_size).enumerate() {
        STANDARD.encode_string(chunk, &mut encoded);
        if large && (index + 1) % CHUNKS_PER_YIELD == 0 {
            tokio::task::yield_now().await;
        }
    }
    encoded
}

fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

/// Proxy chain over the same dependencies as the streaming path
#[derive(Clone)]
pub struct ProxyChain {
    deps: ProxyDeps,
    config: FallbackConfig,
}

impl ProxyChain {
    pub fn new(deps: ProxyDeps, config: FallbackConfig) -> Self {
        ProxyChain { deps, config }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Stages in the order they are tried
    pub fn stages(&self) -> Vec<FetchStage> {
        let mut stages = Vec::with_capacity(3);
        if self.config.builtin_enabled {
            stages.push(FetchStage::Builtin);
        }
        if let Some(url) = self.config.custom_proxy() {
            stages.push(FetchStage::Custom(url.to_string()));
        }
        stages.push(FetchStage::Direct);
        stages
    }

    /// Run the full chain for `target`
    pub async fn fetch_buffered(&self, target: &str) -> Result<BufferedPayload> {
        validate_target(target)?;

        let mut failures = Vec::new();
        let mut last_message = String::new();

        for stage in self.stages() {
            match self.run_stage(&stage, target).await {
                Ok((body, content_type)) => {
                    self.record_stage(&stage, true);
                    info!(
                        "Buffered fetch of {} via {} stage: {} bytes",
                        target,
                        stage,
                        body.len()
                    );
                    return Ok(self.encode(body, content_type).await);
                }
                Err(e) => {
                    self.record_stage(&stage, false);
                    warn!("Fetch stage {} failed for {}: {}", stage, target, e);
                    last_message = e.client_message();
                    failures.push(format!("{}: {}", stage, e));
                }
            }
        }

        Err(ProxyError::FallbackExhausted {
            message: last_message,
            stages: failures,
        })
    }

    /// Run only the custom proxy stage
    pub async fn fetch_via_custom(&self, target: &str) -> Result<BufferedPayload> {
        let proxy = self
            .config
            .custom_proxy()
            .ok_or_else(|| ProxyError::ConfigError("Custom proxy not configured".to_string()))?
            .to_string();
        validate_target(target)?;

        let stage = FetchStage::Custom(proxy);
        let result = self.run_stage(&stage, target).await;
        self.record_stage(&stage, result.is_ok());
        let (body, content_type) = result?;
        Ok(self.encode(body, content_type).await)
    }

    async fn encode(&self, body: Bytes, content_type: String) -> BufferedPayload {
        let base64 = encode_base64_chunked(&body, self.config.yield_threshold_bytes).await;
        BufferedPayload {
            base64,
            content_type,
        }
    }

    fn record_stage(&self, stage: &FetchStage, success: bool) {
        if let Some(metrics) = &self.deps.metrics {
            metrics.record_fallback_stage(stage.name(), success);
        }
    }

    async fn run_stage(&self, stage: &FetchStage, target: &str) -> Result<(Bytes, String)> {
        match stage {
            FetchStage::Builtin => self.via_builtin(target).await,
            FetchStage::Custom(proxy) => self.via_custom(proxy, target).await,
            FetchStage::Direct => self.via_direct(target).await,
        }
    }

    /// In-process streaming proxy, cache included
    async fn via_builtin(&self, target: &str) -> Result<(Bytes, String)> {
        let request = ProxyRequest {
            method: Method::GET,
            target: target.to_string(),
            range: None,
            user_agent: None,
            host: None,
            headers: HeaderMap::new(),
        };

        let envelope = handle_proxy_request(request, &self.deps).await;
        if !envelope.status.is_success() {
            let body = envelope.body.into_bytes().await.unwrap_or_default();
            let message = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string));
            let status = envelope.status.as_u16();
            debug!("Builtin stage answered {}: {:?}", status, message);
            return Err(ProxyError::StageFailed {
                status,
                message: message.unwrap_or_else(|| format!("Upstream {}", status)),
            });
        }

        let content_type = content_type_of(&envelope.headers);
        let body = envelope.body.into_bytes().await?;
        Ok((body, content_type))
    }

    /// `<proxy>?url=<target>` with the target also named in headers
    async fn via_custom(&self, proxy: &str, target: &str) -> Result<(Bytes, String)> {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        let separator = if proxy.contains('?') { '&' } else { '?' };
        let proxied = format!("{}{}url={}", proxy, separator, encoded);

        let mut headers = self.deps.spoofer.identity_for(target, None).headers;
        // Referer/Origin describe the target, not the proxy
        headers.remove(http::header::REFERER);
        headers.remove(http::header::ORIGIN);
        if let Ok(value) = HeaderValue::from_str(target) {
            headers.insert(HeaderName::from_static("x-target-url"), value);
        }
        headers.insert(
            HeaderName::from_static("x-proxy-type"),
            HeaderValue::from_static(PROXY_TYPE),
        );

        debug!("Custom proxy request: {}", proxied);
        self.send_buffered(UpstreamRequest::get(proxied, headers)).await
    }

    /// Plain fetch of the target with a spoofed identity
    async fn via_direct(&self, target: &str) -> Result<(Bytes, String)> {
        let headers = self.deps.spoofer.identity_for(target, None).headers;
        self.send_buffered(UpstreamRequest::get(target, headers)).await
    }

    async fn send_buffered(&self, request: UpstreamRequest) -> Result<(Bytes, String)> {
        let limit = self.config.timeout();
        let transport = self.deps.fetcher.transport().clone();

        let fetch = async move {
            let response = transport.send(request).await?;
            if !response.status.is_success() {
                return Err(ProxyError::UpstreamStatus {
                    status: response.status.as_u16(),
                });
            }
            let content_type = content_type_of(&response.headers);
            let body = response.body.into_bytes().await?;
            Ok((body, content_type))
        };

        match timeout(limit, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout(format!(
                "no response within {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// Serve one request on the buffered fetch endpoint
    pub async fn handle(&self, method: &Method, body: &[u8]) -> ResponseEnvelope {
        if method == Method::OPTIONS {
            return endpoint_headers(ResponseEnvelope {
                status: StatusCode::NO_CONTENT,
                headers: HeaderMap::new(),
                body: crate::transport::ResponseBody::Empty,
            });
        }
        if method != Method::POST {
            return endpoint_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        let command: FetchCommand = if body.iter().all(u8::is_ascii_whitespace) {
            FetchCommand::default()
        } else {
            match serde_json::from_slice(body) {
                Ok(command) => command,
                Err(e) => {
                    debug!("Unparseable fetch command: {}", e);
                    return endpoint_error(StatusCode::BAD_REQUEST, "Invalid JSON body");
                }
            }
        };

        match command.action.as_deref() {
            Some("getConfig") => {
                let custom = self.config.custom_proxy().unwrap_or_default();
                return endpoint_headers(normalizer::json_envelope(
                    StatusCode::OK,
                    &serde_json::json!({
                        "customProxyUrl": custom,
                        "hasCustomProxy": !custom.is_empty(),
                    }),
                ));
            }
            Some("customProxy") if self.config.custom_proxy().is_none() => {
                return endpoint_error(StatusCode::BAD_REQUEST, "Custom proxy not configured");
            }
            _ => {}
        }

        let target = match command.url.as_ref().and_then(|v| v.as_str()) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return endpoint_error(StatusCode::BAD_REQUEST, "Missing url"),
        };
        if validate_target(&target).is_err() {
            return endpoint_error(StatusCode::BAD_REQUEST, "Only http/https allowed");
        }

        let result = match command.action.as_deref() {
            Some("customProxy") => self.fetch_via_custom(&target).await,
            _ => self.fetch_buffered(&target).await,
        };

        match result {
            Ok(payload) => match serde_json::to_value(&payload) {
                Ok(json) => endpoint_headers(normalizer::json_envelope(StatusCode::OK, &json)),
                Err(e) => endpoint_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            Err(ProxyError::UpstreamStatus { status }) => endpoint_error(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                &format!("Custom proxy upstream {}", status),
            ),
            Err(e) => {
                let status = StatusCode::from_u16(e.to_http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                endpoint_error(status, &e.client_message())
            }
        }
    }
}

fn endpoint_headers(mut envelope: ResponseEnvelope) -> ResponseEnvelope {
    normalizer::apply_cors(&mut envelope.headers);
    envelope.headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    envelope.headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    envelope.headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    envelope
}

fn endpoint_error(status: StatusCode, message: &str) -> ResponseEnvelope {
    endpoint_headers(normalizer::json_envelope(
        status,
        &serde_json::json!({ "error": message }),
    ))
}
