//! HTTP/1 front end
//!
//! A thin adapter between hyper and the core contract: it translates the
//! inbound request to the handler's inputs and the [`ResponseEnvelope`] back
//! to a hyper response.

use crate::background::TaskScheduler;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::fallback::ProxyChain;
use crate::handler::{self, ProxyDeps};
use crate::metrics::ProxyMetrics;
use crate::normalizer::{self, ResponseEnvelope};
use crate::transport::{HttpTransport, ResponseBody};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Largest JSON command accepted by the buffered fetch endpoint
const MAX_COMMAND_BYTES: usize = 64 * 1024;

pub type RelayBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Shared state behind every connection
pub struct AppState {
    pub deps: ProxyDeps,
    pub chain: ProxyChain,
    pub metrics: Option<ProxyMetrics>,
}

impl AppState {
    pub fn new(deps: ProxyDeps, chain: ProxyChain) -> Self {
        let metrics = deps.metrics.clone();
        AppState {
            deps,
            chain,
            metrics,
        }
    }

    /// Wire up handler dependencies from configuration
    pub async fn from_config(
        config: &ProxyConfig,
        transport: Arc<dyn HttpTransport>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<Self> {
        let mut deps = ProxyDeps::new(transport, scheduler)
            .with_spoofer(config.build_spoofer())
            .with_resolver(config.build_resolver())
            .with_max_cacheable_bytes(config.cache.max_cacheable_bytes);

        if let Some(store) = config.build_store().await? {
            deps = deps.with_cache(store);
        }

        if config.metrics_enabled {
            let metrics = ProxyMetrics::new().map_err(|e| {
                ProxyError::Internal(format!("Failed to register metrics: {}", e))
            })?;
            deps = deps.with_metrics(metrics);
        }

        let chain = ProxyChain::new(deps.clone(), config.fallback.clone());
        Ok(Self::new(deps, chain))
    }
}

/// Convert an envelope into a hyper response
pub fn into_response(envelope: ResponseEnvelope) -> Response<RelayBody> {
    let body = match envelope.body {
        ResponseBody::Empty => Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync(),
        ResponseBody::Full(bytes) => Full::new(bytes)
            .map_err(|never| match never {})
            .boxed_unsync(),
        ResponseBody::Stream(stream) => {
            StreamBody::new(stream.map(|chunk| chunk.map(Frame::data))).boxed_unsync()
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = envelope.status;
    *response.headers_mut() = envelope.headers;
    response
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> ResponseEnvelope {
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static(content_type),
    );
    normalizer::apply_cors(&mut headers);
    ResponseEnvelope {
        status,
        headers,
        body: ResponseBody::Full(Bytes::from(body)),
    }
}

/// Route one request
pub async fn dispatch(req: Request<Incoming>, state: Arc<AppState>) -> Response<RelayBody> {
    let path = req.uri().path().to_string();
    let envelope = match path.as_str() {
        "/api/audio" | "/proxy" => {
            let (parts, _) = req.into_parts();
            handler::route(&parts.method, &parts.uri, &parts.headers, &state.deps).await
        }
        "/api/fetch" => {
            let method = req.method().clone();
            let body = if method == Method::POST {
                match Limited::new(req.into_body(), MAX_COMMAND_BYTES).collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        debug!("Rejected fetch command body: {}", e);
                        let err = ProxyError::ParseError("Request body too large".to_string());
                        return into_response(normalizer::error_envelope(&err, None));
                    }
                }
            } else {
                Bytes::new()
            };
            state.chain.handle(&method, &body).await
        }
        "/health" => normalizer::json_envelope(
            StatusCode::OK,
            &serde_json::json!({ "status": "healthy" }),
        ),
        "/metrics" => match &state.metrics {
            Some(metrics) => match metrics.gather_text() {
                Ok(text) => text_response(
                    StatusCode::OK,
                    "text/plain; version=0.0.4; charset=utf-8",
                    text,
                ),
                Err(e) => {
                    let err = ProxyError::Internal(format!("Failed to encode metrics: {}", e));
                    normalizer::error_envelope(&err, None)
                }
            },
            None => not_found(),
        },
        _ => not_found(),
    };

    into_response(envelope)
}

fn not_found() -> ResponseEnvelope {
    normalizer::json_envelope(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": "Not found" }),
    )
}

/// Accept connections until `shutdown` resolves
///
/// Connections already accepted keep running on their own tasks.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    info!("Audio relay listening on http://{}", addr);
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }
        };

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(dispatch(req, state).await) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection from {}: {:?}", peer, err);
            }
        });
    }
}

/// Bind `addr` and serve until `shutdown` resolves
pub async fn bind_and_serve<F>(addr: SocketAddr, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}
