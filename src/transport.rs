//! Outbound HTTP primitive
//!
//! The proxy core never talks to the network directly; it goes through an
//! [`HttpTransport`] supplied by the host. [`ReqwestTransport`] is the
//! production implementation.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use http::{HeaderMap, Method, StatusCode};
use reqwest::Client;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

/// Boxed stream of body chunks
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A response body, either already buffered or still streaming
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    /// Buffer the whole body in memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// One outbound request
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>, headers: HeaderMap) -> Self {
        UpstreamRequest {
            method: Method::GET,
            url: url.into(),
            headers,
        }
    }
}

/// Status line, headers and body of an upstream reply
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl UpstreamResponse {
    /// Status in `[200, 400)`
    pub fn is_acceptable(&self) -> bool {
        let code = self.status.as_u16();
        (200..400).contains(&code)
    }
}

/// Fetch primitive injected into the proxy core.
///
/// Implementations must follow redirects. Timeouts are imposed by the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// [`HttpTransport`] backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let http_client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(ReqwestTransport { http_client })
    }

    pub fn with_client(http_client: Client) -> Self {
        ReqwestTransport { http_client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let response = self
            .http_client
            .request(request.method.clone(), &request.url)
            .headers(request.headers)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();

        let body = if request.method == Method::HEAD {
            ResponseBody::Empty
        } else {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| ProxyError::BodyError(e.to_string())));
            ResponseBody::Stream(Box::pin(stream))
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
