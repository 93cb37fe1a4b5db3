//! Response normalization
//!
//! Turns an upstream reply (or a cache hit, or an error) into the envelope
//! handed to the client. Only an explicit allow-list of upstream headers is
//! copied; CORS, cache-control and diagnostic headers are always generated
//! here so conflicting upstream directives never leak through.

use crate::cache::CacheEntry;
use crate::error::ProxyError;
use crate::models::{CacheSource, CacheStatus, RequestKind};
use crate::profile::DeploymentProfile;
use crate::tiered_cache::PreloadHit;
use crate::transport::{ResponseBody, UpstreamResponse};
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::time::Instant;

/// Upstream headers allowed onto the client response
pub const FORWARDED_HEADERS: [&str; 5] = [
    "content-length",
    "content-range",
    "accept-ranges",
    "etag",
    "last-modified",
];

/// Fallback when neither upstream nor extension says what the audio is
pub const DEFAULT_AUDIO_TYPE: &str = "audio/mpeg";

const EXPOSED_HEADERS: &str = "Content-Length, Content-Range, Accept-Ranges, X-Cache-Status, \
     X-Cache-Source, X-Processing-Time, X-Request-Type, X-Retries";

const EXTENSION_TYPES: [(&str, &str); 11] = [
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("opus", "audio/opus"),
    ("m4a", "audio/mp4"),
    ("mp4", "audio/mp4"),
    ("aac", "audio/aac"),
    ("flac", "audio/flac"),
    ("webm", "audio/webm"),
    ("weba", "audio/webm"),
];

/// What the client gets back
#[derive(Debug)]
pub struct ResponseEnvelope {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Diagnostic facts attached to every proxy response
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    pub started: Instant,
    pub kind: RequestKind,
    pub retries: usize,
    pub cache_status: CacheStatus,
    pub cache_source: CacheSource,
}

impl Diagnostics {
    pub fn origin(started: Instant, kind: RequestKind, retries: usize) -> Self {
        Diagnostics {
            started,
            kind,
            retries,
            cache_status: CacheStatus::Miss,
            cache_source: CacheSource::Origin,
        }
    }

    pub fn hit(started: Instant, kind: RequestKind, source: CacheSource) -> Self {
        Diagnostics {
            started,
            kind,
            retries: 0,
            cache_status: CacheStatus::Hit,
            cache_source: source,
        }
    }
}

/// File extension of the target's path, lowercased
fn extension_of(target: &str) -> Option<String> {
    let path = match url::Url::parse(target) {
        Ok(url) => url.path().to_string(),
        Err(_) => target
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Resolve the Content-Type: upstream's if it is audio, else the extension
/// table, else the generic audio default.
pub fn resolve_content_type(upstream: Option<&str>, target: &str) -> String {
    if let Some(ct) = upstream {
        if ct.trim().to_ascii_lowercase().starts_with("audio/") {
            return ct.trim().to_string();
        }
    }

    extension_of(target)
        .and_then(|ext| {
            EXTENSION_TYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, mime)| mime.to_string())
        })
        .unwrap_or_else(|| DEFAULT_AUDIO_TYPE.to_string())
}

/// 206 iff a Range was requested and the upstream either said 206 or sent a
/// Content-Range; otherwise the upstream status unchanged.
pub fn decide_status(
    range_requested: bool,
    upstream_status: StatusCode,
    upstream_headers: &HeaderMap,
) -> StatusCode {
    let partial = upstream_status == StatusCode::PARTIAL_CONTENT
        || upstream_headers.contains_key(header::CONTENT_RANGE);
    if range_requested && partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        upstream_status
    }
}

/// Copy the allow-listed headers from an upstream reply
pub fn project_upstream_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut projected = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = upstream.get(name) {
            projected.insert(HeaderName::from_static(name), value.clone());
        }
    }
    projected
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// CORS headers present on every response, errors included
pub fn apply_cors(headers: &mut HeaderMap) {
    set(headers, "access-control-allow-origin", "*");
    set(headers, "access-control-expose-headers", EXPOSED_HEADERS);
}

fn apply_diagnostics(headers: &mut HeaderMap, diag: &Diagnostics) {
    let elapsed = diag.started.elapsed().as_millis();
    set(headers, "x-processing-time", &format!("{}ms", elapsed));
    set(headers, "x-request-type", diag.kind.as_str());
    set(headers, "x-retries", &diag.retries.to_string());
    set(headers, "x-cache-status", diag.cache_status.as_str());
    set(headers, "x-cache-source", diag.cache_source.as_str());
}

fn apply_media_headers(headers: &mut HeaderMap, content_type: &str, profile: &DeploymentProfile) {
    set(headers, "content-type", content_type);
    if !headers.contains_key(header::ACCEPT_RANGES) {
        set(headers, "accept-ranges", "bytes");
    }
    set(
        headers,
        "cache-control",
        &format!("public, max-age={}, must-revalidate", profile.cache_ttl_secs),
    );
    set(headers, "x-content-type-options", "nosniff");
    apply_cors(headers);
}

/// Headers worth keeping when a response is stored in the full tier
pub fn cacheable_headers(envelope_headers: &HeaderMap) -> HeaderMap {
    let mut headers = project_upstream_headers(envelope_headers);
    if let Some(ct) = envelope_headers.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, ct.clone());
    }
    headers
}

/// Normalize an upstream reply
pub fn normalize(
    upstream: UpstreamResponse,
    target: &str,
    range_requested: bool,
    profile: &DeploymentProfile,
    diag: &Diagnostics,
) -> ResponseEnvelope {
    let status = decide_status(range_requested, upstream.status, &upstream.headers);
    let content_type = resolve_content_type(
        upstream
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        target,
    );

    let mut headers = project_upstream_headers(&upstream.headers);
    apply_media_headers(&mut headers, &content_type, profile);
    apply_diagnostics(&mut headers, diag);

    ResponseEnvelope {
        status,
        headers,
        body: upstream.body,
    }
}

/// Rebuild a response from a full-tier entry
pub fn from_full_hit(
    entry: CacheEntry,
    target: &str,
    profile: &DeploymentProfile,
    diag: &Diagnostics,
) -> ResponseEnvelope {
    let content_type = resolve_content_type(
        entry
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        target,
    );

    let mut headers = project_upstream_headers(&entry.headers);
    set(&mut headers, "content-length", &entry.body.len().to_string());
    apply_media_headers(&mut headers, &content_type, profile);
    apply_diagnostics(&mut headers, diag);

    ResponseEnvelope {
        status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
        headers,
        body: ResponseBody::Full(entry.body),
    }
}

/// Serve a slice of the preload window
pub fn from_preload_hit(
    hit: PreloadHit,
    target: &str,
    profile: &DeploymentProfile,
    diag: &Diagnostics,
) -> ResponseEnvelope {
    let content_type = resolve_content_type(
        hit.entry
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        target,
    );

    let mut headers = project_upstream_headers(&hit.entry.headers);
    set(&mut headers, "content-range", &hit.content_range());
    set(&mut headers, "content-length", &hit.body.len().to_string());
    apply_media_headers(&mut headers, &content_type, profile);
    apply_diagnostics(&mut headers, diag);

    ResponseEnvelope {
        status: StatusCode::PARTIAL_CONTENT,
        headers,
        body: ResponseBody::Full(hit.body),
    }
}

/// JSON document with CORS and `no-store`
pub fn json_envelope(status: StatusCode, body: &serde_json::Value) -> ResponseEnvelope {
    let mut headers = HeaderMap::new();
    set(&mut headers, "content-type", "application/json");
    set(&mut headers, "cache-control", "no-store");
    apply_cors(&mut headers);

    ResponseEnvelope {
        status,
        headers,
        body: ResponseBody::Full(Bytes::from(body.to_string())),
    }
}

/// Uniform JSON error envelope
pub fn error_envelope(error: &ProxyError, diag: Option<&Diagnostics>) -> ResponseEnvelope {
    let status =
        StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut envelope = json_envelope(
        status,
        &serde_json::json!({ "error": error.client_message() }),
    );
    if let Some(diag) = diag {
        apply_diagnostics(&mut envelope.headers, diag);
    }
    envelope
}

/// 204 reply to a CORS preflight
pub fn preflight() -> ResponseEnvelope {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    set(&mut headers, "access-control-allow-methods", "GET, HEAD, OPTIONS");
    set(
        &mut headers,
        "access-control-allow-headers",
        "Range, Content-Range, If-Range, If-Modified-Since, Content-Type",
    );
    set(&mut headers, "access-control-max-age", "86400");
    set(&mut headers, "cache-control", "public, max-age=86400");

    ResponseEnvelope {
        status: StatusCode::NO_CONTENT,
        headers,
        body: ResponseBody::Empty,
    }
}
