//! Core data models for the audio relay

use crate::error::{ProxyError, Result};
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inbound proxy request after validation
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// GET or HEAD
    pub method: Method,
    /// Absolute http(s) target URL taken from the `url` query parameter
    pub target: String,
    /// Raw inbound `Range` header value, passed upstream verbatim
    pub range: Option<String>,
    /// Caller `User-Agent`, only used for profile resolution
    pub user_agent: Option<String>,
    /// Caller `Host`, only used for profile resolution
    pub host: Option<String>,
    /// Full inbound headers, only used for profile resolution
    pub headers: HeaderMap,
}

impl ProxyRequest {
    /// Build a request from the inbound method, URI and headers.
    ///
    /// Rejects methods other than GET/HEAD and targets that are missing or not
    /// `http://` / `https://`.
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<Self> {
        if method != Method::GET && method != Method::HEAD {
            return Err(ProxyError::MethodNotAllowed(method.to_string()));
        }

        let target = query_param(uri, "url").ok_or(ProxyError::MissingUrl)?;
        if target.is_empty() {
            return Err(ProxyError::MissingUrl);
        }
        validate_target(&target)?;

        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        Ok(ProxyRequest {
            method: method.clone(),
            target,
            range: header_str("range").filter(|r| !r.trim().is_empty()),
            user_agent: header_str("user-agent"),
            host: header_str("host").or_else(|| uri.host().map(|h| h.to_string())),
            headers: headers.clone(),
        })
    }

    /// Whether the caller asked for a byte subset
    pub fn is_range(&self) -> bool {
        self.range.is_some()
    }

    /// Request kind used for diagnostics and cache-tier selection
    pub fn kind(&self) -> RequestKind {
        if self.is_range() {
            RequestKind::Range
        } else {
            RequestKind::Full
        }
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// Check that a target is an absolute http(s) URL
pub fn validate_target(target: &str) -> Result<()> {
    let lower = target.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(ProxyError::InvalidUrl(target.to_string()));
    }
    url::Url::parse(target).map_err(|_| ProxyError::InvalidUrl(target.to_string()))?;
    Ok(())
}

/// Extract and percent-decode a single query parameter
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Whether the request targets the whole resource or a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Range,
    Full,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Range => "Range",
            RequestKind::Full => "Full",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `X-Cache-Status` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Value of the `X-Cache-Source` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Full-tier hit
    Edge,
    /// Preload-tier hit
    Preload,
    /// Fetched from upstream
    Origin,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Edge => "Edge",
            CacheSource::Preload => "Preload",
            CacheSource::Origin => "Origin",
        }
    }
}

/// A single-part byte range from a `Range` header (`bytes=start-` or `bytes=start-end`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeSpec {
    /// First byte (inclusive)
    pub start: u64,
    /// Last byte (inclusive), `None` for open-ended ranges
    pub end: Option<u64>,
}

impl RangeSpec {
    /// Parse a `Range` header value.
    ///
    /// Suffix ranges (`bytes=-500`) and multi-part ranges are rejected; callers
    /// treat them as uncacheable and send them upstream untouched.
    pub fn from_header(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes=").ok_or_else(|| {
            ProxyError::ParseError(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        if range_part.contains(',') {
            return Err(ProxyError::ParseError(format!(
                "Multi-part ranges are not supported: {}",
                range_part
            )));
        }

        let (start, end) = range_part.split_once('-').ok_or_else(|| {
            ProxyError::ParseError(format!(
                "Invalid range format, expected 'start-end', got: {}",
                range_part
            ))
        })?;

        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|e| ProxyError::ParseError(format!("Invalid start value: {}", e)))?;

        let end = match end.trim() {
            "" => None,
            value => Some(
                value
                    .parse::<u64>()
                    .map_err(|e| ProxyError::ParseError(format!("Invalid end value: {}", e)))?,
            ),
        };

        if let Some(end) = end {
            if start > end {
                return Err(ProxyError::ParseError(format!(
                    "start ({}) must be <= end ({})",
                    start, end
                )));
            }
        }

        Ok(RangeSpec { start, end })
    }

    /// Header value for a closed range
    pub fn closed_header(start: u64, end: u64) -> String {
        format!("bytes={}-{}", start, end)
    }
}

/// Parse the total length out of a `Content-Range` value (`bytes s-e/total`)
pub fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
