//! Error types for the audio relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while proxying a request
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Missing url parameter")]
    MissingUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Upstream {status}")]
    UpstreamStatus { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream timed out: {0}")]
    Timeout(String),

    #[error("Upstream failed after {attempts} attempts: {message}")]
    UpstreamExhausted {
        attempts: usize,
        last_status: Option<u16>,
        message: String,
    },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Body error: {0}")]
    BodyError(String),

    #[error("Stage answered {status}: {message}")]
    StageFailed { status: u16, message: String },

    #[error("All fetch stages failed: {message}")]
    FallbackExhausted { message: String, stages: Vec<String> },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else {
            ProxyError::Network(err.to_string())
        }
    }
}

impl ProxyError {
    /// Whether a single upstream attempt that failed with this error may be retried.
    ///
    /// Bad statuses, network exceptions and timeouts are treated identically.
    /// Everything else is either a client mistake or already final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamStatus { .. } | ProxyError::Network(_) | ProxyError::Timeout(_)
        )
    }

    /// Convert error to the HTTP status returned to the client
    ///
    /// - invalid requests: 400 / 405
    /// - exhausted upstream: the last status the upstream sent, or 502 if it never answered
    /// - exhausted fallback chain and raw network failures: 502
    /// - anything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::MissingUrl | ProxyError::InvalidUrl(_) => 400,
            ProxyError::MethodNotAllowed(_) => 405,
            ProxyError::UpstreamStatus { status } => *status,
            ProxyError::UpstreamExhausted { last_status, .. } => match last_status {
                Some(status) if (400..600).contains(status) => *status,
                _ => 502,
            },
            ProxyError::Network(_) | ProxyError::Timeout(_) => 502,
            ProxyError::StageFailed { status, .. } => *status,
            ProxyError::FallbackExhausted { .. } => 502,
            ProxyError::ParseError(_) => 400,
            ProxyError::CacheError(_)
            | ProxyError::ConfigError(_)
            | ProxyError::BodyError(_)
            | ProxyError::Internal(_) => 500,
        }
    }

    /// Message placed into the `{ "error": ... }` envelope.
    ///
    /// Retry details stay out of the body; they travel in `X-Retries`.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::MissingUrl => "Missing url parameter".to_string(),
            ProxyError::InvalidUrl(_) => "Invalid URL".to_string(),
            ProxyError::MethodNotAllowed(_) => "Method not allowed".to_string(),
            ProxyError::UpstreamExhausted { message, .. } => message.clone(),
            ProxyError::StageFailed { message, .. } => message.clone(),
            ProxyError::FallbackExhausted { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Create an error from an upstream HTTP status code
    pub fn from_status(status: u16) -> Self {
        ProxyError::UpstreamStatus { status }
    }
}
