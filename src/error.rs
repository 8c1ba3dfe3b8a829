//! Error types for the registry proxy

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
///
/// Every variant is local to the request that produced it; none of them
/// takes the server down.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Invalid startup configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound request had no usable Host header
    #[error("Missing Host header")]
    MissingHost,

    /// Reading the inbound request body failed
    #[error("Failed to read request body: {0}")]
    RequestBody(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Request Host matched no configured upstream
    #[error("No upstream configured for host '{host}'")]
    NoUpstream { host: String },

    /// Upstream could not be reached or did not answer
    #[error("Upstream request to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Buffering the upstream response body failed
    #[error("Failed to read response body: {0}")]
    BodyRead(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Upstream Location header could not be rewritten
    #[error("Malformed redirect location '{location}': {reason}")]
    MalformedRedirect { location: String, reason: String },

    /// Building a request or response failed
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    /// Serving an inbound connection failed
    #[error("Connection error: {0}")]
    Connection(#[from] hyper::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code returned to the client when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingHost | Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::NoUpstream { .. }
            | Self::Upstream { .. }
            | Self::BodyRead(_)
            | Self::MalformedRedirect { .. } => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Http(_) | Self::Connection(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
