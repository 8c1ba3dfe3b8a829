//! Outbound HTTP transport
//!
//! Thin wrapper over a pooled `reqwest` client tuned from
//! [`TransportConfig`]. Redirects are never followed here; they go back to
//! the client after the redirect rewriter has seen them.

use crate::config::TransportConfig;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use hyper::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Request, Response};
use tracing::debug;

/// Hop-by-hop headers that never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Pooled client used for every upstream request
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    /// Build the client. Proxy settings are taken from the environment.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_keepalive(config.keep_alive)
            .pool_idle_timeout(config.idle_conn_timeout)
            .pool_max_idle_per_host(config.max_idle_conns)
            .redirect(reqwest::redirect::Policy::none());

        if !config.force_attempt_http2 {
            builder = builder.http1_only();
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Send a directed request upstream and hand back the unread response
    pub async fn forward(&self, request: Request<Bytes>) -> Result<Response<reqwest::Body>> {
        let (parts, body) = request.into_parts();
        let url = upstream_url(&parts)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        debug!("Forwarding {} {}", parts.method, url);

        let mut builder = self.client.request(parts.method, url.as_str()).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| ProxyError::Upstream { url, source })?;

        Ok(response.into())
    }
}

/// Absolute URL of a directed request
///
/// Only the director produces absolute URIs. Anything else has no upstream
/// and is refused rather than dialed at its own Host.
fn upstream_url(parts: &Parts) -> Result<String> {
    if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        return Ok(parts.uri.to_string());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    Err(ProxyError::NoUpstream {
        host: host.to_string(),
    })
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
