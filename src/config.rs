//! Proxy configuration
//!
//! Loaded once at startup and shared read-only by every request.

use crate::error::{ProxyError, Result};
use std::time::Duration;
use url::Url;

/// Canonical registry upstream
pub const DEFAULT_REGISTRY_UPSTREAM: &str = "https://registry.terraform.io";

/// Canonical release-artifact upstream
pub const DEFAULT_RELEASE_UPSTREAM: &str = "https://releases.hashicorp.com";

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Public host routed to the registry upstream
    pub registry_proxy_host: String,
    /// Public host routed to the release upstream
    pub release_proxy_host: String,
    /// Base URL of the registry upstream
    pub registry_upstream: String,
    /// Base URL of the release upstream
    pub release_upstream: String,
    pub http_port: u16,
    pub transport: TransportConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            registry_proxy_host: "registry.local".to_string(),
            release_proxy_host: "release.local".to_string(),
            registry_upstream: DEFAULT_REGISTRY_UPSTREAM.to_string(),
            release_upstream: DEFAULT_RELEASE_UPSTREAM.to_string(),
            http_port: 8555,
            transport: TransportConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, host) in [
            ("registry proxy host", &self.registry_proxy_host),
            ("release proxy host", &self.release_proxy_host),
        ] {
            if host.trim().is_empty() {
                return Err(ProxyError::Config(format!("{} must not be empty", name)));
            }
            if host.contains('/') {
                return Err(ProxyError::Config(format!(
                    "{} '{}' must be a bare host",
                    name, host
                )));
            }
        }

        if self.registry_proxy_host == self.release_proxy_host {
            return Err(ProxyError::Config(format!(
                "registry and release proxy hosts must differ (both '{}')",
                self.registry_proxy_host
            )));
        }

        parse_upstream(&self.registry_upstream)?;
        parse_upstream(&self.release_upstream)?;

        Ok(())
    }
}

/// Parse an upstream base URL, accepting only http(s) with a host and no path
pub(crate) fn parse_upstream(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ProxyError::Config(format!("Invalid upstream URL '{}': {}", raw, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::Config(format!(
            "Upstream URL '{}' must use http or https",
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(ProxyError::Config(format!("Upstream URL '{}' has no host", raw)));
    }
    if url.path() != "/" || url.query().is_some() {
        return Err(ProxyError::Config(format!(
            "Upstream URL '{}' must not carry a path or query",
            raw
        )));
    }

    Ok(url)
}

/// Tunables handed to the outbound HTTP client
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub dial_timeout: Duration,
    /// TCP keep-alive interval
    pub keep_alive: Duration,
    /// How long an idle pooled connection is kept
    pub idle_conn_timeout: Duration,
    /// Idle pooled connections kept per upstream host
    pub max_idle_conns: usize,
    /// Extra budget for the TLS handshake on top of the dial
    pub tls_handshake_timeout: Duration,
    /// Negotiate HTTP/2 when the upstream offers it
    pub force_attempt_http2: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            idle_conn_timeout: Duration::from_secs(90),
            max_idle_conns: 100,
            tls_handshake_timeout: Duration::from_secs(10),
            force_attempt_http2: true,
        }
    }
}

impl TransportConfig {
    /// Total time allowed to establish a connection, TLS included
    pub fn connect_timeout(&self) -> Duration {
        self.dial_timeout + self.tls_handshake_timeout
    }
}
