//! Request director
//!
//! Picks the upstream for an inbound request from its Host header and
//! rewrites the request so it reaches that upstream with the identity
//! headers a Terraform CLI would send.

use crate::config::{parse_upstream, ProxyConfig};
use crate::error::{ProxyError, Result};
use hyper::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, HOST, USER_AGENT};
use hyper::http::uri::{Authority, Parts, PathAndQuery, Scheme};
use hyper::{HeaderMap, Request, Uri};
use tracing::{debug, warn};

/// Terraform CLI version the proxy presents itself as
pub const TERRAFORM_VERSION: &str = "1.1.7";

/// User agent sent to both upstreams
pub const TERRAFORM_USER_AGENT: &str = "Terraform/1.1.7";

/// Identity header sent to the registry upstream
pub const X_TERRAFORM_VERSION: HeaderName = HeaderName::from_static("x-terraform-version");

/// One entry of the routing table
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    /// Short name used in logs
    pub name: &'static str,
    /// Host header value this target answers to
    pub public_host: String,
    pub scheme: Scheme,
    pub authority: Authority,
    /// Headers set on every request routed here
    pub headers: HeaderMap,
    host_header: HeaderValue,
}

impl UpstreamTarget {
    /// Build a target from an upstream base URL such as `https://registry.terraform.io`
    pub fn new(
        name: &'static str,
        public_host: impl Into<String>,
        upstream: &str,
        headers: HeaderMap,
    ) -> Result<Self> {
        let url = parse_upstream(upstream)?;

        let scheme: Scheme = url
            .scheme()
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid scheme in '{}': {}", upstream, e)))?;

        let host = url.host_str().unwrap_or_default();
        let authority_str = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let authority: Authority = authority_str
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid authority in '{}': {}", upstream, e)))?;
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|e| ProxyError::Config(format!("Invalid host in '{}': {}", upstream, e)))?;

        Ok(Self {
            name,
            public_host: public_host.into(),
            scheme,
            authority,
            headers,
            host_header,
        })
    }

    /// Absolute URI on this upstream for the given path and query
    fn uri_for(&self, path_and_query: PathAndQuery) -> std::result::Result<Uri, hyper::http::Error> {
        let mut parts = Parts::default();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        parts.path_and_query = Some(path_and_query);
        Ok(Uri::from_parts(parts)?)
    }
}

/// Routes inbound requests onto the upstream table
#[derive(Debug, Clone)]
pub struct Director {
    targets: Vec<UpstreamTarget>,
}

impl Director {
    /// Build the registry and release targets from configuration
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut registry_headers = HeaderMap::new();
        registry_headers.insert(X_TERRAFORM_VERSION, HeaderValue::from_static(TERRAFORM_VERSION));
        registry_headers.insert(USER_AGENT, HeaderValue::from_static(TERRAFORM_USER_AGENT));

        let mut release_headers = HeaderMap::new();
        release_headers.insert(USER_AGENT, HeaderValue::from_static(TERRAFORM_USER_AGENT));

        Ok(Self::with_targets(vec![
            UpstreamTarget::new(
                "registry",
                config.registry_proxy_host.as_str(),
                &config.registry_upstream,
                registry_headers,
            )?,
            UpstreamTarget::new(
                "release",
                config.release_proxy_host.as_str(),
                &config.release_upstream,
                release_headers,
            )?,
        ]))
    }

    /// Build a director over an arbitrary routing table
    pub fn with_targets(targets: Vec<UpstreamTarget>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[UpstreamTarget] {
        &self.targets
    }

    /// Rewrite the request in place for its upstream.
    ///
    /// Requests with no matching target keep their URI, Host and identity
    /// headers and yield `None`; the caller must not forward them.
    /// `Accept-Encoding` is always emptied so upstream bodies arrive
    /// uncompressed for rewriting.
    pub fn direct<B>(&self, req: &mut Request<B>) -> Option<&UpstreamTarget> {
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static(""));

        let target = request_host(req)
            .and_then(|host| self.targets.iter().find(|t| t.public_host == host));
        let Some(target) = target else {
            debug!("No upstream for host {:?}", request_host(req));
            return None;
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        // The URI and Host change together or not at all.
        let uri = match target.uri_for(path_and_query) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Could not build {} upstream URI: {}", target.name, e);
                return None;
            }
        };
        *req.uri_mut() = uri;

        let headers = req.headers_mut();
        headers.insert(HOST, target.host_header.clone());
        for (name, value) in target.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        debug!("Routed to {} upstream {}", target.name, target.authority);
        Some(target)
    }
}

/// Host the client addressed, from the Host header or an absolute-form URI
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .filter(|h| !h.is_empty())
}
