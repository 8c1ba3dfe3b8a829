//! Response rewriting
//!
//! Upstream responses pass through two rewriters before they reach the
//! client: the body rewriter swaps absolute release-host URLs for the
//! proxy's release host, then the redirect rewriter points `Location`
//! headers back at the proxy's registry host.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, LOCATION, TRANSFER_ENCODING};
use hyper::{Method, Response, StatusCode};
use tracing::debug;
use url::Url;

/// Absolute URL prefix replaced in response bodies
pub const RELEASES_ORIGIN: &str = "https://releases.hashicorp.com";

/// Header marking a redirect that went through the proxy
pub const X_REVERSE_PROXY: HeaderName = HeaderName::from_static("x-reverse-proxy");

/// Value of the `X-Reverse-Proxy` marker header
pub const REVERSE_PROXY_MARKER: &str = "terraform-registry-reverse-proxy";

/// Replaces release-host URLs in buffered response bodies
#[derive(Debug, Clone)]
pub struct BodyRewriter {
    replacement: Bytes,
}

impl BodyRewriter {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            replacement: Bytes::from(format!("https://{}", config.release_proxy_host)),
        }
    }

    /// Buffer the whole body, substitute every occurrence of
    /// [`RELEASES_ORIGIN`] and reinstall it with a matching `Content-Length`.
    ///
    /// Responses that carry no body by definition (HEAD, 1xx, 204, 304)
    /// keep their original length headers.
    pub async fn rewrite<B>(&self, method: &Method, response: Response<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = response.into_parts();

        // Consumes and drops the upstream body.
        let original = body
            .collect()
            .await
            .map_err(|e| ProxyError::BodyRead(e.into()))?
            .to_bytes();

        if !carries_body(method, parts.status) {
            return Ok(Response::from_parts(parts, Full::new(original)));
        }

        let (rewritten, count) = replace_all(&original, RELEASES_ORIGIN.as_bytes(), &self.replacement);
        debug!(
            "Rewrote {} occurrence(s) of {} ({} -> {} bytes)",
            count,
            RELEASES_ORIGIN,
            original.len(),
            rewritten.len()
        );

        parts.headers.remove(TRANSFER_ENCODING);
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

        Ok(Response::from_parts(parts, Full::new(rewritten)))
    }
}

fn carries_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// Literal, non-overlapping, left-to-right replacement of every `needle`.
/// Returns the input untouched when nothing matches.
fn replace_all(haystack: &Bytes, needle: &[u8], replacement: &[u8]) -> (Bytes, usize) {
    if needle.is_empty() {
        return (haystack.clone(), 0);
    }

    let mut out: Vec<u8> = Vec::new();
    let mut count = 0;
    let mut copied = 0;
    let mut pos = 0;

    while let Some(offset) = find(&haystack[pos..], needle) {
        let start = pos + offset;
        if count == 0 {
            out.reserve(haystack.len());
        }
        out.extend_from_slice(&haystack[copied..start]);
        out.extend_from_slice(replacement);
        pos = start + needle.len();
        copied = pos;
        count += 1;
    }

    if count == 0 {
        return (haystack.clone(), 0);
    }

    out.extend_from_slice(&haystack[copied..]);
    (Bytes::from(out), count)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Points redirect targets at the proxy's registry host
///
/// Redirects from either upstream are normalized to the registry public
/// host.
#[derive(Debug, Clone)]
pub struct RedirectRewriter {
    host: String,
    port: Option<u16>,
}

impl RedirectRewriter {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let public = Url::parse(&format!("https://{}/", config.registry_proxy_host)).map_err(|e| {
            ProxyError::Config(format!(
                "Invalid registry proxy host '{}': {}",
                config.registry_proxy_host, e
            ))
        })?;

        let host = public
            .host_str()
            .ok_or_else(|| {
                ProxyError::Config(format!(
                    "Registry proxy host '{}' has no host part",
                    config.registry_proxy_host
                ))
            })?
            .to_string();

        Ok(Self {
            host,
            port: public.port(),
        })
    }

    /// Rewrite the `Location` header, if any, and tag the response.
    ///
    /// A missing or empty `Location` is a no-op. A location that cannot be
    /// rewritten fails the response instead of leaking the upstream host.
    pub fn rewrite<B>(&self, response: &mut Response<B>) -> Result<()> {
        let Some(value) = response.headers().get(LOCATION) else {
            return Ok(());
        };
        if value.is_empty() {
            return Ok(());
        }

        let location = value.to_str().map_err(|e| ProxyError::MalformedRedirect {
            location: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            reason: e.to_string(),
        })?;

        let rewritten = self.rewrite_location(location)?;
        let header = HeaderValue::from_str(&rewritten).map_err(|e| ProxyError::MalformedRedirect {
            location: location.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Redirect {} -> {}", location, rewritten);

        let headers = response.headers_mut();
        headers.insert(LOCATION, header);
        headers.insert(X_REVERSE_PROXY, HeaderValue::from_static(REVERSE_PROXY_MARKER));
        Ok(())
    }

    /// Replace host and port of a redirect target, keeping scheme, path
    /// and query. Origin-relative targets are anchored on the registry host
    /// and come back scheme-relative, so the client stays on the proxy.
    pub fn rewrite_location(&self, location: &str) -> Result<String> {
        if let Some(rest) = location.strip_prefix("//") {
            // Scheme-relative: rewrite as https, then drop the scheme again.
            let url = Url::parse(&format!("https://{}", rest)).map_err(|e| malformed(location, e))?;
            return self.retarget_scheme_relative(location, url);
        }

        match Url::parse(location) {
            Ok(url) => self.retarget(location, url),
            Err(url::ParseError::RelativeUrlWithoutBase) if location.starts_with('/') => {
                let url = Url::parse(&format!("https://{}{}", self.host, location))
                    .map_err(|e| malformed(location, e))?;
                self.retarget_scheme_relative(location, url)
            }
            Err(e) => Err(malformed(location, e)),
        }
    }

    fn retarget_scheme_relative(&self, original: &str, url: Url) -> Result<String> {
        let absolute = self.retarget(original, url)?;
        Ok(absolute.trim_start_matches("https:").to_string())
    }

    fn retarget(&self, original: &str, mut url: Url) -> Result<String> {
        url.set_host(Some(self.host.as_str()))
            .map_err(|e| malformed(original, e))?;
        url.set_port(self.port)
            .map_err(|()| malformed(original, "URL cannot carry a port"))?;
        Ok(url.into())
    }
}

fn malformed(location: &str, reason: impl std::fmt::Display) -> ProxyError {
    ProxyError::MalformedRedirect {
        location: location.to_string(),
        reason: reason.to_string(),
    }
}

/// Body rewrite followed by redirect rewrite; the first failure wins
#[derive(Debug, Clone)]
pub struct ResponseRewriter {
    body: BodyRewriter,
    redirect: RedirectRewriter,
}

impl ResponseRewriter {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            body: BodyRewriter::new(config),
            redirect: RedirectRewriter::new(config)?,
        })
    }

    pub async fn rewrite<B>(&self, method: &Method, response: Response<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut response = self.body.rewrite(method, response).await?;
        self.redirect.rewrite(&mut response)?;
        Ok(response)
    }
}
