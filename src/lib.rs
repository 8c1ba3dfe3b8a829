//! tf-registry-proxy - Reverse proxy for the Terraform registry
//!
//! Fronts the module/provider registry and the release-artifact host:
//! - Host-based routing onto the two upstreams, with Terraform identity headers
//! - Release-host URL substitution in response bodies
//! - Redirect `Location` rewriting back onto the proxy

pub mod config;
pub mod director;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod transport;

pub use config::{ProxyConfig, TransportConfig};
pub use director::{Director, UpstreamTarget};
pub use error::{ProxyError, Result};
pub use proxy::ProxyServer;
pub use rewrite::{BodyRewriter, RedirectRewriter, ResponseRewriter};
