//! tf-registry-proxy - Main entry point
//!
//! Reverse proxy for the Terraform registry and release host

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tf_registry_proxy::config::{DEFAULT_REGISTRY_UPSTREAM, DEFAULT_RELEASE_UPSTREAM};
use tf_registry_proxy::{ProxyConfig, ProxyServer, TransportConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// tf-registry-proxy - Reverse proxy for the Terraform registry and release host
#[derive(Parser, Debug)]
#[command(name = "tf-registry-proxy")]
#[command(version)]
#[command(about = "Reverse proxy for the Terraform registry and release host")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8555")]
    http_port: u16,

    /// Public host routed to the registry
    #[arg(long, env = "REGISTRY_PROXY_HOST", default_value = "registry.local")]
    registry_proxy_host: String,

    /// Public host routed to the release host
    #[arg(long, env = "RELEASE_PROXY_HOST", default_value = "release.local")]
    release_proxy_host: String,

    /// Registry upstream base URL
    #[arg(long, env = "REGISTRY_UPSTREAM", default_value = DEFAULT_REGISTRY_UPSTREAM)]
    registry_upstream: String,

    /// Release upstream base URL
    #[arg(long, env = "RELEASE_UPSTREAM", default_value = DEFAULT_RELEASE_UPSTREAM)]
    release_upstream: String,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "DIAL_TIMEOUT_SECS", default_value = "30")]
    dial_timeout_secs: u64,

    /// TCP keep-alive interval in seconds
    #[arg(long, env = "KEEP_ALIVE_SECS", default_value = "30")]
    keep_alive_secs: u64,

    /// Idle upstream connection lifetime in seconds
    #[arg(long, env = "IDLE_CONN_TIMEOUT_SECS", default_value = "90")]
    idle_conn_timeout_secs: u64,

    /// Idle upstream connections kept per host
    #[arg(long, env = "MAX_IDLE_CONNS", default_value = "100")]
    max_idle_conns: usize,

    /// TLS handshake budget in seconds
    #[arg(long, env = "TLS_HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    tls_handshake_timeout_secs: u64,

    /// Negotiate HTTP/2 with upstreams that support it
    #[arg(long, env = "FORCE_HTTP2", default_value = "true", action = clap::ArgAction::Set)]
    force_http2: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            registry_proxy_host: self.registry_proxy_host,
            release_proxy_host: self.release_proxy_host,
            registry_upstream: self.registry_upstream,
            release_upstream: self.release_upstream,
            http_port: self.http_port,
            transport: TransportConfig {
                dial_timeout: Duration::from_secs(self.dial_timeout_secs),
                keep_alive: Duration::from_secs(self.keep_alive_secs),
                idle_conn_timeout: Duration::from_secs(self.idle_conn_timeout_secs),
                max_idle_conns: self.max_idle_conns,
                tls_handshake_timeout: Duration::from_secs(self.tls_handshake_timeout_secs),
                force_attempt_http2: self.force_http2,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting tf-registry-proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    info!("Registry proxy host: {}", config.registry_proxy_host);
    info!("Release proxy host: {}", config.release_proxy_host);

    let server = Arc::new(ProxyServer::new(config)?);
    server.run().await?;

    Ok(())
}
