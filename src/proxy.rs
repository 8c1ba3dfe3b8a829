//! Proxy server implementation
//! Accepts HTTP connections, routes each request by Host and rewrites the
//! upstream response before returning it

use crate::config::ProxyConfig;
use crate::director::{request_host, Director};
use crate::error::{ProxyError, Result};
use crate::rewrite::ResponseRewriter;
use crate::transport::{strip_hop_by_hop, Transport};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Proxy server
///
/// All state is read-only after construction, so one instance is shared by
/// every connection task.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    director: Director,
    rewriter: ResponseRewriter,
    transport: Transport,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let director = Director::new(&config)?;
        let rewriter = ResponseRewriter::new(&config)?;
        let transport = Transport::new(&config.transport)?;

        Ok(Self {
            config: Arc::new(config),
            director,
            rewriter,
            transport,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start the proxy server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let listener = TcpListener::bind(addr).await?;

        info!("HTTP server listening on {}", addr);
        for target in self.director.targets() {
            info!(
                "  {} -> {}://{} ({})",
                target.public_host, target.scheme, target.authority, target.name
            );
        }

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    ///
    /// A client that goes away drops the in-flight request future, which
    /// aborts its upstream exchange.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await?;

        Ok(())
    }

    /// Handle incoming request, turning failures into error responses
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let version = req.version();
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let response = match self.process_request(req).await {
            Ok(response) => response,
            Err(e) => {
                error!("{} {} from {} failed: {}", method, target, remote_addr, e);
                Self::error_response(e.status_code())
            }
        };

        let size = response.body().size_hint().exact().unwrap_or(0);
        info!(
            "{} - - \"{} {} {:?}\" {} {}",
            remote_addr.ip(),
            method,
            target,
            version,
            response.status().as_u16(),
            size
        );

        Ok(response)
    }

    /// Direct, forward, and rewrite one request
    pub async fn process_request<B>(&self, mut req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let host = request_host(&req).ok_or(ProxyError::MissingHost)?.to_string();

        let upstream = self
            .director
            .direct(&mut req)
            .map(|t| t.name)
            .ok_or(ProxyError::NoUpstream { host })?;
        debug!("{} {} -> {}", req.method(), req.uri(), upstream);

        let method = req.method().clone();
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::RequestBody(e.into()))?
            .to_bytes();

        let mut response = self.transport.forward(Request::from_parts(parts, body)).await?;
        strip_hop_by_hop(response.headers_mut());

        self.rewriter.rewrite(&method, response).await
    }

    /// Create error response
    fn error_response(status: StatusCode) -> Response<Full<Bytes>> {
        let message = status.canonical_reason().unwrap_or("Error");

        let mut response = Response::new(Full::new(Bytes::from(message)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
        response
    }
}
