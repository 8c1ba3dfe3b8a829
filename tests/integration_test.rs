//! Integration tests for tf-registry-proxy
//!
//! Runs the proxy against mock upstreams and checks:
//! - Host-based routing and identity headers
//! - Body rewriting with recomputed Content-Length
//! - Redirect rewriting and the marker header
//! - Error responses for bad upstreams and bad requests

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tf_registry_proxy::{ProxyConfig, ProxyServer};
use tokio::time::{sleep, timeout};
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19500);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Matches requests that do not carry the given header
struct HeaderAbsent(&'static str);

impl Match for HeaderAbsent {
    fn matches(&self, request: &Request) -> bool {
        request.headers.get(self.0).is_none()
    }
}

/// Start a proxy whose upstreams are the given base URLs
async fn start_proxy(registry_upstream: String, release_upstream: String) -> u16 {
    let port = get_unique_port();
    let config = ProxyConfig {
        registry_upstream,
        release_upstream,
        http_port: port,
        ..ProxyConfig::default()
    };

    let proxy = Arc::new(ProxyServer::new(config).unwrap());
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(150)).await;
    port
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_registry_request_end_to_end() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;

    let upstream_body = r#"{"download_url":"https://releases.hashicorp.com/terraform/1.1.7/terraform_1.1.7_linux_amd64.zip"}"#;
    Mock::given(method("GET"))
        .and(path("/v1/providers/x"))
        .and(header("user-agent", "Terraform/1.1.7"))
        .and(header("x-terraform-version", "1.1.7"))
        .respond_with(ResponseTemplate::new(200).set_body_string(upstream_body))
        .expect(1)
        .mount(&registry)
        .await;

    let port = start_proxy(registry.uri(), release.uri()).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/v1/providers/x", port))
        .header("Host", "registry.local")
        .header("Accept-Encoding", "gzip")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let content_length: usize = response.headers()["content-length"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = response.text().await.unwrap();

    assert_eq!(
        body,
        r#"{"download_url":"https://release.local/terraform/1.1.7/terraform_1.1.7_linux_amd64.zip"}"#
    );
    assert_eq!(content_length, body.len());

    // Compression was disabled on the way out.
    let received = registry.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].headers["accept-encoding"], "");
}

#[tokio::test]
async fn test_release_request_has_no_identity_header() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/terraform/1.1.7/index.json"))
        .and(query_param("x", "1"))
        .and(header("user-agent", "Terraform/1.1.7"))
        .and(HeaderAbsent("x-terraform-version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&release)
        .await;

    let port = start_proxy(registry.uri(), release.uri()).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/terraform/1.1.7/index.json?x=1", port))
        .header("Host", "release.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "{}");
}

#[tokio::test]
async fn test_release_redirect_rewritten_to_registry_host() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/terraform/"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "https://releases.hashicorp.com/terraform/1.1.7/?x=1"),
        )
        .mount(&release)
        .await;

    let port = start_proxy(registry.uri(), release.uri()).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/terraform/", port))
        .header("Host", "release.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(
        response.headers()["location"],
        "https://registry.local/terraform/1.1.7/?x=1"
    );
    assert_eq!(
        response.headers()["x-reverse-proxy"],
        "terraform-registry-reverse-proxy"
    );
}

#[tokio::test]
async fn test_malformed_redirect_returns_502() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "::not a uri::"))
        .mount(&registry)
        .await;

    let port = start_proxy(registry.uri(), release.uri()).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/v1/modules", port))
        .header("Host", "registry.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    assert!(response.headers().get("x-reverse-proxy").is_none());
    assert!(response.headers().get("location").is_none());
}

#[tokio::test]
async fn test_response_without_location_has_no_marker() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
        .mount(&registry)
        .await;

    let port = start_proxy(registry.uri(), release.uri()).await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/.well-known/terraform.json", port))
        .header("Host", "registry.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().get("x-reverse-proxy").is_none());
    assert_eq!(response.headers()["content-length"], "5");
}

#[tokio::test]
async fn test_post_body_forwarded() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/data"))
        .and(body_string("test body content"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&registry)
        .await;

    let port = start_proxy(registry.uri(), release.uri()).await;

    let response = client()
        .post(format!("http://127.0.0.1:{}/v1/data", port))
        .header("Host", "registry.local")
        .body("test body content")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
}

#[tokio::test]
async fn test_unknown_host_refused_with_502() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;
    let port = start_proxy(registry.uri(), release.uri()).await;

    // The proxy's own address as Host must not be dialed back.
    let request = client()
        .get(format!("http://127.0.0.1:{}/v1/providers/x", port))
        .header("Host", format!("127.0.0.1:{}", port))
        .send();
    let response = timeout(Duration::from_secs(2), request)
        .await
        .expect("proxy looped on its own address")
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(response.text().await.unwrap(), "Bad Gateway");
    assert!(registry.received_requests().await.unwrap().is_empty());
    assert!(release.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_absolute_form_request_not_relayed() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;
    let bystander = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&bystander)
        .await;
    let port = start_proxy(registry.uri(), release.uri()).await;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    let authority = bystander.address().to_string();
    let request = format!(
        "GET http://{}/secret HTTP/1.1\r\nHost: {}\r\n\r\n",
        authority, authority
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 1024];
    let n = timeout(Duration::from_secs(2), stream.read(&mut response))
        .await
        .expect("no response from proxy")
        .unwrap();
    let response_str = String::from_utf8_lossy(&response[..n]);

    assert!(response_str.starts_with("HTTP/1.1 502"), "{}", response_str);
    assert!(bystander.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upstream_unreachable_502() {
    let unused = get_unique_port();
    let port = start_proxy(
        format!("http://127.0.0.1:{}", unused),
        format!("http://127.0.0.1:{}", unused),
    )
    .await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/v1/providers/x", port))
        .header("Host", "registry.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(response.text().await.unwrap(), "Bad Gateway");
}

#[tokio::test]
async fn test_missing_host_400() {
    let registry = MockServer::start().await;
    let release = MockServer::start().await;
    let port = start_proxy(registry.uri(), release.uri()).await;

    // Make raw TCP request without Host header
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    stream
        .write_all(b"GET /v1/providers/x HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await.unwrap();
    let response_str = String::from_utf8_lossy(&response[..n]);

    assert!(response_str.contains("400"));
}
