//! Integration tests driving real listeners end to end

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use voltproxy::config::Config;
use voltproxy::docker::{ContainerSummary, Docker, MockDocker};
use voltproxy::health::launch_health_checks;
use voltproxy::loadbalancer::cookie_name;
use voltproxy::proxy::ProxyServer;
use voltproxy::tls::Http01Challenges;

/// Spawn an upstream that answers every request with the given status line
/// and a `Server-Name` header, and records each request's head.
async fn spawn_upstream(
    status_line: &'static str,
    server_name: &'static str,
) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&requests);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let captured = Arc::clone(&captured);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                captured
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf[..n]).to_string());
                let response = format!(
                    "HTTP/1.1 {}\r\nServer-Name: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line, server_name
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (addr, requests)
}

/// Pick a port nothing is listening on.
async fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn wait_for_port(addr: SocketAddr) {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("proxy never started listening on {}", addr);
}

/// Materialize the config, launch health checks, and run a plain listener.
async fn start_proxy(yaml: &str, docker: Arc<dyn Docker>) -> SocketAddr {
    let config = Config::parse(yaml).unwrap();
    let registry = config.services(docker).unwrap();
    launch_health_checks(&registry.services);

    let addr = free_port().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    std::mem::forget(shutdown_tx);

    let server = ProxyServer::new(addr, Arc::new(registry.table), shutdown_rx)
        .with_read_timeout(config.read_timeout);
    tokio::spawn(server.run());
    wait_for_port(addr).await;
    addr
}

fn no_docker() -> Arc<dyn Docker> {
    Arc::new(MockDocker::new(vec![]))
}

/// A parsed response: status, lowercased header map, body.
struct TestResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

async fn http_get(addr: SocketAddr, host: &str, path: &str, extra_headers: &[String]) -> TestResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    for header in extra_headers {
        request.push_str(header);
        request.push_str("\r\n");
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .unwrap();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    TestResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

#[tokio::test]
async fn test_http_passthrough() {
    let (upstream, _) = spawn_upstream("202 Accepted", "upstream").await;
    let yaml = format!(
        r#"
services:
  s:
    host: foo.example.com
    redirect: "http://{}"
"#,
        upstream
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    let response = http_get(proxy, "foo.example.com", "/", &[]).await;
    assert_eq!(response.status, 202);
    assert_eq!(response.headers.get("server-name").unwrap(), "upstream");
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let (upstream, _) = spawn_upstream("200 OK", "upstream").await;
    let yaml = format!(
        r#"
services:
  s:
    host: foo.example.com
    redirect: "http://{}"
"#,
        upstream
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    let response = http_get(proxy, "other.example.com", "/", &[]).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_tls_service_over_http_redirects() {
    let (upstream, _) = spawn_upstream("200 OK", "upstream").await;
    let yaml = format!(
        r#"
services:
  s:
    host: secure.example.com
    tls: true
    redirect: "http://{}"
"#,
        upstream
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    let response = http_get(proxy, "secure.example.com", "/", &[]).await;
    assert_eq!(response.status, 301);
    assert_eq!(
        response.headers.get("location").unwrap(),
        "https://secure.example.com/"
    );

    // Path and query are preserved by the upgrade.
    let response = http_get(proxy, "secure.example.com", "/a/b?q=1", &[]).await;
    assert_eq!(
        response.headers.get("location").unwrap(),
        "https://secure.example.com/a/b?q=1"
    );
}

#[tokio::test]
async fn test_container_resolved() {
    let (upstream, _) = spawn_upstream("418 I'm a teapot", "container").await;
    let docker: Arc<dyn Docker> = Arc::new(MockDocker::new(vec![vec![ContainerSummary {
        names: vec!["/foo".to_string()],
        networks: HashMap::from([("bar".to_string(), "127.0.0.1".to_string())]),
    }]]));
    let yaml = format!(
        r#"
services:
  s:
    host: app.example.com
    container:
      name: /foo
      network: bar
      port: {}
"#,
        upstream.port()
    );
    let proxy = start_proxy(&yaml, docker).await;

    let response = http_get(proxy, "app.example.com", "/", &[]).await;
    assert_eq!(response.status, 418);
}

#[tokio::test]
async fn test_missing_container_is_404() {
    let yaml = r#"
services:
  s:
    host: app.example.com
    container:
      name: /foo
      network: bar
      port: 8080
"#;
    let proxy = start_proxy(yaml, no_docker()).await;

    let response = http_get(proxy, "app.example.com", "/", &[]).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_container_not_in_network_is_404() {
    let docker: Arc<dyn Docker> = Arc::new(MockDocker::new(vec![vec![ContainerSummary {
        names: vec!["/foo".to_string()],
        networks: HashMap::from([("bridge".to_string(), "127.0.0.1".to_string())]),
    }]]));
    let yaml = r#"
services:
  s:
    host: app.example.com
    container:
      name: /foo
      network: bar
      port: 8080
"#;
    let proxy = start_proxy(yaml, docker).await;

    let response = http_get(proxy, "app.example.com", "/", &[]).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_round_robin_rotation() {
    let (foo, _) = spawn_upstream("200 OK", "foo").await;
    let (bar, _) = spawn_upstream("200 OK", "bar").await;
    let (baz, _) = spawn_upstream("200 OK", "baz").await;
    let yaml = format!(
        r#"
services:
  foo:
    redirect: "http://{}"
  bar:
    redirect: "http://{}"
  baz:
    redirect: "http://{}"
  lb:
    host: lb.example.com
    loadBalancer:
      strategy: roundRobin
      serviceNames: [foo, bar, baz]
"#,
        foo, bar, baz
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    let mut served = Vec::new();
    for _ in 0..6 {
        let response = http_get(proxy, "lb.example.com", "/", &[]).await;
        assert_eq!(response.status, 200);
        served.push(response.headers.get("server-name").unwrap().clone());
    }
    assert_eq!(served, vec!["foo", "bar", "baz", "foo", "bar", "baz"]);
}

#[tokio::test]
async fn test_persistent_stickiness_with_health_loss() {
    let (down, _) = spawn_upstream("500 Internal Server Error", "down").await;
    let (up, _) = spawn_upstream("418 I'm a teapot", "up").await;
    let yaml = format!(
        r#"
services:
  unhealthy:
    redirect: "http://{}"
    health:
      path: /health
      interval: 100ms
      timeout: 500ms
  up:
    redirect: "http://{}"
  lb:
    host: lb.example.com
    loadBalancer:
      persistent: true
      serviceNames: [unhealthy, up]
"#,
        down, up
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    // Give the health loop a few probe rounds to mark the member down.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Even though round-robin would begin at index 0, the unhealthy member
    // is skipped.
    let response = http_get(proxy, "lb.example.com", "/", &[]).await;
    assert_eq!(response.status, 418);
    let cookie = response.headers.get("set-cookie").unwrap().clone();
    let name = cookie_name("lb.example.com");
    assert_eq!(cookie, format!("{}=1; HttpOnly", name));

    // Requests carrying the cookie stay on the same member and no
    // replacement cookie is emitted.
    for _ in 0..3 {
        let response = http_get(
            proxy,
            "lb.example.com",
            "/",
            &[format!("Cookie: {}=1", name)],
        )
        .await;
        assert_eq!(response.status, 418);
        assert!(response.headers.get("set-cookie").is_none());
    }
}

#[tokio::test]
async fn test_auth_forward_runs_before_ip_allow() {
    let (upstream, _) = spawn_upstream("200 OK", "upstream").await;
    let (auth, auth_requests) = spawn_upstream("200 OK", "auth").await;
    let yaml = format!(
        r#"
services:
  web:
    host: example.com
    redirect: "http://{}"
    middlewares:
      authForward:
        address: "http://{}"
        xForwarded: true
      ipAllow: ["0.0.0.0/32"]
"#,
        upstream, auth
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    // The auth server runs first and sees the forwarded client metadata;
    // the allow-list then rejects the request because 0.0.0.0/32 matches
    // no client.
    let response = http_get(proxy, "example.com", "/", &[]).await;
    assert_eq!(response.status, 403);

    let requests = auth_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let seen = requests[0].to_lowercase();
    assert!(seen.contains("x-forwarded-for: 127.0.0.1"), "{}", seen);
    assert!(seen.contains("x-forwarded-host: example.com"), "{}", seen);
}

#[tokio::test]
async fn test_auth_forward_failure_status_reaches_client() {
    let (upstream, upstream_requests) = spawn_upstream("200 OK", "upstream").await;
    let (auth, _) = spawn_upstream("401 Unauthorized", "auth").await;
    let yaml = format!(
        r#"
services:
  web:
    host: example.com
    redirect: "http://{}"
    middlewares:
      authForward:
        address: "http://{}"
"#,
        upstream, auth
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    let response = http_get(proxy, "example.com", "/", &[]).await;
    assert_eq!(response.status, 401);
    // The backend is never consulted when authentication fails.
    assert!(upstream_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_host_header_rewritten_to_target() {
    let (upstream, upstream_requests) = spawn_upstream("200 OK", "upstream").await;
    let yaml = format!(
        r#"
services:
  s:
    host: foo.example.com
    redirect: "http://{}"
"#,
        upstream
    );
    let proxy = start_proxy(&yaml, no_docker()).await;

    let response = http_get(proxy, "foo.example.com", "/some/path?x=y", &[]).await;
    assert_eq!(response.status, 200);

    let requests = upstream_requests.lock().unwrap();
    let seen = requests[0].to_lowercase();
    assert!(seen.starts_with("get /some/path?x=y "), "{}", seen);
    assert!(seen.contains(&format!("host: {}", upstream)), "{}", seen);
}

#[tokio::test]
async fn test_acme_challenge_served_before_routing() {
    let addr = free_port().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    std::mem::forget(shutdown_tx);

    let challenges = Http01Challenges::new();
    challenges
        .set("token123".to_string(), "token123.thumbprint".to_string())
        .await;

    let server = ProxyServer::new(addr, Arc::new(HashMap::new()), shutdown_rx)
        .with_challenges(challenges);
    tokio::spawn(server.run());
    wait_for_port(addr).await;

    let response = http_get(
        addr,
        "anything.example.com",
        "/.well-known/acme-challenge/token123",
        &[],
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "token123.thumbprint");

    // Unknown tokens fall through to routing, which has no services.
    let response = http_get(
        addr,
        "anything.example.com",
        "/.well-known/acme-challenge/other",
        &[],
    )
    .await;
    assert_eq!(response.status, 404);
}
