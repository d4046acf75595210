//! End-to-end tests against local mock HTTP servers, covering the scenarios
//! from the crawler's testable-properties list: a happy GET, a redirect
//! chain, a robots.txt disallow, a read-header timeout, and read-limit
//! truncation across a reused pooled connection.

use std::sync::Arc;
use swarmfetch::dns::Resolver;
use swarmfetch::semaphore::KeyedSemaphoreMap;
use swarmfetch::transport::{RequestOptions, Transport};
use swarmfetch::worker::{Worker, WorkerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_mock_server(responses: Vec<(&'static str, &'static str)>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let responses = responses.clone();
            tokio::spawn(async move {
                loop {
                    let mut buf = [0u8; 4096];
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("/");

                    let body = responses
                        .iter()
                        .find(|(p, _)| *p == path)
                        .map(|(_, b)| *b)
                        .unwrap_or("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");

                    if stream.write_all(body.as_bytes()).await.is_err() {
                        return;
                    }
                    if body.contains("Connection: close") {
                        return;
                    }
                }
            });
        }
    });

    addr
}

fn build_worker(config: WorkerConfig) -> Worker {
    let resolver = Arc::new(Resolver::new("127.0.0.1:1".parse().unwrap(), 2));
    let transport = Arc::new(Transport::new(resolver, 2, false));
    let host_limits = Arc::new(KeyedSemaphoreMap::new());
    Worker::new(transport, host_limits, config)
}

fn default_config() -> WorkerConfig {
    WorkerConfig {
        host_concurrency: 4,
        follow_redirects: 10,
        skip_robots: true,
        skip_body: false,
        user_agent: "TestBot/1 (+http://example.invalid)".to_string(),
        request_options: RequestOptions {
            connect_timeout: std::time::Duration::from_secs(2),
            read_timeout: std::time::Duration::from_secs(2),
            write_timeout: std::time::Duration::from_secs(2),
            read_limit: 1024 * 1024,
            keepalive_timeout: std::time::Duration::from_secs(5),
            insecure_skip_verify: false,
        },
        total_timeout: std::time::Duration::from_secs(5),
    }
}

#[tokio::test]
async fn happy_get_returns_body() {
    let addr = spawn_mock_server(vec![(
        "/ok",
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    )])
    .await;

    let worker = build_worker(default_config());
    let url = url::Url::parse(&format!("http://{addr}/ok")).unwrap();
    let result = worker.process(url).await;

    assert!(result.success, "status={} body={:?}", result.status, result.body);
    assert_eq!(result.status_code, 200);
    assert_eq!(result.body, b"hello");
    assert_eq!(result.length, 5);
}

#[tokio::test]
async fn redirect_chain_is_followed() {
    let addr = spawn_mock_server(vec![
        (
            "/a",
            "HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ),
        (
            "/b",
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        ),
    ])
    .await;

    let worker = build_worker(default_config());
    let url = url::Url::parse(&format!("http://{addr}/a")).unwrap();
    let result = worker.process(url).await;

    assert!(result.success);
    assert_eq!(result.status_code, 200);
    assert_eq!(result.body, b"ok");
    assert!(result.url.path().ends_with("/b"));
}

#[tokio::test]
async fn robots_disallow_blocks_fetch() {
    let addr = spawn_mock_server(vec![
        (
            "/robots.txt",
            "HTTP/1.1 200 OK\r\nContent-Length: 25\r\nConnection: close\r\n\r\nUser-agent: *\nDisallow: /",
        ),
        (
            "/secret",
            "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nleaked",
        ),
    ])
    .await;

    let mut config = default_config();
    config.skip_robots = false;
    let worker = build_worker(config);
    let url = url::Url::parse(&format!("http://{addr}/secret")).unwrap();
    let result = worker.process(url).await;

    assert!(!result.success);
    assert_eq!(result.status, "Robots disallow");
}

#[tokio::test]
async fn read_header_timeout_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            // Accepts the request but never writes a response, forcing the
            // client's read timeout to fire.
            std::future::pending::<()>().await;
        }
    });

    tokio::time::pause();

    let mut config = default_config();
    config.request_options.read_timeout = std::time::Duration::from_millis(5);
    config.total_timeout = std::time::Duration::from_secs(5);
    let worker = build_worker(config);

    let url = url::Url::parse(&format!("http://{addr}/stall")).unwrap();
    let result = worker.process(url).await;

    assert!(!result.success);
    assert!(
        result.status.contains("ReadResponse timeout"),
        "status={}",
        result.status
    );
}

#[tokio::test]
async fn read_limit_truncates_body_and_connection_is_reused() {
    let body: String = "x".repeat(4000);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response: &'static str = Box::leak(response.into_boxed_str());
    let addr = spawn_mock_server(vec![("/big", response)]).await;

    let mut config = default_config();
    config.request_options.read_limit = 100;
    let worker = build_worker(config);
    let url = url::Url::parse(&format!("http://{addr}/big")).unwrap();

    let mut uses = Vec::new();
    for _ in 0..5 {
        let result = worker.process(url.clone()).await;
        assert!(result.success, "status={}", result.status);
        assert!(result.body.len() as u64 <= 100, "body len={}", result.body.len());
        uses.push(result.stat.connection_use);
    }

    assert_eq!(uses, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn connect_timeout_fails_fast() {
    // 192.0.2.0/24 is reserved (TEST-NET-1) and never routed: the connect
    // attempt should time out rather than succeed or hang.
    let worker = {
        let mut config = default_config();
        config.request_options.connect_timeout = std::time::Duration::from_millis(50);
        config.total_timeout = std::time::Duration::from_millis(500);
        build_worker(config)
    };

    let url = url::Url::parse("http://192.0.2.1:81/").unwrap();
    let start = std::time::Instant::now();
    let result = worker.process(url).await;

    assert!(!result.success);
    assert!(start.elapsed() < std::time::Duration::from_secs(1));
}
