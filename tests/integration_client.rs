use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use apireq::{Auth, Client, Error, Proxy, RetryPolicy};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    close: bool,
}

impl MockResponse {
    fn new(status: u16, headers: Vec<(impl Into<String>, impl Into<String>)>, body: impl Into<String>) -> Self {
        Self::new_bytes(status, headers, body.into().into_bytes())
    }

    fn new_bytes(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
            delay: Duration::ZERO,
            close: false,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

/// What the server does with one incoming request.
#[derive(Clone)]
enum MockBehavior {
    Respond(MockResponse),
    /// Read the request, then drop the socket without answering.
    Drop,
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(behaviors: Vec<MockBehavior>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let connections_clone = Arc::clone(&connections);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut behavior_index = 0;

            while behavior_index < behaviors.len() && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        connections_clone.fetch_add(1, Ordering::SeqCst);

                        // Serve consecutive requests on this connection until
                        // the behavior asks to close it or the client hangs up.
                        while behavior_index < behaviors.len() {
                            let request = match read_request(&mut stream) {
                                Ok(request) => request,
                                Err(_) => break,
                            };
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                            served_clone.fetch_add(1, Ordering::SeqCst);

                            let behavior = behaviors[behavior_index].clone();
                            behavior_index += 1;

                            match behavior {
                                MockBehavior::Drop => {
                                    let _ = stream.shutdown(std::net::Shutdown::Both);
                                    break;
                                }
                                MockBehavior::Respond(response) => {
                                    if !response.delay.is_zero() {
                                        thread::sleep(response.delay);
                                    }
                                    if write_response(&mut stream, &response).is_err() {
                                        break;
                                    }
                                    if response.close {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            connections,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A scripted proxy: accepts one `CONNECT` tunnel and, when granted, answers
/// the tunneled request itself.
struct MockProxy {
    port: u16,
    connect_target: Arc<Mutex<Option<String>>>,
    tunneled: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockProxy {
    fn start(grant: bool, response: MockResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock proxy");
        let port = listener.local_addr().expect("read proxy address").port();
        listener
            .set_nonblocking(true)
            .expect("set proxy listener nonblocking");

        let connect_target = Arc::new(Mutex::new(None));
        let tunneled = Arc::new(Mutex::new(Vec::new()));
        let connect_target_clone = Arc::clone(&connect_target);
        let tunneled_clone = Arc::clone(&tunneled);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let connect = match read_request(&mut stream) {
                            Ok(connect) => connect,
                            Err(_) => break,
                        };
                        if connect.method != "CONNECT" {
                            break;
                        }
                        *connect_target_clone.lock().expect("lock connect target") =
                            Some(connect.path.clone());

                        if !grant {
                            let _ = stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n");
                            break;
                        }
                        let _ = stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n");

                        if let Ok(request) = read_request(&mut stream) {
                            tunneled_clone
                                .lock()
                                .expect("lock tunneled requests")
                                .push(request);
                            let _ = write_response(&mut stream, &response);
                        }
                        break;
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            port,
            connect_target,
            tunneled,
            join: Some(join),
        }
    }

    fn connect_target(&self) -> Option<String> {
        self.connect_target
            .lock()
            .expect("lock connect target")
            .clone()
    }

    fn tunneled_requests(&self) -> Vec<CapturedRequest> {
        self.tunneled
            .lock()
            .expect("lock tunneled requests")
            .clone()
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            if raw.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed the connection",
                ));
            }
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    );
    if response.close {
        raw.push_str("Connection: close\r\n");
    }
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .expect("write gzip source bytes should succeed");
    encoder.finish().expect("finish gzip stream should succeed")
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn test_client(retries: u32) -> Client {
    Client::builder()
        .default_timeout(Duration::from_millis(300))
        .retry_policy(
            RetryPolicy::standard()
                .retries(retries)
                .base_backoff(Duration::from_millis(1))
                .max_backoff(Duration::from_millis(5)),
        )
        .build()
}

fn ok_response(body: &str) -> MockBehavior {
    MockBehavior::Respond(MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        body,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_request_is_answered_from_cache() {
    let server = MockServer::start(vec![ok_response("cached body")]);
    let client = test_client(0);

    let first = client
        .get(server.url("/items"))
        .send()
        .await
        .expect("first request should succeed")
        .expect("first request should produce a response");
    assert_eq!(first.text(), "cached body");

    let second = client
        .get(server.url("/items"))
        .send()
        .await
        .expect("second request should succeed")
        .expect("second request should produce a response");
    assert_eq!(second.text(), "cached body");

    // The second response came from the cache, not the wire.
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_opt_out_always_hits_the_network() {
    let server = MockServer::start(vec![ok_response("one"), ok_response("two")]);
    let client = test_client(0);

    for _ in 0..2 {
        client
            .get(server.url("/items"))
            .use_cache(false)
            .send()
            .await
            .expect("request should succeed")
            .expect("request should produce a response");
    }

    assert_eq!(server.served_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_failures_are_retried_until_success() {
    let server = MockServer::start(vec![
        MockBehavior::Drop,
        MockBehavior::Drop,
        ok_response("recovered"),
    ]);
    let client = test_client(2);

    let response = client
        .get(server.url("/flaky"))
        .send()
        .await
        .expect("request should succeed after retries")
        .expect("request should produce a response");

    assert_eq!(response.text(), "recovered");
    assert_eq!(server.served_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_transport_retries_yield_no_response() {
    let server = MockServer::start(vec![
        MockBehavior::Drop,
        MockBehavior::Drop,
        MockBehavior::Drop,
    ]);
    let client = test_client(2);

    let outcome = client
        .get(server.url("/down"))
        .send()
        .await
        .expect("transport exhaustion is not an error");

    assert!(outcome.is_none());
    assert_eq!(server.served_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_error_status_from_final_attempt_is_reported() {
    let busy = MockBehavior::Respond(MockResponse::new(
        500,
        Vec::<(String, String)>::new(),
        "backend exploded",
    ));
    let server = MockServer::start(vec![busy.clone(), busy.clone(), busy]);
    let client = test_client(2);

    let error = client
        .get(server.url("/broken"))
        .send()
        .await
        .expect_err("final 500 should surface as an error");

    match error {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, "backend exploded");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.served_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_error_status_carries_the_response_body() {
    let server = MockServer::start(vec![MockBehavior::Respond(MockResponse::new(
        404,
        vec![("Content-Type", "application/json")],
        r#"{"error":"missing"}"#,
    ))]);
    let client = test_client(0);

    let error = client
        .get(server.url("/nope"))
        .send()
        .await
        .expect_err("404 should surface as an error");

    match error {
        Error::HttpStatus {
            status,
            body,
            headers,
            ..
        } => {
            assert_eq!(status, 404);
            assert_eq!(body, r#"{"error":"missing"}"#);
            assert_eq!(
                headers.get("content-type").and_then(|v| v.to_str().ok()),
                Some("application/json")
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relative_redirects_are_followed_within_one_attempt() {
    let server = MockServer::start(vec![
        MockBehavior::Respond(MockResponse::new(
            301,
            vec![("Location", "/step2")],
            "moved",
        )),
        MockBehavior::Respond(MockResponse::new(302, vec![("Location", "/final")], "moved")),
        ok_response("arrived"),
    ]);
    let client = test_client(0);

    let response = client
        .get(server.url("/start"))
        .send()
        .await
        .expect("redirect chain should succeed")
        .expect("redirect chain should produce a response");

    assert_eq!(response.text(), "arrived");
    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].path, "/start");
    assert_eq!(requests[1].path, "/step2");
    assert_eq!(requests[2].path, "/final");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn absolute_redirects_may_switch_hosts() {
    let target = MockServer::start(vec![ok_response("other host")]);
    let origin = MockServer::start(vec![MockBehavior::Respond(MockResponse::new(
        302,
        vec![("Location", target.url("/landing"))],
        "moved",
    ))]);
    let client = test_client(0);

    let response = client
        .get(origin.url("/start"))
        .send()
        .await
        .expect("cross-host redirect should succeed")
        .expect("cross-host redirect should produce a response");

    assert_eq!(response.text(), "other host");
    assert_eq!(origin.served_count(), 1);
    assert_eq!(target.served_count(), 1);
    assert_eq!(target.requests()[0].path, "/landing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_loop_fails_once_the_hop_cap_is_hit() {
    let hop = MockBehavior::Respond(MockResponse::new(301, vec![("Location", "/loop")], "moved"));
    let server = MockServer::start(vec![hop.clone(), hop.clone(), hop]);
    let client = Client::builder()
        .default_timeout(Duration::from_millis(300))
        .retry_policy(RetryPolicy::disabled())
        .max_redirects(2)
        .build();

    let error = client
        .get(server.url("/loop"))
        .send()
        .await
        .expect_err("unbounded redirect loop should fail");

    match error {
        Error::RedirectLimitExceeded { max_redirects, .. } => assert_eq!(max_redirects, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.served_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_requests_reuse_one_pooled_connection() {
    let server = MockServer::start(vec![ok_response("one"), ok_response("two")]);
    let client = test_client(0);

    for expected in ["one", "two"] {
        let response = client
            .get(server.url("/pooled"))
            .use_cache(false)
            .send()
            .await
            .expect("request should succeed")
            .expect("request should produce a response");
        assert_eq!(response.text(), expected);
    }

    assert_eq!(server.served_count(), 2);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_connections_are_redialed_transparently() {
    let server = MockServer::start(vec![
        MockBehavior::Respond(
            MockResponse::new(200, vec![("Content-Type", "text/plain")], "one").closing(),
        ),
        ok_response("two"),
    ]);
    // One retry covers the race where the pooled connection only learns of
    // the server-side close after it has been handed out again.
    let client = test_client(1);

    for expected in ["one", "two"] {
        let response = client
            .get(server.url("/reopened"))
            .use_cache(false)
            .send()
            .await
            .expect("request should succeed")
            .expect("request should produce a response");
        assert_eq!(response.text(), expected);
    }

    assert_eq!(server.served_count(), 2);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gzip_bodies_are_decoded_and_framing_headers_dropped() {
    let body = gzip_bytes(b"hello gzip world");
    let server = MockServer::start(vec![MockBehavior::Respond(MockResponse::new_bytes(
        200,
        vec![
            ("Content-Type", "text/plain"),
            ("Content-Encoding", "gzip"),
        ],
        body,
    ))]);
    let client = test_client(0);

    let response = client
        .get(server.url("/compressed"))
        .send()
        .await
        .expect("gzip response should be decoded")
        .expect("gzip response should produce a response");

    assert_eq!(response.text(), "hello gzip world");
    assert!(!response.has_header("content-encoding"));
    assert_eq!(response.content_type(), "text/plain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_headers_carry_auth_json_and_user_agent() {
    let server = MockServer::start(vec![ok_response("created")]);
    let client = Client::builder()
        .default_timeout(Duration::from_millis(300))
        .retry_policy(RetryPolicy::disabled())
        .user_agent("apireq-tests/1.0")
        .try_default_header("x-api-key", "k-123")
        .expect("default header should parse")
        .build();

    client
        .post(server.url("/items"))
        .auth(Auth::basic("alice", "secret"))
        .json(&json!({ "name": "demo" }))
        .expect("json payload should serialize")
        .send()
        .await
        .expect("request should succeed")
        .expect("request should produce a response");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        // base64("alice:secret")
        Some("Basic YWxpY2U6c2VjcmV0")
    );
    assert_eq!(
        request.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(
        request.headers.get("user-agent").map(String::as_str),
        Some("apireq-tests/1.0")
    );
    assert_eq!(
        request.headers.get("x-api-key").map(String::as_str),
        Some("k-123")
    );
    assert_eq!(request.body, br#"{"name":"demo"}"#.to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_pairs_land_in_the_request_target() {
    let server = MockServer::start(vec![ok_response("found")]);
    let client = test_client(0);

    client
        .get(server.url("/search?scope=all"))
        .query_pair("q", "rust http")
        .send()
        .await
        .expect("request should succeed")
        .expect("request should produce a response");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let (path, query_text) = requests[0]
        .path
        .split_once('?')
        .expect("request target should carry a query");
    assert_eq!(path, "/search");
    let query: BTreeMap<String, String> = url::form_urlencoded::parse(query_text.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    assert_eq!(query.get("scope"), Some(&"all".to_owned()));
    assert_eq!(query.get("q"), Some(&"rust http".to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_responses_time_out_as_transport_failures() {
    let server = MockServer::start(vec![MockBehavior::Respond(
        MockResponse::new(200, vec![("Content-Type", "text/plain")], "late")
            .delayed(Duration::from_millis(150)),
    )]);
    let client = Client::builder()
        .default_timeout(Duration::from_millis(20))
        .retry_policy(RetryPolicy::disabled())
        .build();

    let outcome = client
        .get(server.url("/slow"))
        .send()
        .await
        .expect("timeout with no retries left is not an error");

    assert!(outcome.is_none());
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_urls_fail_fast_without_an_attempt() {
    let client = test_client(2);

    let error = client
        .get("not a url at all")
        .send()
        .await
        .expect_err("garbage url should be rejected");
    assert!(matches!(error, Error::InvalidUrl { .. }));

    let error = client
        .get("ftp://files.example.com/archive")
        .send()
        .await
        .expect_err("unsupported scheme should be rejected");
    assert!(matches!(error, Error::InvalidUrl { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_cache_forces_a_fresh_fetch() {
    let server = MockServer::start(vec![ok_response("first"), ok_response("second")]);
    let client = test_client(0);

    let first = client
        .get(server.url("/items"))
        .send()
        .await
        .expect("first request should succeed")
        .expect("first request should produce a response");
    assert_eq!(first.text(), "first");

    client.clear_cache();

    let second = client
        .get(server.url("/items"))
        .send()
        .await
        .expect("second request should succeed")
        .expect("second request should produce a response");
    assert_eq!(second.text(), "second");
    assert_eq!(server.served_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_bodies_abort_without_retrying() {
    let server = MockServer::start(vec![MockBehavior::Respond(MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        "0123456789abcdef",
    ))]);
    let client = Client::builder()
        .default_timeout(Duration::from_millis(300))
        .retry_policy(
            RetryPolicy::standard()
                .retries(2)
                .base_backoff(Duration::from_millis(1)),
        )
        .max_response_body_bytes(4)
        .build();

    let error = client
        .get(server.url("/large"))
        .send()
        .await
        .expect_err("oversized body should be an error");

    match error {
        Error::ResponseBodyTooLarge {
            limit_bytes,
            actual_bytes,
            ..
        } => {
            assert_eq!(limit_bytes, 4);
            assert!(actual_bytes > limit_bytes);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Fatal errors must not consume the retry budget.
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_can_be_dispatched_from_spawned_tasks() {
    let servers: Vec<MockServer> = (0..2)
        .map(|_| MockServer::start(vec![ok_response("spawned")]))
        .collect();
    let client = Arc::new(test_client(0));

    let mut handles = Vec::new();
    for server in &servers {
        let client = Arc::clone(&client);
        let url = server.url("/task");
        handles.push(tokio::spawn(async move { client.get(url).send().await }));
    }

    for handle in handles {
        let response = handle
            .await
            .expect("spawned task should not panic")
            .expect("spawned request should succeed")
            .expect("spawned request should produce a response");
        assert_eq!(response.text(), "spawned");
    }
    for server in &servers {
        assert_eq!(server.served_count(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxied_requests_tunnel_through_connect() {
    let proxy = MockProxy::start(
        true,
        MockResponse::new(200, vec![("Content-Type", "text/plain")], "via proxy"),
    );
    let client = Client::builder()
        .default_timeout(Duration::from_millis(300))
        .retry_policy(RetryPolicy::disabled())
        .proxy(Proxy::new("127.0.0.1", proxy.port))
        .build();

    let response = client
        .get("http://upstream.test:8080/resource")
        .send()
        .await
        .expect("proxied request should succeed")
        .expect("proxied request should produce a response");

    assert_eq!(response.text(), "via proxy");
    assert_eq!(proxy.connect_target().as_deref(), Some("upstream.test:8080"));
    let tunneled = proxy.tunneled_requests();
    assert_eq!(tunneled.len(), 1);
    assert_eq!(tunneled[0].method, "GET");
    assert_eq!(tunneled[0].path, "/resource");
    assert_eq!(
        tunneled[0].headers.get("host").map(String::as_str),
        Some("upstream.test:8080")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connect_tunnel_is_a_transport_failure() {
    let proxy = MockProxy::start(
        false,
        MockResponse::new(200, Vec::<(String, String)>::new(), "unused"),
    );
    let client = Client::builder()
        .default_timeout(Duration::from_millis(300))
        .retry_policy(RetryPolicy::disabled())
        .proxy(Proxy::new("127.0.0.1", proxy.port))
        .build();

    let outcome = client
        .get("http://upstream.test/resource")
        .send()
        .await
        .expect("refused tunnel with no retries left is not an error");

    assert!(outcome.is_none());
    assert_eq!(proxy.connect_target().as_deref(), Some("upstream.test:80"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_hops_share_one_attempt_deadline() {
    let server = MockServer::start(vec![
        MockBehavior::Respond(
            MockResponse::new(301, vec![("Location", "/hop2")], "moved")
                .delayed(Duration::from_millis(80)),
        ),
        MockBehavior::Respond(
            MockResponse::new(301, vec![("Location", "/hop3")], "moved")
                .delayed(Duration::from_millis(80)),
        ),
        ok_response("late"),
    ]);
    let client = Client::builder()
        .default_timeout(Duration::from_millis(120))
        .retry_policy(RetryPolicy::disabled())
        .build();

    let outcome = client
        .get(server.url("/hop1"))
        .send()
        .await
        .expect("attempt deadline overrun is not an error");

    // Each hop fits the timeout on its own; together they cannot.
    assert!(outcome.is_none());
    assert!(server.served_count() < 3);
}
