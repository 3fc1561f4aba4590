use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ws_gate::errors::PrefixError;
use ws_gate::http::auth::{answer_challenge, Credentials};
use ws_gate::http::response::HttpResponse;
use ws_gate::{AuthScheme, HttpListener};

const WAIT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct RawResponse {
    status: u16,
    head: String,
    body: String,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<String> {
        let lower = format!("{}:", name.to_lowercase());
        self.head
            .lines()
            .find(|l| l.to_lowercase().starts_with(&lower))
            .map(|l| l.split_once(':').unwrap().1.trim().to_string())
    }
}

async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(WAIT, stream.read(&mut byte)).await.unwrap().unwrap();
        assert!(n > 0, "connection closed inside head");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let content_length: usize = head
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split_once(':').unwrap().1.trim().parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        timeout(WAIT, stream.read_exact(&mut body))
            .await
            .unwrap()
            .unwrap();
    }
    RawResponse {
        status,
        head,
        body: String::from_utf8_lossy(&body).to_string(),
    }
}

/// serve every context with a 200 whose body names the listener and
/// the reuse counter
fn start_plain(listener: &HttpListener, tag: &'static str) {
    let accept = listener.clone();
    tokio::spawn(async move {
        while let Ok(context) = accept.get_context().await {
            tokio::spawn(async move {
                let reuses = context.reuses();
                let who = context
                    .principal()
                    .map(|p| p.username.clone())
                    .unwrap_or_default();
                let mut response = HttpResponse::new(200);
                response.write(format!("{tag}:{reuses}:{who}").as_bytes());
                let _ = context.respond_with(response).await;
            });
        }
    });
}

#[tokio::test]
async fn routes_by_longest_prefix_and_retries_missing_slash() {
    let port = free_port();
    let outer = HttpListener::new();
    outer
        .add_prefix(&format!("http://127.0.0.1:{port}/a/"))
        .unwrap();
    outer.start().unwrap();
    start_plain(&outer, "outer");

    let inner = HttpListener::new();
    inner
        .add_prefix(&format!("http://127.0.0.1:{port}/a/b/"))
        .unwrap();
    inner.start().unwrap();
    start_plain(&inner, "inner");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!("GET /a/b/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 200);
    assert!(response.body.starts_with("inner:"), "{}", response.body);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!("GET /a/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.body.starts_with("outer:"), "{}", response.body);

    // "/a/b" without the trailing slash is retried with one appended
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!("GET /a/b HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.body.starts_with("inner:"), "{}", response.body);

    // nothing claims /other
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!("GET /other HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 404);

    outer.stop();
    inner.stop();
}

#[tokio::test]
async fn keep_alive_reuses_the_connection() {
    let port = free_port();
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/"))
        .unwrap();
    listener.start().unwrap();
    start_plain(&listener, "srv");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let first = read_response(&mut stream).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("Connection").as_deref(), Some("keep-alive"));
    assert!(first.body.starts_with("srv:0:"), "{}", first.body);

    // same socket, second request, incremented reuse counter
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let second = read_response(&mut stream).await;
    assert_eq!(second.status, 200);
    assert!(second.body.starts_with("srv:1:"), "{}", second.body);

    listener.stop();
}

#[tokio::test]
async fn expect_100_continue_interim_response() {
    let port = free_port();
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/upload/"))
        .unwrap();
    listener.start().unwrap();
    let accept = listener.clone();
    tokio::spawn(async move {
        while let Ok(mut context) = accept.get_context().await {
            tokio::spawn(async move {
                let body = context.read_body().await.unwrap();
                let mut response = HttpResponse::new(200);
                response.write(&body);
                let _ = context.respond_with(response).await;
            });
        }
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!(
                "POST /upload/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Length: 7\r\n\
                 Expect: 100-continue\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // the interim response arrives before any body byte is sent
    let mut interim = [0u8; 25];
    timeout(WAIT, stream.read_exact(&mut interim))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"payload").await.unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "payload");
    listener.stop();
}

#[tokio::test]
async fn chunked_request_body_is_decoded() {
    let port = free_port();
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/upload/"))
        .unwrap();
    listener.start().unwrap();
    let accept = listener.clone();
    tokio::spawn(async move {
        while let Ok(mut context) = accept.get_context().await {
            tokio::spawn(async move {
                let body = context.read_body().await.unwrap();
                let mut response = HttpResponse::new(200);
                response.write(&body);
                let _ = context.respond_with(response).await;
            });
        }
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!(
                "POST /upload/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
                 Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
                 5\r\nhello\r\n6;x=y\r\n world\r\n0\r\nTrailer: ignored\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hello world");
    listener.stop();
}

#[tokio::test]
async fn digest_challenge_then_access() {
    let port = free_port();
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/secure/"))
        .unwrap();
    listener.set_realm("testrealm@host.com");
    listener.set_auth_scheme(AuthScheme::Digest);
    listener.set_credentials(|username| {
        (username == "Mufasa").then(|| Credentials::new("Mufasa", "Circle Of Life"))
    });
    listener.start().unwrap();
    start_plain(&listener, "secure");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!("GET /secure/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let challenge_response = read_response(&mut stream).await;
    assert_eq!(challenge_response.status, 401);
    let challenge = challenge_response.header("WWW-Authenticate").unwrap();
    assert!(challenge.starts_with("Digest "), "{challenge}");
    assert!(challenge.contains("realm=\"testrealm@host.com\""));

    let authorization = answer_challenge(
        &challenge,
        &Credentials::new("Mufasa", "Circle Of Life"),
        "GET",
        "/secure/",
        1,
    )
    .unwrap();
    // the 401 kept the connection alive, reuse it
    stream
        .write_all(
            format!(
                "GET /secure/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
                 Authorization: {authorization}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let granted = read_response(&mut stream).await;
    assert_eq!(granted.status, 200);
    assert!(granted.body.ends_with(":Mufasa"), "{}", granted.body);
    listener.stop();
}

#[tokio::test]
async fn basic_auth_and_forbidden_scheme() {
    let port = free_port();
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/basic/"))
        .unwrap();
    listener.set_realm("b");
    listener.set_auth_scheme(AuthScheme::Basic);
    listener.set_credentials(|username| {
        (username == "alice").then(|| Credentials::new("alice", "secret"))
    });
    listener.start().unwrap();
    start_plain(&listener, "basic");

    // wrong password challenges again
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!(
                "GET /basic/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
                 Authorization: Basic YWxpY2U6d3Jvbmc=\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let refused = read_response(&mut stream).await;
    assert_eq!(refused.status, 401);

    // right password passes
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!(
                "GET /basic/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
                 Authorization: Basic YWxpY2U6c2VjcmV0\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let granted = read_response(&mut stream).await;
    assert_eq!(granted.status, 200);
    assert!(granted.body.ends_with(":alice"), "{}", granted.body);

    // the None scheme refuses everyone with 403
    listener.set_auth_scheme(AuthScheme::None);
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!("GET /basic/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let forbidden = read_response(&mut stream).await;
    assert_eq!(forbidden.status, 403);
    listener.stop();
}

#[tokio::test]
async fn conflicting_prefix_is_refused() {
    let port = free_port();
    let first = HttpListener::new();
    first
        .add_prefix(&format!("http://127.0.0.1:{port}/shared/"))
        .unwrap();
    first.start().unwrap();

    let second = HttpListener::new();
    second
        .add_prefix(&format!("http://127.0.0.1:{port}/shared/"))
        .unwrap();
    let err = second.start().unwrap_err();
    assert!(matches!(err, PrefixError::PrefixInUse(_)), "{err}");

    // a different path on the same port is fine
    let third = HttpListener::new();
    third
        .add_prefix(&format!("http://127.0.0.1:{port}/other/"))
        .unwrap();
    third.start().unwrap();

    first.stop();
    third.stop();
}

#[tokio::test]
async fn bad_requests_get_400_or_411() {
    let port = free_port();
    let listener = HttpListener::new();
    listener
        .add_prefix(&format!("http://127.0.0.1:{port}/"))
        .unwrap();
    listener.start().unwrap();
    start_plain(&listener, "srv");

    // HTTP/1.1 without Host
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 400);

    // POST without a length
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(format!("POST / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 411);

    // unknown transfer coding
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!(
                "POST / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nTransfer-Encoding: gzip\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 501);
    listener.stop();
}
