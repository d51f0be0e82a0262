//! End-to-end tests of `POST /api/generate` against a mock completion API.

use std::sync::{Arc, Mutex};

use pagecast::config::Config;
use pagecast::fence::FenceState;
use pagecast::session::Session;
use pagecast::web::{read_request, remote_tokens, serve_on, AppState, HttpRequest};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

struct MockUpstream {
    url: String,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockUpstream {
    fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_body(&self) -> Value {
        let requests = self.requests.lock().unwrap();
        serde_json::from_slice(&requests.last().expect("request").body).expect("json body")
    }

    fn last_header(&self, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests.last().and_then(|r| r.header(name).map(str::to_string))
    }
}

/// Answers every connection with `status` and `body`, recording requests.
async fn mock_upstream(status: u16, body: String) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            if let Ok(Some(request)) = read_request(&mut stream).await {
                seen.lock().unwrap().push(request);
            }
            let head = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(body.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    MockUpstream {
        url: format!("http://{addr}/v1/chat/completions"),
        requests,
    }
}

fn sse(tokens: &[&str]) -> String {
    let mut body = String::new();
    body.push_str("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
    for token in tokens {
        let payload = json!({"choices":[{"delta":{"content":token}}]});
        body.push_str(&format!("data: {payload}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn start_server(config: Config) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(config).unwrap());
    tokio::spawn(serve_on(listener, state));
    format!("http://{addr}")
}

fn config_for(upstream: &MockUpstream) -> Config {
    let mut config = Config::default();
    config.upstream.endpoint = upstream.url.clone();
    config
}

async fn post(base: &str, body: Value) -> (u16, String, String) {
    let response = reqwest::Client::new()
        .post(format!("{base}/api/generate"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (status, content_type, response.text().await.unwrap())
}

#[tokio::test]
async fn test_missing_prompt_makes_no_upstream_call() {
    let upstream = mock_upstream(200, sse(&["x"])).await;
    let base = start_server(config_for(&upstream)).await;

    let (status, content_type, body) = post(&base, json!({"api_key": "sk-test"})).await;
    assert_eq!(status, 400);
    assert!(content_type.starts_with("text/plain"));
    assert_eq!(body, "No prompt in the request");
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn test_streams_plain_tokens() {
    let upstream = mock_upstream(200, sse(&["\n", "Hello", " world", "\n```"])).await;
    let base = start_server(config_for(&upstream)).await;

    let (status, content_type, body) = post(&base, json!({"prompt": "a page", "api_key": "sk-test"})).await;
    assert_eq!(status, 200);
    assert_eq!(content_type, "text/plain; charset=utf-8");
    assert_eq!(body, "Hello world\n```");

    assert_eq!(upstream.hits(), 1);
    assert_eq!(upstream.last_header("authorization").as_deref(), Some("Bearer sk-test"));
    let sent = upstream.last_body();
    assert_eq!(sent["model"], "gpt-3.5-turbo");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["n"], 1);
    assert_eq!(sent["max_tokens"], 200);
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][1]["content"], "a page");
}

#[tokio::test]
async fn test_body_is_chunked() {
    let upstream = mock_upstream(200, sse(&["<p>", "hi</p>"])).await;
    let base = start_server(config_for(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/generate"))
        .json(&json!({"prompt": "a page"}))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("transfer-encoding").and_then(|v| v.to_str().ok()),
        Some("chunked")
    );
    assert!(response.headers().get("content-length").is_none());
    assert_eq!(response.text().await.unwrap(), "<p>hi</p>");
}

/// Two content records, then a record cut off mid-payload.
fn cut_off_sse() -> String {
    let mut body = sse(&["```html\n<p>", "hi"]);
    body.truncate(body.len() - "data: [DONE]\n\n".len());
    body.push_str("data: {\"choices\":[{\"delta\":{\"cont");
    body
}

#[tokio::test]
async fn test_upstream_cut_off_leaves_body_unterminated() {
    let upstream = mock_upstream(200, cut_off_sse()).await;
    let base = start_server(config_for(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/generate"))
        .json(&json!({"prompt": "a page"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text().await.is_err());
}

#[tokio::test]
async fn test_remote_session_reports_cut_off_stream() {
    let upstream = mock_upstream(200, cut_off_sse()).await;
    let base = start_server(config_for(&upstream)).await;

    let tokens = remote_tokens(&base, "a page", None).await.unwrap();
    let outcome = Session::new(Config::default().extract).drive(tokens).await.unwrap();
    assert!(outcome.truncated);
    assert!(!outcome.extraction.complete);
    assert_eq!(outcome.extraction.state, FenceState::InsideFence);
    assert_eq!(outcome.extraction.content, "<p>hi");
}

#[tokio::test]
async fn test_remote_session_clean_stream() {
    let upstream = mock_upstream(200, sse(&["```html\n<p>", "hi</p>\n", "```"])).await;
    let base = start_server(config_for(&upstream)).await;

    let tokens = remote_tokens(&base, "a page", Some("sk-test")).await.unwrap();
    let outcome = Session::new(Config::default().extract).drive(tokens).await.unwrap();
    assert!(!outcome.truncated);
    assert!(outcome.extraction.complete);
    assert_eq!(outcome.extraction.content, "<p>hi</p>\n");
    assert_eq!(upstream.last_header("authorization").as_deref(), Some("Bearer sk-test"));
}

#[tokio::test]
async fn test_legacy_credential_split() {
    let upstream = mock_upstream(200, sse(&["ok"])).await;
    let base = start_server(config_for(&upstream)).await;

    let (status, _, body) = post(&base, json!({"prompt": "a todo app%%sk-legacy"})).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");
    assert_eq!(upstream.last_header("authorization").as_deref(), Some("Bearer sk-legacy"));
    assert_eq!(upstream.last_body()["messages"][1]["content"], "a todo app");
}

#[tokio::test]
async fn test_configured_key_is_fallback() {
    let upstream = mock_upstream(200, sse(&["ok"])).await;
    let mut config = config_for(&upstream);
    config.upstream.api_key = Some("sk-config".to_string());
    let base = start_server(config).await;

    let (status, _, _) = post(&base, json!({"prompt": "hello"})).await;
    assert_eq!(status, 200);
    assert_eq!(upstream.last_header("authorization").as_deref(), Some("Bearer sk-config"));
}

#[tokio::test]
async fn test_upstream_rejection_is_502() {
    let upstream = mock_upstream(401, r#"{"error":{"message":"bad key"}}"#.to_string()).await;
    let base = start_server(config_for(&upstream)).await;

    let (status, content_type, body) = post(&base, json!({"prompt": "hello", "api_key": "sk-bad"})).await;
    assert_eq!(status, 502);
    assert!(content_type.starts_with("text/plain"));
    assert!(body.contains("401"));
    assert!(body.contains("bad key"));
}

#[tokio::test]
async fn test_unreachable_upstream_is_502() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let mut config = Config::default();
    config.upstream.endpoint = format!("http://{addr}/v1/chat/completions");
    let base = start_server(config).await;

    let (status, _, _) = post(&base, json!({"prompt": "hello"})).await;
    assert_eq!(status, 502);
}

#[tokio::test]
async fn test_malformed_first_record_is_502() {
    let upstream = mock_upstream(200, "data: <html>oops</html>\n\n".to_string()).await;
    let base = start_server(config_for(&upstream)).await;

    let (status, _, body) = post(&base, json!({"prompt": "hello"})).await;
    assert_eq!(status, 502);
    assert!(body.contains("record #1"));
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let upstream = mock_upstream(200, sse(&[])).await;
    let base = start_server(config_for(&upstream)).await;

    let response = reqwest::get(format!("{base}/nope")).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let response = reqwest::get(format!("{base}/api/generate")).await.unwrap();
    assert_eq!(response.status().as_u16(), 405);
    assert_eq!(upstream.hits(), 0);
}
