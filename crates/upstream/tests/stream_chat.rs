//! Adapter integration tests against a canned in-process HTTP server.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use cf_domain::config::Config;
use cf_domain::error::Error;
use cf_domain::message::{Message, Role};
use cf_upstream::{AiProvider, DifyProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canned HTTP server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn sse_ok(body: &str) -> String {
    http_response("200 OK", "text/event-stream", body)
}

/// Serve one canned response per incoming connection, capturing each
/// request body.
async fn spawn_server(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let captured = Arc::new(Mutex::new(Vec::new()));

    let server_captured = captured.clone();
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let body = read_http_request(&mut sock).await;
            server_captured.lock().push(body);
            let _ = sock.write_all(response.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });

    (base_url, captured)
}

async fn read_http_request(sock: &mut tokio::net::TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            let mut body = buf[pos + 4..].to_vec();
            while body.len() < content_length {
                match sock.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => body.extend_from_slice(&tmp[..n]),
                }
            }
            return String::from_utf8_lossy(&body).to_string();
        }
        match sock.read(&mut tmp).await {
            Ok(0) | Err(_) => return String::new(),
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn provider_for(base_url: &str, max_retries: u32) -> DifyProvider {
    DifyProvider::from_config(&Config {
        ai_api_url: base_url.to_owned(),
        ai_api_key: "test-key".into(),
        ai_max_retries: max_retries,
        ai_timeout: 10,
        ..Config::default()
    })
    .unwrap()
}

fn user_turn(text: &str) -> Vec<Message> {
    vec![Message::new(Role::User, text)
        .with_meta("session_id", "S1")
        .with_meta("user_id", "U1")]
}

async fn collect(mut rx: mpsc::Receiver<String>) -> String {
    let mut answer = String::new();
    while let Some(token) = rx.recv().await {
        answer.push_str(&token);
    }
    answer
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn streams_tokens_and_captures_conversation() {
    let sse = "data: {\"event\":\"message\",\"conversation_id\":\"C1\",\"data\":{\"text\":\"Hi\"}}\n\
               data: {\"event\":\"message\",\"data\":{\"text\":\" there\"}}\n\
               data: {\"event\":\"message_end\"}\n";
    let (base_url, captured) = spawn_server(vec![sse_ok(sse)]).await;
    let provider = provider_for(&base_url, 0);

    let (tx, rx) = mpsc::channel(10);
    provider.stream_chat(&user_turn("hello"), tx).await.unwrap();

    // Emission order is preserved; batching may merge fragments, so the
    // concatenation is what is asserted.
    assert_eq!(collect(rx).await, "Hi there");
    assert_eq!(provider.conversation_id("U1").as_deref(), Some("C1"));

    let requests = captured.lock().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("\"query\":\"hello\""));
    assert!(requests[0].contains("\"conversation_id\":\"\""));
    assert!(requests[0].contains("\"user\":\"U1\""));
    assert!(requests[0].contains("\"response_mode\":\"streaming\""));
}

#[tokio::test]
async fn stale_conversation_is_cleared_and_reissued_once() {
    let stale = http_response(
        "400 Bad Request",
        "application/json",
        r#"{"code":404,"status":400,"message":"Conversation Not Exists"}"#,
    );
    let fresh = sse_ok(
        "data: {\"event\":\"message\",\"conversation_id\":\"C2\",\"data\":{\"text\":\"rebuilt\"}}\n\
         data: {\"event\":\"message_end\"}\n",
    );
    let (base_url, captured) = spawn_server(vec![stale, fresh]).await;
    let provider = provider_for(&base_url, 0);
    provider.conversations().store("U1", "C1");

    let (tx, rx) = mpsc::channel(10);
    provider.stream_chat(&user_turn("hello"), tx).await.unwrap();

    assert_eq!(collect(rx).await, "rebuilt");
    // The stale handle was replaced by the newly-returned one.
    assert_eq!(provider.conversation_id("U1").as_deref(), Some("C2"));

    let requests = captured.lock().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("\"conversation_id\":\"C1\""));
    assert!(requests[1].contains("\"conversation_id\":\"\""));
}

#[tokio::test]
async fn client_error_fails_without_retry() {
    let (base_url, captured) =
        spawn_server(vec![http_response("400 Bad Request", "application/json", "nope")]).await;
    let provider = provider_for(&base_url, 3);

    let (tx, _rx) = mpsc::channel(10);
    let err = provider.stream_chat(&user_turn("hello"), tx).await.unwrap_err();

    assert!(matches!(err, Error::InvalidResponse(_)));
    assert_eq!(captured.lock().len(), 1);
}

#[tokio::test]
async fn server_error_retries_within_budget() {
    let boom = http_response("502 Bad Gateway", "text/plain", "downstream sad");
    let fine = sse_ok(
        "data: {\"event\":\"message\",\"data\":{\"text\":\"ok now\"}}\n\
         data: {\"event\":\"message_end\"}\n",
    );
    let (base_url, captured) = spawn_server(vec![boom, fine]).await;
    let provider = provider_for(&base_url, 1);

    let (tx, rx) = mpsc::channel(10);
    provider.stream_chat(&user_turn("hello"), tx).await.unwrap();

    assert_eq!(collect(rx).await, "ok now");
    assert_eq!(captured.lock().len(), 2);
}

#[tokio::test]
async fn done_sentinel_ends_stream_cleanly() {
    let (base_url, _) = spawn_server(vec![sse_ok("data: [DONE]\n")]).await;
    let provider = provider_for(&base_url, 0);

    let (tx, rx) = mpsc::channel(10);
    provider.stream_chat(&user_turn("hello"), tx).await.unwrap();
    assert_eq!(collect(rx).await, "");
}

#[tokio::test]
async fn upstream_error_event_is_permanent() {
    let sse = sse_ok(
        "data: {\"event\":\"error\",\"data\":{\"error_code\":\"E9\",\"error\":\"model offline\"}}\n",
    );
    let (base_url, captured) = spawn_server(vec![sse]).await;
    let provider = provider_for(&base_url, 3);

    let (tx, _rx) = mpsc::channel(10);
    let err = provider.stream_chat(&user_turn("hello"), tx).await.unwrap_err();

    assert!(matches!(err, Error::InvalidResponse(_)));
    assert!(err.to_string().contains("E9"));
    // Permanent failures never burn the retry budget.
    assert_eq!(captured.lock().len(), 1);
}

#[tokio::test]
async fn history_rides_in_inputs_as_json_string() {
    let (base_url, captured) = spawn_server(vec![sse_ok("data: {\"event\":\"message_end\"}\n")]).await;
    let provider = provider_for(&base_url, 0);

    let messages = vec![
        Message::new(Role::User, "earlier question"),
        Message::new(Role::Assistant, "earlier answer"),
        Message::new(Role::User, "follow-up")
            .with_meta("session_id", "S1")
            .with_meta("user_id", "U1"),
    ];
    let (tx, _rx) = mpsc::channel(10);
    provider.stream_chat(&messages, tx).await.unwrap();

    let requests = captured.lock().clone();
    assert!(requests[0].contains("earlier question"));
    assert!(requests[0].contains("\"query\":\"follow-up\""));

    // Give the server task a beat to finish accepting (nothing else to
    // assert; it just must not have seen a second request).
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(requests.len(), 1);
}
