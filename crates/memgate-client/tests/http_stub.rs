use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use memgate_client::{
    build_memory_backend, AddMemoryRequest, ClientError, MemoryApiConfig, MemoryScope, Message,
    SearchRequest,
};
use serde_json::{json, Value};

#[derive(Debug)]
struct Seen {
    method: String,
    target: String,
    authorization: Option<String>,
    body: Value,
}

/// Serves `responses` in order, one connection each, and reports what it saw.
fn spawn_stub(responses: Vec<(u16, Value)>) -> (String, mpsc::Receiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
    let addr = format!("http://{}", listener.local_addr().expect("addr"));
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for (status, response) in responses {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("request line");
            let mut parts = line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();
            let mut content_length = 0usize;
            let mut authorization = None;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).expect("header");
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                    if name.eq_ignore_ascii_case("authorization") {
                        authorization = Some(value.trim().to_string());
                    }
                }
            }
            let mut raw = vec![0_u8; content_length];
            reader.read_exact(&mut raw).expect("body");
            let body = serde_json::from_slice(&raw).unwrap_or(Value::Null);
            let _ = tx.send(Seen {
                method,
                target,
                authorization,
                body,
            });

            let payload = serde_json::to_vec(&response).expect("encode");
            let mut stream = stream;
            let head = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload.len()
            );
            stream.write_all(head.as_bytes()).expect("write head");
            stream.write_all(&payload).expect("write body");
            stream.flush().expect("flush");
        }
    });
    (addr, rx)
}

fn config(addr: &str) -> MemoryApiConfig {
    let mut cfg = MemoryApiConfig::new(addr);
    cfg.api_key = Some("secret-key".to_string());
    cfg
}

#[tokio::test]
async fn add_posts_messages_with_token_auth() {
    let (addr, seen) = spawn_stub(vec![(200, json!([{"id": "m1", "event": "ADD"}]))]);
    let backend = build_memory_backend(config(&addr)).expect("backend");
    let out = backend
        .add(AddMemoryRequest {
            messages: vec![Message::user("I prefer window seats")],
            scope: MemoryScope {
                user_id: Some("alice".to_string()),
                ..MemoryScope::default()
            },
            metadata: None,
            infer: None,
        })
        .await
        .expect("add");
    assert_eq!(out[0]["id"], "m1");

    let req = seen.recv().expect("request seen");
    assert_eq!(req.method, "POST");
    assert_eq!(req.target, "/v1/memories/");
    assert_eq!(req.authorization.as_deref(), Some("Token secret-key"));
    assert_eq!(req.body["user_id"], "alice");
    assert_eq!(req.body["messages"][0]["content"], "I prefer window seats");
}

#[tokio::test]
async fn search_maps_api_errors() {
    let (addr, seen) = spawn_stub(vec![(503, json!({"detail": "overloaded"}))]);
    let backend = build_memory_backend(config(&addr)).expect("backend");
    let err = backend
        .search(SearchRequest {
            query: "seat preference".to_string(),
            rerank: Some(true),
            ..SearchRequest::default()
        })
        .await
        .expect_err("503 must fail");
    match err {
        ClientError::Api { status, body } => {
            assert_eq!(status, 503);
            assert!(body.contains("overloaded"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let req = seen.recv().expect("request seen");
    assert_eq!(req.target, "/v2/memories/search/");
    assert_eq!(req.body["rerank"], true);
}

#[tokio::test]
async fn requests_rotate_across_replicas() {
    let (first, seen_first) = spawn_stub(vec![(200, json!({"id": "a"}))]);
    let (second, seen_second) = spawn_stub(vec![(200, json!({"id": "b"}))]);
    let mut cfg = config(&first);
    cfg.base_urls.push(second);
    let backend = build_memory_backend(cfg).expect("backend");

    let a = backend.get("m1").await.expect("first get");
    let b = backend.get("m1").await.expect("second get");
    assert_eq!(a["id"], "a");
    assert_eq!(b["id"], "b");
    assert_eq!(seen_first.recv().expect("first").target, "/v1/memories/m1/");
    assert_eq!(seen_second.recv().expect("second").method, "GET");
}

#[tokio::test]
async fn delete_all_requires_scope() {
    let backend = build_memory_backend(MemoryApiConfig::new("http://127.0.0.1:9")).expect("backend");
    let err = backend
        .delete_all(MemoryScope::default())
        .await
        .expect_err("empty scope");
    assert!(err.is_client_fault());
}
