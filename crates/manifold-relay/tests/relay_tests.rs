//! End-to-end relay loop tests against a canned local upstream.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use manifold_adaptor::ResponseSink;
use manifold_adaptor::dialect::openai::ChatRequest;
use manifold_core::{
    Channel, ChannelKind, ChannelStatus, MemoryStore, RelayMode, Token, TokenStatus,
};
use manifold_relay::{Biller, RelayEngine, RelayPayload, RelayRequest};
use manifold_router::{AbilityCache, ChannelRateLimiter, Selector, SuspensionMap};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve one canned HTTP response per connection, in order; the last entry
/// repeats. Returns the bound address and a hit counter.
async fn spawn_upstream(responses: Vec<(u16, String)>) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses
                .get(n.min(responses.len().saturating_sub(1)))
                .cloned()
                .unwrap_or((500, "{}".to_string()));
            tokio::spawn(async move {
                read_full_request(&mut socket).await;
                let reason = match status {
                    200 => "OK",
                    400 => "Bad Request",
                    401 => "Unauthorized",
                    429 => "Too Many Requests",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, hits)
}

/// Read an entire HTTP/1.1 request (head + content-length body).
async fn read_full_request(socket: &mut tokio::net::TcpStream) {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let Ok(n) = socket.read(&mut buf).await else {
            return;
        };
        if n == 0 {
            return;
        }
        data.extend_from_slice(&buf[..n]);
        let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&data[..head_end]);
        let content_length = head
            .lines()
            .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(str::to_string))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= head_end + 4 + content_length {
            return;
        }
    }
}

fn ok_completion_body() -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello there"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
    })
    .to_string()
}

fn channel(id: i64, addr: SocketAddr, priority: i32) -> Channel {
    Channel {
        id,
        name: format!("upstream-{id}"),
        kind: ChannelKind::OpenAi,
        base_url: format!("http://{addr}/v1"),
        key: "sk-upstream".into(),
        models: ["gpt-4o".to_string()].into_iter().collect(),
        endpoints: HashSet::new(),
        priority,
        status: ChannelStatus::Enabled,
        groups: ["default".to_string()].into_iter().collect(),
        model_mapping: HashMap::new(),
        system_prompt: None,
        rate_limit: None,
        config: serde_json::Value::Null,
    }
}

fn token(quota: i64) -> Token {
    Token {
        id: 1,
        user_id: 1,
        key: "caller".into(),
        group: "default".into(),
        remaining_quota: Some(quota),
        allowed_models: HashSet::new(),
        subnets: vec![],
        status: TokenStatus::Enabled,
        admin: true,
    }
}

fn engine(store: Arc<MemoryStore>, channels: Vec<Channel>) -> RelayEngine {
    let cache = Arc::new(AbilityCache::new(Duration::from_secs(60)));
    cache.install(channels);
    let selector = Arc::new(Selector::new(
        cache,
        Arc::new(SuspensionMap::new()),
        Arc::new(ChannelRateLimiter::new()),
    ));
    let biller = Biller::new(Arc::clone(&store) as Arc<dyn manifold_core::TokenStore>, 1.0, HashMap::new());
    RelayEngine::new(
        selector,
        biller,
        store as Arc<dyn manifold_core::RelayLogStore>,
        Duration::from_secs(60),
        5,
    )
}

fn chat_request(pinned: Option<i64>) -> RelayRequest {
    let chat: ChatRequest = serde_json::from_value(json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "hi"}]
    }))
    .unwrap();
    RelayRequest {
        request_id: "req-test".into(),
        token: token(1_000_000),
        model: "gpt-4o".into(),
        mode: RelayMode::ChatCompletions,
        payload: RelayPayload::Chat(chat),
        is_stream: false,
        pinned_channel: pinned,
        reasoning_format: Default::default(),
        thinking_enabled: false,
    }
}

#[tokio::test]
async fn success_settles_quota_and_logs() {
    let (addr, _hits) = spawn_upstream(vec![(200, ok_completion_body())]).await;
    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(Arc::clone(&store), vec![channel(1, addr, 10)]);

    let mut sink = ResponseSink::buffered();
    let result = engine.relay(chat_request(None), &mut sink).await.unwrap();

    assert_eq!(result.channel_id, 1);
    assert_eq!(result.usage.total_tokens, 12);
    let body = result.body.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
    assert!(body.get("error").is_none());

    // Settlement: 9 prompt + 3 completion at gpt-4o ratios (2.5 / 10.0).
    let cost = result.quota_cost;
    assert_eq!(cost, (9.0 * 2.5f64 + 3.0 * 10.0).ceil() as i64);
    assert_eq!(store.remaining_quota(1), Some(Some(1_000_000 - cost)));

    let logs = store.logged();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, 1);
    assert_eq!(logs[0].status, 200);
}

#[tokio::test]
async fn invalid_api_key_fails_over_and_excludes() {
    let bad_body =
        json!({"error": {"message": "Incorrect API key provided", "code": "invalid_api_key"}})
            .to_string();
    let (bad_addr, bad_hits) = spawn_upstream(vec![(401, bad_body)]).await;
    let (good_addr, _good_hits) = spawn_upstream(vec![(200, ok_completion_body())]).await;

    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(
        Arc::clone(&store),
        vec![channel(1, bad_addr, 10), channel(2, good_addr, 5)],
    );

    let mut sink = ResponseSink::buffered();
    let result = engine.relay(chat_request(None), &mut sink).await.unwrap();
    assert_eq!(result.channel_id, 2);
    assert_eq!(bad_hits.load(Ordering::SeqCst), 1, "no second hit on the bad key");
}

#[tokio::test]
async fn rate_limited_channel_is_excluded() {
    let body = json!({"error": {"message": "Rate limit reached", "type": "rate_limit_error"}}).to_string();
    let (limited_addr, limited_hits) = spawn_upstream(vec![(429, body)]).await;
    let (good_addr, _) = spawn_upstream(vec![(200, ok_completion_body())]).await;

    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(
        Arc::clone(&store),
        vec![channel(1, limited_addr, 10), channel(2, good_addr, 5)],
    );

    let mut sink = ResponseSink::buffered();
    let result = engine.relay(chat_request(None), &mut sink).await.unwrap();
    assert_eq!(result.channel_id, 2);
    assert_eq!(limited_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pinned_channel_never_retries() {
    let body = json!({"error": {"message": "Rate limit reached", "type": "rate_limit_error"}}).to_string();
    let (limited_addr, limited_hits) = spawn_upstream(vec![(429, body)]).await;
    let (good_addr, good_hits) = spawn_upstream(vec![(200, ok_completion_body())]).await;

    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(
        Arc::clone(&store),
        vec![channel(1, limited_addr, 10), channel(2, good_addr, 5)],
    );

    let mut sink = ResponseSink::buffered();
    let err = engine.relay(chat_request(Some(1)), &mut sink).await.unwrap_err();
    assert_eq!(err.status, 429);
    assert_eq!(limited_hits.load(Ordering::SeqCst), 1);
    assert_eq!(good_hits.load(Ordering::SeqCst), 0);
    // Reservation was released in full.
    assert_eq!(store.remaining_quota(1), Some(Some(1_000_000)));
}

#[tokio::test]
async fn bad_request_is_fatal_and_not_excluded() {
    let body = json!({"error": {"message": "tool schema invalid", "type": "invalid_request_error"}})
        .to_string();
    let (addr, hits) = spawn_upstream(vec![(400, body)]).await;
    let (fallback_addr, fallback_hits) = spawn_upstream(vec![(200, ok_completion_body())]).await;

    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(
        Arc::clone(&store),
        vec![channel(1, addr, 10), channel(2, fallback_addr, 5)],
    );

    let mut sink = ResponseSink::buffered();
    let err = engine.relay(chat_request(None), &mut sink).await.unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(fallback_hits.load(Ordering::SeqCst), 0, "fatal errors must not fail over");
    assert_eq!(store.remaining_quota(1), Some(Some(1_000_000)));
}

#[tokio::test]
async fn transient_500_retries_same_channel() {
    let (addr, hits) = spawn_upstream(vec![
        (500, json!({"error": {"message": "internal error"}}).to_string()),
        (200, ok_completion_body()),
    ])
    .await;

    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(Arc::clone(&store), vec![channel(1, addr, 10)]);

    let mut sink = ResponseSink::buffered();
    let result = engine.relay(chat_request(None), &mut sink).await.unwrap();
    assert_eq!(result.channel_id, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn insufficient_caller_quota_is_terminal_and_unbilled() {
    let (addr, hits) = spawn_upstream(vec![(200, ok_completion_body())]).await;
    let store = Arc::new(MemoryStore::new());
    let mut broke = token(1);
    broke.remaining_quota = Some(1);
    store.seed_token(broke.clone());
    let engine = engine(Arc::clone(&store), vec![channel(1, addr, 10)]);

    let mut req = chat_request(None);
    req.token = broke;
    // Inflate the prompt so the reservation cannot fit one quota unit.
    if let RelayPayload::Chat(chat) = &mut req.payload {
        chat.messages[0].content = Some(
            manifold_adaptor::dialect::openai::MessageContent::Text("x".repeat(4096)),
        );
    }

    let mut sink = ResponseSink::buffered();
    let err = engine.relay(req, &mut sink).await.unwrap_err();
    assert_eq!(err.kind, manifold_core::ErrorKind::InsufficientQuota);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "never dispatched upstream");
    assert_eq!(store.remaining_quota(1), Some(Some(1)));
}

#[tokio::test]
async fn truncation_is_billing_success() {
    let body = json!({
        "id": "chatcmpl-2",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": ""},
            "finish_reason": "length"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 128, "total_tokens": 137}
    })
    .to_string();
    let (addr, _) = spawn_upstream(vec![(200, body)]).await;

    let store = Arc::new(MemoryStore::new());
    store.seed_token(token(1_000_000));
    let engine = engine(Arc::clone(&store), vec![channel(1, addr, 10)]);

    let mut sink = ResponseSink::buffered();
    let result = engine.relay(chat_request(None), &mut sink).await.unwrap();
    assert_eq!(result.usage.completion_tokens, 128);
    assert!(result.quota_cost > 0);
    assert_eq!(store.logged().len(), 1);
}
