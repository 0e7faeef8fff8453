//! API surface tests driven through the router with tower's oneshot.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;

use manifold_core::{
    Channel, ChannelKind, ChannelStatus, MemoryStore, Token, TokenStatus,
};
use manifold_relay::{Biller, RelayEngine};
use manifold_router::{AbilityCache, ChannelRateLimiter, Selector, SuspensionMap};
use manifold_server::{AppState, build_router};

async fn spawn_upstream(status: u16, body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                read_full_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
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

fn chat_completion_body() -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hi from upstream"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9}
    })
    .to_string()
}

fn seed_channel(id: i64, addr: SocketAddr, models: &[&str]) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        kind: ChannelKind::OpenAi,
        base_url: format!("http://{addr}/v1"),
        key: "sk-upstream".into(),
        models: models.iter().map(|m| m.to_string()).collect(),
        endpoints: HashSet::new(),
        priority: 0,
        status: ChannelStatus::Enabled,
        groups: ["default".to_string()].into_iter().collect(),
        model_mapping: HashMap::new(),
        system_prompt: None,
        rate_limit: None,
        config: Value::Null,
    }
}

fn app(store: Arc<MemoryStore>, channels: Vec<Channel>) -> axum::Router {
    store.seed_token(Token {
        id: 1,
        user_id: 1,
        key: "caller-key".into(),
        group: "default".into(),
        remaining_quota: Some(10_000_000),
        allowed_models: HashSet::new(),
        subnets: vec![],
        status: TokenStatus::Enabled,
        admin: true,
    });
    let cache = Arc::new(AbilityCache::new(Duration::from_secs(300)));
    cache.install(channels);
    let selector = Arc::new(Selector::new(
        Arc::clone(&cache),
        Arc::new(SuspensionMap::new()),
        Arc::new(ChannelRateLimiter::new()),
    ));
    let engine = Arc::new(RelayEngine::new(
        selector,
        Biller::new(Arc::clone(&store) as Arc<dyn manifold_core::TokenStore>, 1.0, HashMap::new()),
        Arc::clone(&store) as Arc<dyn manifold_core::RelayLogStore>,
        Duration::from_secs(60),
        5,
    ));
    let state = Arc::new(AppState {
        engine,
        tokens: Arc::clone(&store) as Arc<dyn manifold_core::TokenStore>,
        channels: Arc::clone(&store) as Arc<dyn manifold_core::ChannelStore>,
        logs: store as Arc<dyn manifold_core::RelayLogStore>,
        cache,
        key_prefix: "sk-".into(),
        started_at: Instant::now(),
    });
    build_router(state, false)
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", "Bearer sk-caller-key")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn chat_completion_end_to_end() {
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    let app = app(Arc::clone(&store), vec![seed_channel(1, addr, &["gpt-4o"])]);

    let req = post(
        "/v1/chat/completions",
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
    );
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "hi from upstream");
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn path_aliases_return_identical_responses() {
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    let app = app(
        Arc::clone(&store),
        vec![seed_channel(1, addr, &["claude-3.5-sonnet"])],
    );

    let body = json!({
        "model": "claude-3.5-sonnet",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "hi"}]
    });

    let mut bodies = Vec::new();
    for path in ["/v1/messages", "/v1/v1/messages", "/openai/v1/messages", "/api/v1/v1/messages"] {
        let response = app.clone().oneshot(post(path, body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        let mut value = body_json(response).await;
        // The message id embeds the per-request id; normalize before
        // comparing alias responses.
        value["id"] = Value::String("msg_fixed".into());
        bodies.push(value);
    }
    for pair in bodies.windows(2) {
        assert_eq!(pair[0], pair[1]);
    }
    // The Claude-shaped response carries at least one text block.
    assert_eq!(bodies[0]["content"][0]["type"], "text");
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    let app = app(Arc::clone(&store), vec![seed_channel(1, addr, &["gpt-4o"])]);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": "gpt-4o", "messages": []}).to_string()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn model_whitelist_is_enforced() {
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    store.seed_token(Token {
        id: 2,
        user_id: 1,
        key: "limited-key".into(),
        group: "default".into(),
        remaining_quota: None,
        allowed_models: ["gpt-4o-mini".to_string()].into_iter().collect(),
        subnets: vec![],
        status: TokenStatus::Enabled,
        admin: false,
    });
    let app = app(Arc::clone(&store), vec![seed_channel(1, addr, &["gpt-4o"])]);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-limited-key")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "x"}]}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("model not allowed"));
}

#[tokio::test]
async fn embeddings_skip_chat_only_channel() {
    let embeddings_body = json!({
        "object": "list",
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2]}],
        "model": "text-embedding-3-small",
        "usage": {"prompt_tokens": 3, "total_tokens": 3}
    })
    .to_string();
    let chat_only_addr = spawn_upstream(200, chat_completion_body()).await;
    let embed_addr = spawn_upstream(200, embeddings_body).await;

    let mut chat_only = seed_channel(1, chat_only_addr, &["text-embedding-3-small"]);
    chat_only.priority = 10;
    chat_only.endpoints = ["chat_completions".to_string()].into_iter().collect();
    let fallback = seed_channel(2, embed_addr, &["text-embedding-3-small"]);

    let store = Arc::new(MemoryStore::new());
    let app = app(Arc::clone(&store), vec![chat_only, fallback]);

    let req = post(
        "/v1/embeddings",
        json!({"model": "text-embedding-3-small", "input": "hello"}),
    );
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The settled log row points at the fallback channel.
    let logs = store.logged();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, 2);
}

#[tokio::test]
async fn models_listing_reflects_group_visibility() {
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    let app = app(
        Arc::clone(&store),
        vec![seed_channel(1, addr, &["gpt-4o", "gpt-4o-mini"])],
    );

    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "Bearer sk-caller-key")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
}

#[tokio::test]
async fn health_needs_no_auth() {
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    let app = app(Arc::clone(&store), vec![seed_channel(1, addr, &["gpt-4o"])]);

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn body_is_reusable_after_middleware_reads_it() {
    // The auth + caching middleware read the request; the handler must
    // still see the original bytes, proven by the upstream echo flow
    // completing with the parsed model.
    let addr = spawn_upstream(200, chat_completion_body()).await;
    let store = Arc::new(MemoryStore::new());
    let app = app(Arc::clone(&store), vec![seed_channel(1, addr, &["gpt-4o"])]);

    let payload = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "round trip"}]
    });
    let response = app.oneshot(post("/v1/chat/completions", payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let logs = store.logged();
    assert_eq!(logs[0].model, "gpt-4o");
}
