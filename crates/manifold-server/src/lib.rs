//! # manifold-server
//!
//! HTTP/WebSocket ingress and egress for the Manifold gateway: the
//! OpenAI-compatible route surface, caller authentication, request body
//! caching, SSE egress, and the realtime websocket proxy.

pub mod auth;
pub mod ingress;
pub mod realtime;

use axum::body::Body;
use axum::extract::{OriginalUri, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use auth::{AuthContext, error_response};
use ingress::{CachedBody, mode_of};
use manifold_adaptor::ResponseSink;
use manifold_adaptor::dialect::claude::ClaudeRequest;
use manifold_adaptor::dialect::openai::ChatRequest;
use manifold_adaptor::dialect::response::ResponseRequest;
use manifold_core::{
    ChannelStore, ReasoningFormat, RelayError, RelayLogStore, RelayMode, RequestMeta, TokenStore,
};
use manifold_relay::{RelayEngine, RelayPayload, RelayRequest};
use manifold_router::AbilityCache;

/// Shared server state.
pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub tokens: Arc<dyn TokenStore>,
    pub channels: Arc<dyn ChannelStore>,
    pub logs: Arc<dyn RelayLogStore>,
    pub cache: Arc<AbilityCache>,
    pub key_prefix: String,
    pub started_at: Instant,
}

/// Per-request id, generated at ingress and echoed in error envelopes and
/// the `x-request-id` response header.
#[derive(Clone)]
pub struct RequestId(pub String);

/// Query parameters the engine honors.
#[derive(Debug, Default, Deserialize)]
pub struct RelayParams {
    pub reasoning_format: Option<String>,
    pub thinking: Option<bool>,
    /// Model hint for websocket upgrades that carry no body yet.
    pub model: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
}

/// Build the Axum router.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let relay_routes = Router::new()
        .route("/v1/chat/completions", post(relay_handler))
        .route("/v1/completions", post(relay_handler))
        .route("/v1/embeddings", post(relay_handler))
        .route("/v1/moderations", post(relay_handler))
        .route("/v1/images/generations", post(relay_handler))
        .route("/v1/images/edits", post(relay_handler))
        .route("/v1/images/variations", post(relay_handler))
        .route("/v1/audio/speech", post(relay_handler))
        .route("/v1/audio/transcriptions", post(relay_handler))
        .route("/v1/audio/translations", post(relay_handler))
        .route("/v1/responses", post(relay_handler))
        .route("/v1/messages", post(relay_handler))
        .route("/v1/rerank", post(relay_handler))
        .route("/v1/videos", post(relay_handler))
        // Path aliases kept for historical clients; the handler
        // canonicalizes before dispatch.
        .route("/v1/v1/messages", post(relay_handler))
        .route("/openai/v1/messages", post(relay_handler))
        .route("/openai/v1/v1/messages", post(relay_handler))
        .route("/api/v1/v1/messages", post(relay_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/realtime", get(realtime::realtime_handler))
        .layer(middleware::from_fn(ingress::cache_body))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(relay_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Attach a request id to every request and echo it back.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = RequestMeta::new_request_id();
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Models visible to the caller's group, OpenAI list shape.
async fn models_handler(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Json<Value> {
    let models = state.cache.models_for_group(&auth.token.group);
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "manifold",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn relay_handler(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<RelayParams>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(CachedBody(bytes)): Extension<CachedBody>,
) -> Response {
    // Opportunistic cache refresh keeps the projection within its TTL.
    let _ = state.cache.refresh_if_stale(state.channels.as_ref()).await;

    let Some(mode) = mode_of(uri.path()) else {
        return error_response(&RelayError::not_found("unknown endpoint"), &request_id);
    };

    let parsed = parse_payload(mode, &bytes, &params);
    let (payload, model, is_stream) = match parsed {
        Ok(p) => p,
        Err(e) => return error_response(&e, &request_id),
    };

    if !auth.token.allows_model(&model) {
        return error_response(
            &RelayError::forbidden(format!("model not allowed: {model}")),
            &request_id,
        );
    }

    let reasoning_format = params
        .reasoning_format
        .as_deref()
        .and_then(ReasoningFormat::parse)
        .unwrap_or_default();

    let relay_request = RelayRequest {
        request_id: request_id.clone(),
        token: auth.token,
        model,
        mode,
        payload,
        is_stream,
        pinned_channel: auth.pinned_channel,
        reasoning_format,
        thinking_enabled: params.thinking.unwrap_or(false),
    };

    if is_stream {
        stream_response(state, relay_request, request_id)
    } else {
        buffered_response(state, relay_request, request_id).await
    }
}

/// Parse the cached body into the dialect payload plus routing facts.
fn parse_payload(
    mode: RelayMode,
    bytes: &Bytes,
    params: &RelayParams,
) -> Result<(RelayPayload, String, bool), RelayError> {
    match mode {
        RelayMode::ChatCompletions | RelayMode::Completions => {
            let chat: ChatRequest = serde_json::from_slice(bytes)
                .map_err(|e| RelayError::bad_request(format!("invalid_text_request: {e}")))?;
            let model = chat.model.clone();
            let stream = chat.is_stream();
            Ok((RelayPayload::Chat(chat), model, stream))
        }
        RelayMode::ClaudeMessages => {
            let claude: ClaudeRequest = serde_json::from_slice(bytes)
                .map_err(|e| RelayError::bad_request(format!("invalid_text_request: {e}")))?;
            let model = claude.model.clone();
            let stream = claude.is_stream();
            Ok((RelayPayload::Claude(claude), model, stream))
        }
        RelayMode::ResponseApi => {
            let parsed: ResponseRequest = serde_json::from_slice(bytes)
                .map_err(|e| RelayError::bad_request(format!("invalid_text_request: {e}")))?;
            let model = parsed
                .model
                .clone()
                .or_else(|| params.model.clone())
                .ok_or_else(|| RelayError::bad_request("model is required"))?;
            let stream = parsed.is_stream();
            let value = serde_json::to_value(parsed)?;
            Ok((RelayPayload::Raw(value), model, stream))
        }
        _ => {
            let value: Value = if bytes.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_slice(bytes)
                    .map_err(|e| RelayError::bad_request(format!("invalid_text_request: {e}")))?
            };
            let model = value["model"]
                .as_str()
                .map(str::to_string)
                .or_else(|| params.model.clone())
                .ok_or_else(|| RelayError::bad_request("model is required"))?;
            let stream = value["stream"].as_bool().unwrap_or(false);
            Ok((RelayPayload::Raw(value), model, stream))
        }
    }
}

async fn buffered_response(
    state: Arc<AppState>,
    request: RelayRequest,
    request_id: String,
) -> Response {
    let mut sink = ResponseSink::buffered();
    match state.engine.relay(request, &mut sink).await {
        Ok(result) => {
            let body = result.body.unwrap_or_else(|| json!({}));
            // `error` stays absent on success for OpenAI client
            // compatibility; bodies carrying an empty error object have it
            // dropped.
            let body = strip_empty_error(body);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => error_response(&err, &request_id),
    }
}

fn strip_empty_error(mut body: Value) -> Value {
    if let Some(map) = body.as_object_mut()
        && map.get("error").is_some_and(|e| {
            e.is_null()
                || (e.is_object() && e["message"].as_str().unwrap_or_default().is_empty())
        })
    {
        map.remove("error");
    }
    body
}

/// SSE egress: correct headers, every rendered chunk flushed as it arrives,
/// and a final error chunk (never a torn JSON token) when the relay dies
/// mid-flight.
fn stream_response(state: Arc<AppState>, request: RelayRequest, request_id: String) -> Response {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let engine = Arc::clone(&state.engine);
    let error_tx = tx.clone();
    let error_request_id = request_id.clone();

    tokio::spawn(async move {
        let mut sink = ResponseSink::stream(tx);
        if let Err(err) = engine.relay(request, &mut sink).await {
            let _ = error_tx
                .send(manifold_stream::error_chunk(&err, &error_request_id))
                .await;
        }
    });

    let body_stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(Bytes::from(chunk));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Start the HTTP server; drains in-flight work on ctrl-c.
pub async fn start_server(state: Arc<AppState>, listen: &str, cors: bool) -> manifold_core::Result<()> {
    let router = build_router(state, cors);
    info!(listen, "starting gateway");

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| RelayError::internal(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining in-flight streams");
        })
        .await
        .map_err(|e| RelayError::internal(format!("server error: {e}")))?;

    Ok(())
}
