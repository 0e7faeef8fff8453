//! Realtime websocket proxy.
//!
//! The upgrade can arrive before the client names a model; selection then
//! falls back to `(group, endpoint, transport)` and picks an OpenAI-shaped
//! channel. Frames are relayed both ways until either side closes.

use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};

use crate::auth::{AuthContext, error_response};
use crate::{AppState, RelayParams, RequestId};
use manifold_core::{Channel, RelayError, RelayMode, Result};
use manifold_router::SelectQuery;

pub async fn realtime_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RelayParams>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    ws: WebSocketUpgrade,
) -> Response {
    let selector = state.engine.selector();
    // With a model hint this is ordinary selection; without one, only
    // channels that admit Response-API-over-ws qualify.
    let picked = match &params.model {
        Some(model) => {
            if !auth.token.allows_model(model) {
                return error_response(
                    &RelayError::forbidden(format!("model not allowed: {model}")),
                    &request_id,
                );
            }
            let mut exclude = HashSet::new();
            selector.pick(&mut SelectQuery {
                group: &auth.token.group,
                model,
                mode: RelayMode::Realtime,
                websocket: true,
                exclude: &mut exclude,
                ignore_first_priority: false,
            })
        }
        None => selector.pick_for_ws(&auth.token.group, &HashSet::new()),
    };
    let channel = match picked {
        Ok(c) => c,
        Err(e) => return error_response(&e, &request_id),
    };

    let model = params.model.clone().unwrap_or_default();
    ws.on_upgrade(move |client| async move {
        if let Err(e) = proxy(client, channel, model, request_id.clone()).await {
            warn!(request_id = %request_id, error = %e, "realtime session ended with error");
        }
    })
}

fn upstream_ws_url(channel: &Channel, model: &str) -> String {
    let base = channel
        .base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let base = base.trim_end_matches('/');
    if model.is_empty() {
        format!("{base}/realtime")
    } else {
        format!("{base}/realtime?model={model}")
    }
}

async fn proxy(
    client: WebSocket,
    channel: Arc<Channel>,
    model: String,
    request_id: String,
) -> Result<()> {
    let url = upstream_ws_url(&channel, &channel.mapped_model(&model));
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| RelayError::internal(format!("realtime url {url}: {e}")))?;
    let headers = request.headers_mut();
    headers.insert(
        "authorization",
        format!("Bearer {}", channel.key)
            .parse()
            .map_err(|_| RelayError::internal("channel key is not header-safe"))?,
    );
    headers.insert(
        "openai-beta",
        "realtime=v1"
            .parse()
            .map_err(|_| RelayError::internal("invalid realtime header"))?,
    );

    let (upstream, _) = connect_async(request)
        .await
        .map_err(|e| RelayError::transport(format!("realtime dial: {e}")))?;
    debug!(request_id = %request_id, channel_id = channel.id, "realtime session connected");

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    // One task per direction; the session ends when either side closes.
    let uplink = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forward = match msg {
                ClientMessage::Text(text) => UpstreamMessage::text(text.as_str()),
                ClientMessage::Binary(data) => UpstreamMessage::binary(data),
                ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
                ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
                ClientMessage::Close(_) => break,
            };
            if upstream_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
    };

    let downlink = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forward = match msg {
                UpstreamMessage::Text(text) => ClientMessage::Text(text.as_str().into()),
                UpstreamMessage::Binary(data) => ClientMessage::Binary(data),
                UpstreamMessage::Ping(data) => ClientMessage::Ping(data),
                UpstreamMessage::Pong(data) => ClientMessage::Pong(data),
                UpstreamMessage::Close(_) => break,
                UpstreamMessage::Frame(_) => continue,
            };
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(ClientMessage::Close(None)).await;
    };

    tokio::join!(uplink, downlink);
    debug!(request_id = %request_id, channel_id = channel.id, "realtime session closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn ws_url_swaps_scheme_and_carries_model() {
        let channel = Channel {
            id: 1,
            name: "rt".into(),
            kind: manifold_core::ChannelKind::OpenAi,
            base_url: "https://api.openai.com/v1".into(),
            key: "k".into(),
            models: HashSet::new(),
            endpoints: HashSet::new(),
            priority: 0,
            status: manifold_core::ChannelStatus::Enabled,
            groups: HashSet::new(),
            model_mapping: HashMap::new(),
            system_prompt: None,
            rate_limit: None,
            config: serde_json::Value::Null,
        };
        assert_eq!(
            upstream_ws_url(&channel, "gpt-4o-realtime-preview"),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
        assert_eq!(upstream_ws_url(&channel, ""), "wss://api.openai.com/v1/realtime");
    }
}
