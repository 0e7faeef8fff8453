use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::adaptor::{Adaptor, join_url};
use crate::dialect::claude::ClaudeRequest;
use crate::dialect::openai::ChatRequest;
use crate::pricing::{ModelPrice, ModelRatios};
use manifold_core::{RelayError, RelayMode, RequestMeta, Result};

const TOKEN_EXCHANGE_URL: &str = "https://api.github.com/copilot_internal/v2/token";
/// Refresh this long before the short-lived token actually expires.
const REFRESH_SKEW_SECS: i64 = 120;

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

/// GitHub Copilot. The channel key is a long-lived GitHub token that gets
/// exchanged for a short-lived API token; exchanges are cached per channel
/// and refreshed under a mutex so concurrent callers block behind one
/// refresh instead of racing.
pub struct CopilotAdaptor {
    tokens: DashMap<i64, CachedToken>,
    refresh_lock: Mutex<()>,
}

impl CopilotAdaptor {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn api_token(&self, meta: &RequestMeta) -> Result<String> {
        let now = Utc::now().timestamp();
        if let Some(cached) = self.tokens.get(&meta.channel_id)
            && cached.expires_at - REFRESH_SKEW_SECS > now
        {
            return Ok(cached.token.clone());
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(cached) = self.tokens.get(&meta.channel_id)
            && cached.expires_at - REFRESH_SKEW_SECS > now
        {
            return Ok(cached.token.clone());
        }

        debug!(channel_id = meta.channel_id, "exchanging copilot token");
        let resp = manifold_net::clients()
            .impatient
            .get(TOKEN_EXCHANGE_URL)
            .header("authorization", format!("token {}", meta.api_key))
            .header("user-agent", "GitHubCopilotChat/0.26.7")
            .send()
            .await
            .map_err(|e| RelayError::transport(format!("copilot token exchange: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(crate::adaptor::error_from_body(status, &body));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RelayError::transport(format!("copilot token exchange: {e}")))?;
        let token = body["token"]
            .as_str()
            .ok_or_else(|| RelayError::server(502, "copilot token exchange returned no token"))?
            .to_string();
        let expires_at = body["expires_at"].as_i64().unwrap_or(now + 600);

        self.tokens.insert(
            meta.channel_id,
            CachedToken {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }
}

impl Default for CopilotAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for CopilotAdaptor {
    fn name(&self) -> &'static str {
        "copilot"
    }

    fn request_url(&self, meta: &RequestMeta) -> Result<String> {
        match meta.mode {
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => {
                join_url(&meta.base_url, "/chat/completions")
            }
            other => Err(RelayError::bad_request(format!(
                "copilot channels do not serve {}",
                other.endpoint_name()
            ))),
        }
    }

    async fn setup_headers(&self, meta: &RequestMeta, headers: &mut HeaderMap) -> Result<()> {
        let token = self.api_token(meta).await?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| RelayError::internal("copilot token is not header-safe"))?;
        headers.insert("authorization", value);
        // Ecosystem-required identifying headers.
        headers.insert("editor-version", HeaderValue::from_static("vscode/1.95.0"));
        headers.insert(
            "editor-plugin-version",
            HeaderValue::from_static("copilot-chat/0.26.7"),
        );
        headers.insert(
            "copilot-integration-id",
            HeaderValue::from_static("vscode-chat"),
        );
        headers.insert("user-agent", HeaderValue::from_static("GitHubCopilotChat/0.26.7"));
        Ok(())
    }

    fn convert_request(&self, meta: &RequestMeta, mut body: ChatRequest) -> Result<Value> {
        body.model = meta.actual_model.clone();
        body.top_k = None;
        body.thinking = None;
        body.reasoning = None;
        if body.is_stream() && body.stream_options.is_none() {
            body.stream_options = Some(json!({"include_usage": true}));
        }
        Ok(serde_json::to_value(body)?)
    }

    fn convert_claude_request(&self, meta: &RequestMeta, body: ClaudeRequest) -> Result<Value> {
        self.convert_request(meta, crate::bridge::claude_to_chat(&body))
    }

    fn model_ratios(&self) -> &'static ModelRatios {
        static RATIOS: OnceLock<ModelRatios> = OnceLock::new();
        RATIOS.get_or_init(|| {
            // Copilot bills by seat, not by token; relayed usage is
            // effectively flat-rate.
            let mut m = ModelRatios::new();
            m.insert("gpt-4o", ModelPrice::tokens(0.0, 0.0));
            m.insert("claude-sonnet-4", ModelPrice::tokens(0.0, 0.0));
            m
        })
    }
}
