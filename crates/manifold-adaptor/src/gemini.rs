use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::sync::OnceLock;

use crate::adaptor::{Adaptor, join_url};
use crate::dialect::claude::ClaudeRequest;
use crate::dialect::openai::ChatRequest;
use crate::pricing::{ModelPrice, ModelRatios};
use manifold_core::{RelayError, RelayMode, RequestMeta, Result};

/// Google Gemini via its OpenAI-compatible surface
/// (`…/v1beta/openai/chat/completions`). Keeps Gemini's own pricing and
/// request scrubbing while sharing the chat-completions wire shape.
pub struct GeminiAdaptor;

impl GeminiAdaptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GeminiAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn request_url(&self, meta: &RequestMeta) -> Result<String> {
        let path = match meta.mode {
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => "/chat/completions",
            RelayMode::Embeddings => "/embeddings",
            other => {
                return Err(RelayError::bad_request(format!(
                    "gemini channels do not serve {}",
                    other.endpoint_name()
                )));
            }
        };
        join_url(&meta.base_url, path)
    }

    async fn setup_headers(&self, meta: &RequestMeta, headers: &mut HeaderMap) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {}", meta.api_key))
            .map_err(|_| RelayError::internal("channel key is not header-safe"))?;
        headers.insert("authorization", value);
        Ok(())
    }

    fn convert_request(&self, meta: &RequestMeta, mut body: ChatRequest) -> Result<Value> {
        body.model = meta.actual_model.clone();
        // The compat surface rejects OpenAI reasoning knobs and top_k.
        body.reasoning = None;
        body.reasoning_effort = None;
        body.top_k = None;
        body.thinking = None;
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
            let mut m = ModelRatios::new();
            m.insert("gemini-2.5-pro", ModelPrice::tokens(1.25, 10.0));
            m.insert("gemini-2.5-flash", ModelPrice::tokens(0.3, 2.5));
            m.insert("gemini-2.0-flash", ModelPrice::tokens(0.1, 0.4));
            m.insert("text-embedding-004", ModelPrice::tokens(0.01, 0.0));
            m
        })
    }
}
