use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::adaptor::{Adaptor, ResponseSink, error_from_body, join_url};
use crate::dialect::claude::{ClaudeRequest, ClaudeResponse};
use crate::dialect::openai::ChatRequest;
use crate::pricing::{ModelPrice, ModelRatios};
use crate::signature::SignatureCache;
use manifold_core::{RelayError, RelayMode, RequestMeta, Result, Usage};
use manifold_stream::{StreamContext, pump_sse};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const SIGNATURE_TTL: Duration = Duration::from_secs(3600);

/// Anthropic Claude API. Chat-Completions callers are bridged onto the
/// Messages dialect in both directions.
pub struct AnthropicAdaptor {
    signatures: SignatureCache,
}

impl AnthropicAdaptor {
    pub fn new() -> Self {
        Self {
            signatures: SignatureCache::new(SIGNATURE_TTL),
        }
    }

    pub fn signature_cache(&self) -> &SignatureCache {
        &self.signatures
    }
}

impl Default for AnthropicAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn request_url(&self, meta: &RequestMeta) -> Result<String> {
        match meta.mode {
            RelayMode::ClaudeMessages | RelayMode::ChatCompletions => {
                join_url(&meta.base_url, "/messages")
            }
            other => Err(RelayError::bad_request(format!(
                "anthropic channels do not serve {}",
                other.endpoint_name()
            ))),
        }
    }

    async fn setup_headers(&self, meta: &RequestMeta, headers: &mut HeaderMap) -> Result<()> {
        let key = HeaderValue::from_str(&meta.api_key)
            .map_err(|_| RelayError::internal("channel key is not header-safe"))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(())
    }

    fn convert_request(&self, meta: &RequestMeta, body: ChatRequest) -> Result<Value> {
        self.convert_claude_request(meta, crate::bridge::chat_to_claude(&body))
    }

    fn convert_claude_request(&self, meta: &RequestMeta, mut body: ClaudeRequest) -> Result<Value> {
        body.model = meta.actual_model.clone();
        if let Some(thinking) = &body.thinking {
            body.thinking = Some(thinking.normalized());
        }
        self.signatures.apply(meta.token_id, &mut body);
        Ok(serde_json::to_value(body)?)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        response: reqwest::Response,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status, &body));
        }

        match sink {
            ResponseSink::Stream { tx } => {
                if meta.mode == RelayMode::ChatCompletions {
                    return crate::bridge::pump_claude_to_chat(response, meta, tx).await;
                }
                // Claude callers get the event stream as-is; it ends on
                // message_stop, not a DONE marker.
                let mut ctx = StreamContext::new(meta.prompt_tokens).without_done_marker();
                pump_sse(response, &mut ctx, tx).await
            }
            ResponseSink::Buffered { body } => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| RelayError::transport(format!("reading upstream body: {e}")))?;
                let value: Value = serde_json::from_str(&text).map_err(|_| {
                    RelayError::server(502, "upstream returned non-json body").with_raw(&text)
                })?;
                if value["type"] == "error" {
                    let message = value["error"]["message"].as_str().unwrap_or("upstream error");
                    return Err(RelayError::server(502, message.to_string()).with_raw(&text));
                }

                let claude: ClaudeResponse = serde_json::from_value(value.clone())?;
                let mut usage = Usage {
                    prompt_tokens: claude.usage.input_tokens,
                    completion_tokens: claude.usage.output_tokens,
                    cached_tokens: claude.usage.cache_read_input_tokens,
                    ..Default::default()
                };
                usage.ensure_total();

                if meta.mode == RelayMode::ChatCompletions {
                    let chat = crate::bridge::claude_response_to_chat(&claude, meta);
                    *body = Some(serde_json::to_value(chat)?);
                } else {
                    *body = Some(value);
                }
                Ok(usage)
            }
        }
    }

    /// Remember the signatures a response carried, keyed against the
    /// conversation the next turn will replay.
    fn observe_claude_response(&self, meta: &RequestMeta, request: &ClaudeRequest, body: &Value) {
        let Ok(claude) = serde_json::from_value::<ClaudeResponse>(body.clone()) else {
            return;
        };
        self.signatures
            .remember_response(meta.token_id, &request.messages, &claude.content);
    }

    fn model_ratios(&self) -> &'static ModelRatios {
        static RATIOS: OnceLock<ModelRatios> = OnceLock::new();
        RATIOS.get_or_init(|| {
            let mut m = ModelRatios::new();
            m.insert("claude-opus-4", ModelPrice::tokens(15.0, 75.0));
            m.insert("claude-sonnet-4", ModelPrice::tokens(3.0, 15.0));
            m.insert("claude-3.7-sonnet", ModelPrice::tokens(3.0, 15.0));
            m.insert("claude-3.5-sonnet", ModelPrice::tokens(3.0, 15.0));
            m.insert("claude-3.5-haiku", ModelPrice::tokens(0.8, 4.0));
            m.insert("claude-haiku-4", ModelPrice::tokens(1.0, 5.0));
            m
        })
    }
}
