use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::dialect::claude::ClaudeRequest;
use crate::dialect::openai::{ChatRequest, ChatResponse};
use crate::pricing::{ModelPrice, ModelRatios, resolve};
use manifold_core::{ErrorKind, RelayError, RelayMode, RequestMeta, Result, Usage};
use manifold_stream::{StreamContext, pump_sse};

/// Where an adaptor delivers the upstream answer: a buffered JSON body, or
/// an SSE sender the egress layer drains chunk by chunk.
pub enum ResponseSink {
    Buffered { body: Option<Value> },
    Stream { tx: mpsc::Sender<String> },
}

impl ResponseSink {
    pub fn buffered() -> Self {
        Self::Buffered { body: None }
    }

    pub fn stream(tx: mpsc::Sender<String>) -> Self {
        Self::Stream { tx }
    }

    pub fn take_body(&mut self) -> Option<Value> {
        match self {
            Self::Buffered { body } => body.take(),
            Self::Stream { .. } => None,
        }
    }
}

/// The uniform capability set every provider implements.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full provider URL for this request. Must fail rather than produce a
    /// malformed URL.
    fn request_url(&self, meta: &RequestMeta) -> Result<String>;

    /// Auth and ecosystem headers. Async because some providers exchange
    /// their long-lived key for a short-lived token first.
    async fn setup_headers(&self, meta: &RequestMeta, headers: &mut HeaderMap) -> Result<()>;

    /// Rewrite a Chat-Completions payload into the provider's native form.
    fn convert_request(&self, meta: &RequestMeta, body: ChatRequest) -> Result<Value>;

    /// Rewrite a Claude-Messages payload into the provider's native form.
    fn convert_claude_request(&self, meta: &RequestMeta, body: ClaudeRequest) -> Result<Value>;

    /// Rewrite an image request. The default maps the model and fills the
    /// size/quality defaults providers reject when absent.
    fn convert_image_request(&self, meta: &RequestMeta, mut body: Value) -> Result<Value> {
        if let Some(map) = body.as_object_mut() {
            map.insert("model".into(), Value::String(meta.actual_model.clone()));
            map.entry("n").or_insert(Value::from(1));
            map.entry("size").or_insert(Value::from("1024x1024"));
        }
        Ok(body)
    }

    /// Issue the call on the shared relay pool.
    async fn do_request(&self, meta: &RequestMeta, payload: &Value) -> Result<reqwest::Response> {
        let url = self.request_url(meta)?;
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        if meta.is_stream {
            headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        }
        self.setup_headers(meta, &mut headers).await?;
        manifold_net::clients()
            .relay
            .post(url)
            .headers(headers)
            .json(payload)
            .send()
            .await
            .map_err(|e| RelayError::transport(format!("{}: {e}", self.name())))
    }

    /// Consume the upstream response, streaming or buffered, and report the
    /// observed usage.
    async fn do_response(
        &self,
        meta: &RequestMeta,
        response: reqwest::Response,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        relay_openai_response(meta, response, sink).await
    }

    /// Hook after a successful buffered Claude-dialect exchange; adaptors
    /// that track response state (thinking signatures) override this.
    fn observe_claude_response(&self, _meta: &RequestMeta, _request: &ClaudeRequest, _body: &Value) {
    }

    /// Adaptor default pricing table.
    fn model_ratios(&self) -> &'static ModelRatios;

    /// Channel override → adaptor default → zero.
    fn price_for(&self, meta: &RequestMeta) -> ModelPrice {
        resolve(&meta.config, self.model_ratios(), &meta.actual_model)
    }

    fn completion_ratio(&self, meta: &RequestMeta) -> f64 {
        self.price_for(meta).completion_ratio()
    }
}

/// Resolve the shared adaptor instance for a channel kind. Instances are
/// process-wide so per-adaptor caches (Copilot tokens) persist.
pub fn adaptor_for(kind: manifold_core::ChannelKind) -> &'static dyn Adaptor {
    use manifold_core::ChannelKind;
    use std::sync::OnceLock;

    static OPENAI: OnceLock<crate::openai::OpenAiAdaptor> = OnceLock::new();
    static AZURE: OnceLock<crate::azure::AzureAdaptor> = OnceLock::new();
    static ANTHROPIC: OnceLock<crate::anthropic::AnthropicAdaptor> = OnceLock::new();
    static GEMINI: OnceLock<crate::gemini::GeminiAdaptor> = OnceLock::new();
    static COPILOT: OnceLock<crate::copilot::CopilotAdaptor> = OnceLock::new();
    static COMPAT: OnceLock<crate::compat::CompatAdaptor> = OnceLock::new();

    match kind {
        ChannelKind::OpenAi => OPENAI.get_or_init(crate::openai::OpenAiAdaptor::new),
        ChannelKind::Azure => AZURE.get_or_init(crate::azure::AzureAdaptor::new),
        ChannelKind::Anthropic => ANTHROPIC.get_or_init(crate::anthropic::AnthropicAdaptor::new),
        ChannelKind::Gemini => GEMINI.get_or_init(crate::gemini::GeminiAdaptor::new),
        ChannelKind::Copilot => COPILOT.get_or_init(crate::copilot::CopilotAdaptor::new),
        ChannelKind::DeepSeek
        | ChannelKind::Groq
        | ChannelKind::Mistral
        | ChannelKind::Cohere
        | ChannelKind::OpenAiCompatible => COMPAT.get_or_init(crate::compat::CompatAdaptor::new),
    }
}

/// Join a base URL and a provider path, validating the result.
pub fn join_url(base: &str, path: &str) -> Result<String> {
    let joined = format!("{}{}", base.trim_end_matches('/'), path);
    Url::parse(&joined)
        .map_err(|e| RelayError::internal(format!("malformed upstream url {joined}: {e}")))?;
    Ok(joined)
}

/// Shared response handling for every OpenAI-shaped upstream. Claude-dialect
/// callers on such channels go through the chat↔claude bridge.
pub async fn relay_openai_response(
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
            if meta.mode == RelayMode::ClaudeMessages && !meta.channel_kind.speaks_claude() {
                return crate::bridge::pump_chat_to_claude(response, meta, tx).await;
            }
            let mut ctx = StreamContext::new(meta.prompt_tokens);
            if meta.thinking_enabled {
                ctx = ctx.with_thinking(meta.reasoning_format);
            }
            pump_sse(response, &mut ctx, tx).await
        }
        ResponseSink::Buffered { body } => {
            let text = response
                .text()
                .await
                .map_err(|e| RelayError::transport(format!("reading upstream body: {e}")))?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|_| RelayError::server(502, "upstream returned non-json body").with_raw(&text))?;
            if let Some(err) = detect_error_envelope(status, &value) {
                return Err(err);
            }

            let usage = extract_usage(&value).unwrap_or_else(|| synthesized_usage(meta, &value));

            if meta.mode == RelayMode::ClaudeMessages && !meta.channel_kind.speaks_claude() {
                let chat: ChatResponse = serde_json::from_value(value)?;
                let claude = crate::bridge::chat_response_to_claude(&chat, meta);
                *body = Some(serde_json::to_value(claude)?);
            } else {
                *body = Some(value);
            }
            Ok(usage)
        }
    }
}

/// Provider error envelopes inside a 2xx body. An empty message object
/// (`{"error":{"message":"",…}}`) does not count.
pub fn detect_error_envelope(status: u16, value: &Value) -> Option<RelayError> {
    let error = value.get("error")?;
    let message = error["message"].as_str().unwrap_or_default();
    if message.is_empty() {
        return None;
    }
    Some(
        typed_error(status.max(400), message, error["type"].as_str(), error["code"].as_str())
            .with_raw(&value.to_string()),
    )
}

/// Parse a non-2xx upstream body into a typed error.
pub fn error_from_body(status: u16, body: &str) -> RelayError {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let error = if value["error"].is_object() {
            &value["error"]
        } else {
            &value
        };
        let message = error["message"]
            .as_str()
            .filter(|m| !m.is_empty())
            .unwrap_or("upstream request failed");
        return typed_error(status, message, error["type"].as_str(), error["code"].as_str())
            .with_raw(body);
    }
    typed_error(status, "upstream request failed", None, None).with_raw(body)
}

fn typed_error(
    status: u16,
    message: &str,
    provider_type: Option<&str>,
    provider_code: Option<&str>,
) -> RelayError {
    let kind = match provider_type {
        Some("authentication_error") | Some("authentication") => ErrorKind::Authentication,
        Some("permission_error") | Some("permission") => ErrorKind::Permission,
        Some("insufficient_quota") => ErrorKind::InsufficientQuota,
        Some("forbidden") => ErrorKind::Forbidden,
        Some("rate_limit_error") | Some("rate_limit_exceeded") => ErrorKind::RateLimit,
        _ => match status {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Permission,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::BadRequest,
            _ => ErrorKind::Server,
        },
    };
    let mut err = RelayError::new(kind, status, message.to_string());
    if let Some(code) = provider_code.or(provider_type) {
        err = err.with_code(code);
    }
    err
}

/// OpenAI-shaped usage block, when present.
pub fn extract_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let prompt = usage["prompt_tokens"]
        .as_u64()
        .or_else(|| usage["input_tokens"].as_u64())?;
    let completion = usage["completion_tokens"]
        .as_u64()
        .or_else(|| usage["output_tokens"].as_u64())
        .unwrap_or(0);
    let mut out = Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
        cached_tokens: usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .or_else(|| usage["cache_read_input_tokens"].as_u64()),
        ..Default::default()
    };
    out.ensure_total();
    Some(out)
}

/// Usage synthesized from the response body when the provider omits it.
fn synthesized_usage(meta: &RequestMeta, value: &Value) -> Usage {
    let mut text_len = 0usize;
    if let Some(choices) = value["choices"].as_array() {
        for choice in choices {
            if let Some(content) = choice["message"]["content"].as_str() {
                text_len += content.len();
            }
            if let Some(calls) = choice["message"]["tool_calls"].as_array() {
                for call in calls {
                    if let Some(args) = call["function"]["arguments"].as_str() {
                        text_len += args.len();
                    }
                }
            }
        }
    }
    if let Some(content) = value["content"].as_array() {
        for block in content {
            if let Some(text) = block["text"].as_str() {
                text_len += text.len();
            }
        }
    }
    let mut usage = Usage {
        prompt_tokens: meta.prompt_tokens,
        completion_tokens: (text_len as u64).div_ceil(4),
        ..Default::default()
    };
    usage.ensure_total();
    usage
}
