use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::sync::OnceLock;

use crate::adaptor::{Adaptor, join_url};
use crate::dialect::claude::ClaudeRequest;
use crate::dialect::openai::ChatRequest;
use crate::pricing::{ModelPrice, ModelRatios};
use manifold_core::{RelayError, RelayMode, RequestMeta, Result};

/// The OpenAI-compatible family: DeepSeek, Groq, Mistral, Cohere's compat
/// surface, and anything self-hosted that speaks the dialect. Conservative
/// about request fields: strips everything the narrowest members reject and
/// coerces tool message content to plain strings.
pub struct CompatAdaptor;

impl CompatAdaptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompatAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for CompatAdaptor {
    fn name(&self) -> &'static str {
        "openai_compatible"
    }

    fn request_url(&self, meta: &RequestMeta) -> Result<String> {
        let path = match meta.mode {
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => "/chat/completions",
            RelayMode::Completions => "/completions",
            RelayMode::Embeddings => "/embeddings",
            RelayMode::Rerank => "/rerank",
            other => {
                return Err(RelayError::bad_request(format!(
                    "channel does not serve {}",
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
        body.reasoning = None;
        body.reasoning_effort = None;
        body.top_k = None;
        body.response_format = None;
        body.thinking = None;
        for msg in &mut body.messages {
            if msg.role == "tool" {
                msg.coerce_content_to_string();
            }
        }
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
            m.insert("deepseek-chat", ModelPrice::tokens(0.27, 1.1));
            m.insert("deepseek-reasoner", ModelPrice::tokens(0.55, 2.19));
            m.insert("llama-3.3-70b-versatile", ModelPrice::tokens(0.59, 0.79));
            m.insert("mistral-large", ModelPrice::tokens(2.0, 6.0));
            m.insert("command-r-plus", ModelPrice::tokens(2.5, 10.0));
            m.insert("rerank-v3.5", ModelPrice::tokens(0.05, 0.0));
            m
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> RequestMeta {
        RequestMeta {
            request_id: "r".into(),
            origin_model: "deepseek-chat".into(),
            actual_model: "deepseek-chat".into(),
            mode: RelayMode::ChatCompletions,
            channel_id: 1,
            channel_kind: manifold_core::ChannelKind::DeepSeek,
            base_url: "https://api.deepseek.com/v1".into(),
            api_key: "dk".into(),
            is_stream: false,
            prompt_tokens: 1,
            group: "default".into(),
            system_prompt: None,
            reasoning_format: Default::default(),
            thinking_enabled: false,
            token_id: 1,
            config: Value::Null,
        }
    }

    #[test]
    fn tool_message_arrays_become_strings() {
        let a = CompatAdaptor::new();
        let body: ChatRequest = serde_json::from_value(json!({
            "model": "deepseek-chat",
            "messages": [
                {"role": "user", "content": "run it"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "run", "arguments": "{}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1",
                 "content": [{"type": "text", "text": "exit 0"}]}
            ]
        }))
        .unwrap();
        let out = a.convert_request(&meta(), body).unwrap();
        assert_eq!(out["messages"][2]["content"], "exit 0");
    }

    #[test]
    fn rejected_fields_are_stripped() {
        let a = CompatAdaptor::new();
        let body: ChatRequest = serde_json::from_value(json!({
            "model": "deepseek-chat",
            "reasoning": {"effort": "high"},
            "response_format": {"type": "json_object"},
            "top_k": 3,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let out = a.convert_request(&meta(), body).unwrap();
        for field in ["reasoning", "response_format", "top_k"] {
            assert!(out.get(field).is_none(), "{field} should be stripped");
        }
    }
}
