use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::sync::OnceLock;

use crate::adaptor::Adaptor;
use crate::dialect::claude::ClaudeRequest;
use crate::dialect::openai::ChatRequest;
use crate::openai::uses_max_completion_tokens;
use crate::pricing::{ModelPrice, ModelRatios};
use manifold_core::{RelayError, RelayMode, RequestMeta, Result};

const DEFAULT_API_VERSION: &str = "2024-06-01";

/// Known bad `(model, dialect)` pairs, kept as runtime heuristics rather
/// than channel capability flags.
const DIALECT_SKIPS: &[(&str, RelayMode)] = &[
    // Azure GPT-5 nano does not return structured JSON for Claude messages.
    ("gpt-5-nano", RelayMode::ClaudeMessages),
];

/// Azure OpenAI. Deployment-scoped URLs with an `api-version` query; the
/// deployment name is the mapped model.
pub struct AzureAdaptor;

impl AzureAdaptor {
    pub fn new() -> Self {
        Self
    }

    fn api_version(meta: &RequestMeta) -> String {
        meta.config["api_version"]
            .as_str()
            .unwrap_or(DEFAULT_API_VERSION)
            .to_string()
    }
}

impl Default for AzureAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for AzureAdaptor {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn request_url(&self, meta: &RequestMeta) -> Result<String> {
        let op = match meta.mode {
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => "chat/completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::ImagesGenerations => "images/generations",
            RelayMode::AudioSpeech => "audio/speech",
            RelayMode::AudioTranscription => "audio/transcriptions",
            RelayMode::AudioTranslation => "audio/translations",
            other => {
                return Err(RelayError::bad_request(format!(
                    "azure channels do not serve {}",
                    other.endpoint_name()
                )));
            }
        };
        // Deployment names reject dots.
        let deployment = meta.actual_model.replace('.', "");
        crate::adaptor::join_url(
            &meta.base_url,
            &format!(
                "/openai/deployments/{deployment}/{op}?api-version={}",
                Self::api_version(meta)
            ),
        )
    }

    async fn setup_headers(&self, meta: &RequestMeta, headers: &mut HeaderMap) -> Result<()> {
        let key = HeaderValue::from_str(&meta.api_key)
            .map_err(|_| RelayError::internal("channel key is not header-safe"))?;
        headers.insert("api-key", key);
        Ok(())
    }

    fn convert_request(&self, meta: &RequestMeta, mut body: ChatRequest) -> Result<Value> {
        body.model = meta.actual_model.clone();
        body.top_k = None;
        body.thinking = None;
        if uses_max_completion_tokens(&body.model) {
            body.max_completion_tokens = body.max_completion_tokens.or(body.max_tokens.take());
        }
        if body.is_stream() && body.stream_options.is_none() {
            body.stream_options = Some(json!({"include_usage": true}));
        }
        Ok(serde_json::to_value(body)?)
    }

    fn convert_claude_request(&self, meta: &RequestMeta, body: ClaudeRequest) -> Result<Value> {
        for (model, mode) in DIALECT_SKIPS {
            if meta.actual_model.contains(model) && meta.mode == *mode {
                return Err(RelayError::bad_request(format!(
                    "model {} cannot serve {} requests on this channel",
                    meta.actual_model,
                    meta.mode.endpoint_name()
                )));
            }
        }
        self.convert_request(meta, crate::bridge::claude_to_chat(&body))
    }

    fn model_ratios(&self) -> &'static ModelRatios {
        static RATIOS: OnceLock<ModelRatios> = OnceLock::new();
        RATIOS.get_or_init(|| {
            let mut m = ModelRatios::new();
            m.insert("gpt-4o", ModelPrice::tokens(2.5, 10.0));
            m.insert("gpt-4o-mini", ModelPrice::tokens(0.15, 0.6));
            m.insert("gpt-4.1", ModelPrice::tokens(2.0, 8.0));
            m.insert("gpt-5", ModelPrice::tokens(1.25, 10.0));
            m.insert("gpt-5-nano", ModelPrice::tokens(0.05, 0.4));
            m.insert("o3-mini", ModelPrice::tokens(1.1, 4.4));
            m.insert("text-embedding-3-small", ModelPrice::tokens(0.02, 0.0));
            m
        })
    }
}
