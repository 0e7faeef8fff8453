use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::sync::OnceLock;

use crate::adaptor::{Adaptor, join_url};
use crate::dialect::claude::ClaudeRequest;
use crate::dialect::openai::ChatRequest;
use crate::pricing::{ModelPrice, ModelRatios};
use manifold_core::{RelayError, RelayMode, RequestMeta, Result};

/// OpenAI proper. Base URLs include the `/v1` segment.
pub struct OpenAiAdaptor;

impl OpenAiAdaptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpenAiAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn request_url(&self, meta: &RequestMeta) -> Result<String> {
        let path = match meta.mode {
            // Claude-dialect callers are bridged onto chat completions.
            RelayMode::ChatCompletions | RelayMode::ClaudeMessages => "/chat/completions",
            RelayMode::Completions => "/completions",
            RelayMode::Embeddings => "/embeddings",
            RelayMode::Moderations => "/moderations",
            RelayMode::ImagesGenerations => "/images/generations",
            RelayMode::ImagesEdits => "/images/edits",
            RelayMode::ImagesVariations => "/images/variations",
            RelayMode::AudioSpeech => "/audio/speech",
            RelayMode::AudioTranscription => "/audio/transcriptions",
            RelayMode::AudioTranslation => "/audio/translations",
            RelayMode::ResponseApi => "/responses",
            RelayMode::Video => "/videos",
            RelayMode::Realtime => {
                return Ok(format!(
                    "{}/realtime?model={}",
                    meta.base_url.trim_end_matches('/'),
                    meta.actual_model
                ));
            }
            RelayMode::Rerank => {
                return Err(RelayError::bad_request("openai channels do not serve rerank"));
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
        // OpenAI rejects these outright.
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
        self.convert_request(meta, crate::bridge::claude_to_chat(&body))
    }

    fn model_ratios(&self) -> &'static ModelRatios {
        static RATIOS: OnceLock<ModelRatios> = OnceLock::new();
        RATIOS.get_or_init(|| {
            let mut m = ModelRatios::new();
            m.insert("gpt-4o", ModelPrice::tokens(2.5, 10.0));
            m.insert("gpt-4o-mini", ModelPrice::tokens(0.15, 0.6));
            m.insert("gpt-4.1", ModelPrice::tokens(2.0, 8.0));
            m.insert("gpt-4.1-mini", ModelPrice::tokens(0.4, 1.6));
            m.insert("gpt-5", ModelPrice::tokens(1.25, 10.0));
            m.insert("gpt-5-mini", ModelPrice::tokens(0.25, 2.0));
            m.insert("gpt-5-nano", ModelPrice::tokens(0.05, 0.4));
            m.insert("o1", ModelPrice::tokens(15.0, 60.0));
            m.insert("o3", ModelPrice::tokens(10.0, 40.0));
            m.insert("o3-mini", ModelPrice::tokens(1.1, 4.4));
            m.insert("o4-mini", ModelPrice::tokens(1.1, 4.4));
            m.insert("text-embedding-3-small", ModelPrice::tokens(0.02, 0.0));
            m.insert("text-embedding-3-large", ModelPrice::tokens(0.13, 0.0));
            m.insert("dall-e-3", ModelPrice::image(40.0));
            m.insert("gpt-image-1", ModelPrice::image(40.0));
            m.insert(
                "whisper-1",
                ModelPrice {
                    input: 0.006,
                    output: 0.0,
                    per_image: None,
                    audio_tokens_per_second: Some(16.7),
                    video_per_second: None,
                },
            );
            m.insert(
                "sora-2",
                ModelPrice {
                    input: 0.0,
                    output: 0.0,
                    per_image: None,
                    audio_tokens_per_second: None,
                    video_per_second: Some(100.0),
                },
            );
            m
        })
    }
}

/// Models that take `max_completion_tokens` instead of `max_tokens`.
pub fn uses_max_completion_tokens(model: &str) -> bool {
    let m = model.to_lowercase();
    m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") || m.contains("gpt-5")
}
