//! Model pricing. Resolution is three-layered: channel override → adaptor
//! default table → zero fallback. Token models price per token ratio, image
//! models per image, audio models per prompt-second, video models per
//! second at base resolution.

use serde_json::Value;
use std::collections::HashMap;

use manifold_core::Usage;

/// Price for one model, in quota units per token (or per image/second).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub per_image: Option<f64>,
    /// Audio is billed as prompt-seconds at this many tokens per second.
    pub audio_tokens_per_second: Option<f64>,
    /// Video is billed per second at base resolution.
    pub video_per_second: Option<f64>,
}

impl ModelPrice {
    pub const fn tokens(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            per_image: None,
            audio_tokens_per_second: None,
            video_per_second: None,
        }
    }

    pub const fn image(per_image: f64) -> Self {
        Self {
            input: 0.0,
            output: 0.0,
            per_image: Some(per_image),
            audio_tokens_per_second: None,
            video_per_second: None,
        }
    }

    /// Output-to-input ratio; 1.0 when input is free or unknown.
    pub fn completion_ratio(&self) -> f64 {
        if self.input > 0.0 {
            self.output / self.input
        } else {
            1.0
        }
    }
}

pub type ModelRatios = HashMap<&'static str, ModelPrice>;

/// Resolve the price for a model: channel `config.model_ratios` override
/// first, then the adaptor's table (exact match, then longest declared
/// prefix), then zero.
pub fn resolve(channel_config: &Value, defaults: &ModelRatios, model: &str) -> ModelPrice {
    if let Some(over) = channel_config["model_ratios"][model].as_object() {
        return ModelPrice {
            input: over.get("input").and_then(Value::as_f64).unwrap_or(0.0),
            output: over.get("output").and_then(Value::as_f64).unwrap_or(0.0),
            per_image: over.get("per_image").and_then(Value::as_f64),
            audio_tokens_per_second: over.get("audio_tokens_per_second").and_then(Value::as_f64),
            video_per_second: over.get("video_per_second").and_then(Value::as_f64),
        };
    }
    if let Some(price) = defaults.get(model) {
        return *price;
    }
    defaults
        .iter()
        .filter(|(k, _)| model.starts_with(*k))
        .max_by_key(|(k, _)| k.len())
        .map(|(_, p)| *p)
        .unwrap_or_default()
}

/// Quota units for one settled request.
pub fn quota_cost(usage: &Usage, price: &ModelPrice, group_ratio: f64, quota_per_token: f64) -> i64 {
    let mut units = usage.prompt_tokens as f64 * price.input
        + usage.completion_tokens as f64 * price.output
        + usage.tools_cost as f64;
    if let (Some(count), Some(per_image)) = (usage.image_count, price.per_image) {
        units += count as f64 * per_image;
    }
    if let (Some(seconds), Some(tps)) = (usage.audio_seconds, price.audio_tokens_per_second) {
        units += seconds * tps * price.input;
    }
    if let (Some(seconds), Some(per_second)) = (usage.video_seconds, price.video_per_second) {
        units += seconds * per_second;
    }
    (units * group_ratio * quota_per_token).ceil() as i64
}

/// Quota units reserved before dispatch, from the prompt estimate alone.
pub fn reservation_cost(
    prompt_tokens: u64,
    price: &ModelPrice,
    group_ratio: f64,
    quota_per_token: f64,
) -> i64 {
    (prompt_tokens as f64 * price.input * group_ratio * quota_per_token).ceil() as i64
}
