use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

// ── Relay mode ─────────────────────────────────────────────────

/// Endpoint-kind tag derived from the public request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    ImagesEdits,
    ImagesVariations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    ResponseApi,
    ClaudeMessages,
    Rerank,
    Realtime,
    Video,
}

impl RelayMode {
    /// Resolve a canonical `/v1/...` path to its relay mode.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/v1/chat/completions" => Some(Self::ChatCompletions),
            "/v1/completions" => Some(Self::Completions),
            "/v1/embeddings" => Some(Self::Embeddings),
            "/v1/moderations" => Some(Self::Moderations),
            "/v1/images/generations" => Some(Self::ImagesGenerations),
            "/v1/images/edits" => Some(Self::ImagesEdits),
            "/v1/images/variations" => Some(Self::ImagesVariations),
            "/v1/audio/speech" => Some(Self::AudioSpeech),
            "/v1/audio/transcriptions" => Some(Self::AudioTranscription),
            "/v1/audio/translations" => Some(Self::AudioTranslation),
            "/v1/responses" => Some(Self::ResponseApi),
            "/v1/messages" => Some(Self::ClaudeMessages),
            "/v1/rerank" => Some(Self::Rerank),
            "/v1/realtime" => Some(Self::Realtime),
            "/v1/videos" => Some(Self::Video),
            _ => None,
        }
    }

    /// The endpoint name channels declare in `supported_endpoints`.
    /// Image/audio variants share a family name.
    pub fn endpoint_name(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::ImagesGenerations | Self::ImagesEdits | Self::ImagesVariations => "images",
            Self::AudioSpeech | Self::AudioTranscription | Self::AudioTranslation => "audio",
            Self::ResponseApi => "response_api",
            Self::ClaudeMessages => "claude_messages",
            Self::Rerank => "rerank",
            Self::Realtime => "realtime",
            Self::Video => "video",
        }
    }

    /// Whether this mode is served over a websocket upgrade.
    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Realtime)
    }
}

// ── Channel ────────────────────────────────────────────────────

/// Upstream provider family a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    OpenAi,
    Azure,
    Anthropic,
    Gemini,
    Copilot,
    DeepSeek,
    Groq,
    Mistral,
    Cohere,
    /// Any other service speaking the OpenAI chat-completions dialect.
    OpenAiCompatible,
}

impl ChannelKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Copilot => "copilot",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::Mistral => "mistral",
            Self::Cohere => "cohere",
            Self::OpenAiCompatible => "openai_compatible",
        }
    }

    /// Endpoints a channel of this kind serves when it declares none itself.
    pub fn default_endpoints(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &[
                "chat_completions",
                "completions",
                "embeddings",
                "moderations",
                "images",
                "audio",
                "response_api",
                "claude_messages",
                "realtime",
                "video",
            ],
            Self::Azure => &[
                "chat_completions",
                "completions",
                "embeddings",
                "images",
                "audio",
                "claude_messages",
            ],
            Self::Anthropic => &["claude_messages", "chat_completions"],
            Self::Gemini => &["chat_completions", "claude_messages", "embeddings"],
            Self::Copilot => &["chat_completions", "claude_messages"],
            Self::DeepSeek | Self::Groq | Self::Mistral => {
                &["chat_completions", "completions", "claude_messages"]
            }
            Self::Cohere => &["chat_completions", "embeddings", "rerank"],
            Self::OpenAiCompatible => &["chat_completions", "completions", "embeddings"],
        }
    }

    /// Kinds that can serve the Response API over a websocket before the
    /// client has named a model.
    pub fn supports_response_api_ws(self) -> bool {
        matches!(self, Self::OpenAi | Self::Azure)
    }

    /// Whether the upstream speaks the Claude Messages dialect natively.
    /// Everything else reaches Claude callers through the chat bridge.
    pub fn speaks_claude(self) -> bool {
        matches!(self, Self::Anthropic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    /// Disabled by the gateway itself after repeated upstream failures.
    AutoDisabled,
}

/// A configured upstream provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    pub base_url: String,
    pub key: String,
    pub models: HashSet<String>,
    /// Declared endpoint names; empty means the kind's defaults apply.
    #[serde(default)]
    pub endpoints: HashSet<String>,
    pub priority: i32,
    pub status: ChannelStatus,
    pub groups: HashSet<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Requests per minute, when set.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    /// Kind-specific settings (api-version, deployment names, …).
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Channel {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Declared endpoints override the kind defaults when non-empty.
    /// Comparison is case-insensitive on the endpoint name.
    pub fn supports_endpoint(&self, mode: RelayMode) -> bool {
        let name = mode.endpoint_name();
        if self.endpoints.is_empty() {
            self.kind.default_endpoints().contains(&name)
        } else {
            self.endpoints.iter().any(|e| e.eq_ignore_ascii_case(name))
        }
    }

    /// Websocket transport is only valid for modes served over ws, and only
    /// on kinds that admit it.
    pub fn supports_transport(&self, mode: RelayMode, websocket: bool) -> bool {
        if !websocket {
            return !mode.is_websocket();
        }
        match mode {
            RelayMode::Realtime | RelayMode::ResponseApi => self.kind.supports_response_api_ws(),
            _ => false,
        }
    }

    /// Apply the channel's model mapping; identity when unmapped.
    pub fn mapped_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

/// Materialized `(group, model, channel)` routing tuple. The selector
/// queries abilities rather than channels so stale mappings are detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub priority: i32,
    pub enabled: bool,
}

// ── Token ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

/// A tenant-scoped API credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub group: String,
    /// `None` means unlimited.
    pub remaining_quota: Option<i64>,
    /// Empty set means every model is allowed.
    #[serde(default)]
    pub allowed_models: HashSet<String>,
    /// CIDR strings; empty means any source address.
    #[serde(default)]
    pub subnets: Vec<String>,
    pub status: TokenStatus,
    /// Whether the owning user may pin channels with a `-{id}` key suffix.
    #[serde(default)]
    pub admin: bool,
}

impl Token {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.contains(model)
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.subnets.is_empty() || self.subnets.iter().any(|c| cidr_contains(c, ip))
    }
}

/// Check whether `ip` falls inside the CIDR block `cidr` ("10.0.0.0/8",
/// "2001:db8::/32", or a bare address). Malformed blocks never match.
pub fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let (net, bits) = match cidr.split_once('/') {
        Some((net, bits)) => {
            let Ok(bits) = bits.parse::<u32>() else {
                return false;
            };
            (net, bits)
        }
        None => (cidr, u32::MAX),
    };
    let Ok(net) = net.parse::<IpAddr>() else {
        return false;
    };
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let bits = if bits == u32::MAX { 32 } else { bits.min(32) };
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let bits = if bits == u32::MAX { 128 } else { bits.min(128) };
            let mask = if bits == 0 {
                0
            } else {
                u128::MAX << (128 - bits)
            };
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

// ── Usage ──────────────────────────────────────────────────────

/// Observed consumption for one settled request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tools_cost: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_seconds: Option<f64>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Usage {
    /// Enforce `total = prompt + completion` unless the provider already
    /// reported a total.
    pub fn ensure_total(&mut self) {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
    }
}

/// ~4 chars per token, rounded up, minimum 1. Used wherever the upstream
/// gives no count.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as u64).div_ceil(4)).max(1)
}

// ── Reasoning format ───────────────────────────────────────────

/// Where extracted chain-of-thought is carried in the response, selected by
/// the caller's `reasoning_format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    #[default]
    ReasoningContent,
    Thinking,
    Reasoning,
}

impl ReasoningFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reasoning_content" => Some(Self::ReasoningContent),
            "thinking" => Some(Self::Thinking),
            "reasoning" => Some(Self::Reasoning),
            _ => None,
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            Self::ReasoningContent => "reasoning_content",
            Self::Thinking => "thinking",
            Self::Reasoning => "reasoning",
        }
    }
}

// ── Request meta ───────────────────────────────────────────────

/// Per-request descriptor produced by ingress/auth/distribution and handed
/// down to the adaptor and billing layers. One-shot value, never shared
/// mutably across layers.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    /// Model the caller asked for.
    pub origin_model: String,
    /// Model sent upstream after the channel's mapping.
    pub actual_model: String,
    pub mode: RelayMode,
    pub channel_id: i64,
    pub channel_kind: ChannelKind,
    pub base_url: String,
    pub api_key: String,
    pub is_stream: bool,
    /// Pre-estimated prompt tokens, used for reservation and usage fallback.
    pub prompt_tokens: u64,
    pub group: String,
    pub system_prompt: Option<String>,
    pub reasoning_format: ReasoningFormat,
    /// Whether thinking translation was requested (`?thinking=true`).
    pub thinking_enabled: bool,
    pub token_id: i64,
    /// Channel kind-specific settings.
    pub config: serde_json::Value,
}

impl RequestMeta {
    pub fn new_request_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_mode_from_canonical_paths() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions"),
            Some(RelayMode::ChatCompletions)
        );
        assert_eq!(
            RelayMode::from_path("/v1/messages"),
            Some(RelayMode::ClaudeMessages)
        );
        assert_eq!(RelayMode::from_path("/v1/realtime"), Some(RelayMode::Realtime));
        assert_eq!(RelayMode::from_path("/v2/none"), None);
    }

    #[test]
    fn endpoint_match_is_case_insensitive() {
        let mut ch = channel_fixture();
        ch.endpoints = ["Chat_Completions".to_string()].into_iter().collect();
        assert!(ch.supports_endpoint(RelayMode::ChatCompletions));
        assert!(!ch.supports_endpoint(RelayMode::Embeddings));
    }

    #[test]
    fn empty_endpoint_set_uses_kind_defaults() {
        let ch = channel_fixture();
        assert!(ch.supports_endpoint(RelayMode::ChatCompletions));
        assert!(ch.supports_endpoint(RelayMode::ResponseApi));
        let mut anthropic = channel_fixture();
        anthropic.kind = ChannelKind::Anthropic;
        assert!(anthropic.supports_endpoint(RelayMode::ClaudeMessages));
        assert!(!anthropic.supports_endpoint(RelayMode::Embeddings));
    }

    #[test]
    fn cidr_membership() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(cidr_contains("10.0.0.0/8", ip));
        assert!(!cidr_contains("192.168.0.0/16", ip));
        assert!(cidr_contains("10.1.2.3", ip));
        assert!(!cidr_contains("not-a-cidr", ip));
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(cidr_contains("2001:db8::/32", v6));
        assert!(!cidr_contains("10.0.0.0/8", v6));
    }

    #[test]
    fn token_model_whitelist() {
        let mut tok = token_fixture();
        assert!(tok.allows_model("gpt-4o"));
        tok.allowed_models = ["gpt-4o-mini".to_string()].into_iter().collect();
        assert!(!tok.allows_model("gpt-4o"));
        assert!(tok.allows_model("gpt-4o-mini"));
    }

    #[test]
    fn usage_total_is_filled_not_overwritten() {
        let mut u = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            ..Default::default()
        };
        u.ensure_total();
        assert_eq!(u.total_tokens, 15);

        let mut reported = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 99,
            ..Default::default()
        };
        reported.ensure_total();
        assert_eq!(reported.total_tokens, 99);
    }

    fn channel_fixture() -> Channel {
        Channel {
            id: 1,
            name: "test".into(),
            kind: ChannelKind::OpenAi,
            base_url: "https://api.openai.com".into(),
            key: "sk-test".into(),
            models: ["gpt-4o".to_string()].into_iter().collect(),
            endpoints: HashSet::new(),
            priority: 0,
            status: ChannelStatus::Enabled,
            groups: ["default".to_string()].into_iter().collect(),
            model_mapping: HashMap::new(),
            system_prompt: None,
            rate_limit: None,
            config: serde_json::Value::Null,
        }
    }

    fn token_fixture() -> Token {
        Token {
            id: 1,
            user_id: 1,
            key: "abc".into(),
            group: "default".into(),
            remaining_quota: Some(1_000_000),
            allowed_models: HashSet::new(),
            subnets: vec![],
            status: TokenStatus::Enabled,
            admin: false,
        }
    }
}
