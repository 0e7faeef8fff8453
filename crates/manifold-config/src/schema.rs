use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use manifold_core::{ChannelKind, ChannelStatus};

/// Root configuration — maps to `manifold.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifoldConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
    pub billing: BillingConfig,
    pub net: NetConfig,
    pub logging: LoggingConfig,
    pub seed: SeedConfig,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".into(),
            cors: true,
        }
    }
}

// ── Auth ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Prefix stripped from presented keys. `sk-` and `laisky-` are always
    /// accepted alongside it for compatibility.
    pub key_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_prefix: "sk-".into(),
        }
    }
}

// ── Relay ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a channel stays suspended after a rate/auth signal.
    pub suspend_secs: u64,
    /// TTL for the channel/ability cache projection.
    pub cache_ttl_secs: u64,
    /// TTL for cached Claude thinking signatures.
    pub signature_ttl_secs: u64,
    /// Maximum cross-channel attempts per request.
    pub max_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            suspend_secs: 60,
            cache_ttl_secs: 60,
            signature_ttl_secs: 3600,
            max_attempts: 5,
        }
    }
}

// ── Billing ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Quota units per token at ratio 1.0.
    pub quota_per_token: f64,
    /// Per-group price multipliers; groups absent here use 1.0.
    pub group_ratios: HashMap<String, f64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            quota_per_token: 1.0,
            group_ratios: HashMap::new(),
        }
    }
}

impl BillingConfig {
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }
}

// ── Net ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub relay_timeout_secs: u64,
    pub impatient_timeout_secs: u64,
    /// Refuse user-content fetches resolving to internal addresses.
    pub block_internal: bool,
    pub proxy: Option<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            relay_timeout_secs: 600,
            impatient_timeout_secs: 5,
            block_internal: true,
            proxy: None,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter, e.g. "info" or "manifold=debug,tower_http=warn".
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

// ── Seed data for standalone runs ──────────────────────────────

/// Channels and tokens loaded into the in-memory store when no external
/// store is wired up. Production deployments leave this empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub channels: Vec<SeedChannel>,
    pub tokens: Vec<SeedToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedChannel {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    pub base_url: String,
    pub key: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SeedChannel {
    pub fn into_channel(self) -> manifold_core::Channel {
        let groups: HashSet<String> = if self.groups.is_empty() {
            ["default".to_string()].into_iter().collect()
        } else {
            self.groups.into_iter().collect()
        };
        manifold_core::Channel {
            id: self.id,
            name: self.name,
            kind: self.kind,
            base_url: self.base_url,
            key: self.key,
            models: self.models.into_iter().collect(),
            endpoints: self.endpoints.into_iter().collect(),
            priority: self.priority,
            status: ChannelStatus::Enabled,
            groups,
            model_mapping: self.model_mapping,
            system_prompt: self.system_prompt,
            rate_limit: self.rate_limit,
            config: self.config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedToken {
    pub id: i64,
    #[serde(default)]
    pub user_id: i64,
    pub key: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub remaining_quota: Option<i64>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub admin: bool,
}

fn default_group() -> String {
    "default".into()
}

impl SeedToken {
    pub fn into_token(self) -> manifold_core::Token {
        manifold_core::Token {
            id: self.id,
            user_id: self.user_id,
            key: self.key,
            group: self.group,
            remaining_quota: self.remaining_quota,
            allowed_models: self.allowed_models.into_iter().collect(),
            subnets: self.subnets,
            status: manifold_core::TokenStatus::Enabled,
            admin: self.admin,
        }
    }
}

impl ManifoldConfig {
    /// Validate; returns warnings for odd-but-workable settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("server.listen is not an address: {}", self.server.listen));
        }
        if self.relay.max_attempts == 0 {
            return Err("relay.max_attempts must be at least 1".into());
        }
        if self.billing.quota_per_token <= 0.0 {
            return Err("billing.quota_per_token must be positive".into());
        }
        for (group, ratio) in &self.billing.group_ratios {
            if *ratio < 0.0 {
                return Err(format!("billing.group_ratios.{group} is negative"));
            }
            if *ratio == 0.0 {
                warnings.push(format!("group {group} has ratio 0 — requests there are free"));
            }
        }
        for ch in &self.seed.channels {
            if ch.models.is_empty() {
                warnings.push(format!("seed channel {} declares no models", ch.name));
            }
        }
        Ok(warnings)
    }
}
