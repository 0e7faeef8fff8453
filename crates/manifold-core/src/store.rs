//! Store traits behind which all persistence lives.
//!
//! The gateway core performs exactly three kinds of mutation: token quota
//! adjustments, channel status flips, and one log row per settled request.
//! Schema and migrations belong to the admin layer; the in-memory store here
//! backs tests and standalone runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{RelayError, Result};
use crate::types::{Channel, ChannelStatus, Token, Usage};

/// One row per settled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayLogEntry {
    pub request_id: String,
    pub token_id: i64,
    pub channel_id: i64,
    pub mode: String,
    pub model: String,
    pub status: u16,
    pub error_kind: Option<String>,
    pub duration_ms: u64,
    pub usage: Usage,
    /// Quota units actually charged.
    pub quota_cost: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn token_by_key(&self, key: &str) -> Result<Option<Token>>;

    /// Atomically adjust a token's remaining quota. Negative `delta`
    /// charges; positive refunds. Unlimited tokens ignore the call.
    /// Fails when a charge would push the balance below zero.
    async fn adjust_quota(&self, token_id: i64, delta: i64) -> Result<()>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn channels(&self) -> Result<Vec<Channel>>;
    async fn set_status(&self, channel_id: i64, status: ChannelStatus) -> Result<()>;
}

#[async_trait]
pub trait RelayLogStore: Send + Sync {
    async fn record(&self, entry: RelayLogEntry) -> Result<()>;
}

/// In-memory store for tests and standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    tokens: RwLock<HashMap<i64, Token>>,
    channels: RwLock<Vec<Channel>>,
    logs: RwLock<Vec<RelayLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_token(&self, token: Token) {
        self.tokens.write().unwrap().insert(token.id, token);
    }

    pub fn seed_channel(&self, channel: Channel) {
        self.channels.write().unwrap().push(channel);
    }

    pub fn remaining_quota(&self, token_id: i64) -> Option<Option<i64>> {
        self.tokens
            .read()
            .unwrap()
            .get(&token_id)
            .map(|t| t.remaining_quota)
    }

    pub fn logged(&self) -> Vec<RelayLogEntry> {
        self.logs.read().unwrap().clone()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn token_by_key(&self, key: &str) -> Result<Option<Token>> {
        Ok(self
            .tokens
            .read()
            .unwrap()
            .values()
            .find(|t| t.key == key)
            .cloned())
    }

    async fn adjust_quota(&self, token_id: i64, delta: i64) -> Result<()> {
        let mut tokens = self.tokens.write().unwrap();
        let token = tokens
            .get_mut(&token_id)
            .ok_or_else(|| RelayError::internal(format!("unknown token id {token_id}")))?;
        let Some(remaining) = token.remaining_quota else {
            return Ok(());
        };
        let next = remaining + delta;
        if next < 0 {
            return Err(RelayError::insufficient_quota(
                "insufficient token quota".to_string(),
            ));
        }
        token.remaining_quota = Some(next);
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn channels(&self) -> Result<Vec<Channel>> {
        Ok(self.channels.read().unwrap().clone())
    }

    async fn set_status(&self, channel_id: i64, status: ChannelStatus) -> Result<()> {
        let mut channels = self.channels.write().unwrap();
        if let Some(ch) = channels.iter_mut().find(|c| c.id == channel_id) {
            ch.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl RelayLogStore for MemoryStore {
    async fn record(&self, entry: RelayLogEntry) -> Result<()> {
        self.logs.write().unwrap().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenStatus;
    use std::collections::HashSet;

    fn token(quota: Option<i64>) -> Token {
        Token {
            id: 7,
            user_id: 1,
            key: "k".into(),
            group: "default".into(),
            remaining_quota: quota,
            allowed_models: HashSet::new(),
            subnets: vec![],
            status: TokenStatus::Enabled,
            admin: false,
        }
    }

    #[tokio::test]
    async fn quota_charge_and_refund() {
        let store = MemoryStore::new();
        store.seed_token(token(Some(100)));
        store.adjust_quota(7, -40).await.unwrap();
        assert_eq!(store.remaining_quota(7), Some(Some(60)));
        store.adjust_quota(7, 15).await.unwrap();
        assert_eq!(store.remaining_quota(7), Some(Some(75)));
    }

    #[tokio::test]
    async fn overdraft_is_rejected() {
        let store = MemoryStore::new();
        store.seed_token(token(Some(10)));
        let err = store.adjust_quota(7, -11).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::InsufficientQuota);
        assert_eq!(store.remaining_quota(7), Some(Some(10)));
    }

    #[tokio::test]
    async fn unlimited_tokens_ignore_adjustments() {
        let store = MemoryStore::new();
        store.seed_token(token(None));
        store.adjust_quota(7, -1_000_000).await.unwrap();
        assert_eq!(store.remaining_quota(7), Some(None));
    }
}
