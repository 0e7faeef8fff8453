//! Cache for Claude `thinking` signatures.
//!
//! Claude authenticates a prior turn's thinking block on replay with an
//! opaque signature. Callers routinely strip it, so the gateway remembers
//! signatures per `(token, conversation, message, block)` and re-attaches
//! them on follow-up turns. A miss downgrades the block to `<think>` text
//! and disables thinking mode so the conversation stays valid.
//!
//! The conversation fingerprint is deterministic: blake3 over each prior
//! message's role and text projection, fields separated by `\n`, messages
//! by `\x1f`.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::dialect::claude::{ClaudeBlock, ClaudeContent, ClaudeMessage, ClaudeRequest};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    pub token_id: i64,
    pub fingerprint: [u8; 32],
    pub message_index: usize,
    pub block_index: usize,
}

struct Entry {
    signature: String,
    expires_at: Instant,
}

/// Bounded in-process signature store with TTL expiry.
pub struct SignatureCache {
    entries: DashMap<SignatureKey, Entry>,
    ttl: Duration,
}

impl SignatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Fingerprint of the conversation up to (excluding) `upto`.
    pub fn fingerprint(messages: &[ClaudeMessage], upto: usize) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for msg in &messages[..upto.min(messages.len())] {
            hasher.update(msg.role.as_bytes());
            hasher.update(b"\n");
            hasher.update(msg.text_content().as_bytes());
            hasher.update(b"\x1f");
        }
        *hasher.finalize().as_bytes()
    }

    pub fn store(&self, key: SignatureKey, signature: String) {
        self.entries.insert(
            key,
            Entry {
                signature,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn get(&self, key: &SignatureKey) -> Option<String> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.signature.clone()));
        match found {
            Some(Some(signature)) => Some(signature),
            Some(None) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-attach cached signatures to every signatureless thinking block in
    /// the request. When any block still lacks one, all thinking blocks
    /// collapse to `<think>…</think>` text and thinking mode is disabled.
    pub fn apply(&self, token_id: i64, request: &mut ClaudeRequest) {
        let mut missing = false;

        for msg_idx in 0..request.messages.len() {
            if request.messages[msg_idx].role != "assistant" {
                continue;
            }
            let fingerprint = Self::fingerprint(&request.messages, msg_idx);
            let ClaudeContent::Blocks(blocks) = &mut request.messages[msg_idx].content else {
                continue;
            };
            for (blk_idx, block) in blocks.iter_mut().enumerate() {
                let ClaudeBlock::Thinking { signature, .. } = block else {
                    continue;
                };
                if signature.is_some() {
                    continue;
                }
                let key = SignatureKey {
                    token_id,
                    fingerprint,
                    message_index: msg_idx,
                    block_index: blk_idx,
                };
                match self.get(&key) {
                    Some(sig) => *signature = Some(sig),
                    None => missing = true,
                }
            }
        }

        if missing {
            for msg in &mut request.messages {
                let ClaudeContent::Blocks(blocks) = &mut msg.content else {
                    continue;
                };
                for block in blocks.iter_mut() {
                    if let ClaudeBlock::Thinking { thinking, .. } = block {
                        *block = ClaudeBlock::Text {
                            text: format!("<think>{thinking}</think>"),
                        };
                    }
                }
            }
            request.thinking = None;
        }
    }

    /// Remember the signatures a response carried, keyed against the
    /// conversation the *next* turn will replay (this request's messages
    /// plus the assistant reply at the end).
    pub fn remember_response(
        &self,
        token_id: i64,
        request_messages: &[ClaudeMessage],
        response_blocks: &[ClaudeBlock],
    ) {
        let message_index = request_messages.len();
        let fingerprint = Self::fingerprint(request_messages, message_index);
        for (blk_idx, block) in response_blocks.iter().enumerate() {
            if let ClaudeBlock::Thinking {
                signature: Some(sig),
                ..
            } = block
            {
                self.store(
                    SignatureKey {
                        token_id,
                        fingerprint,
                        message_index,
                        block_index: blk_idx,
                    },
                    sig.clone(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::claude::ClaudeThinking;
    use serde_json::json;

    fn request_with_thinking_turn() -> ClaudeRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "messages": [
                {"role": "user", "content": "first question"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "prior chain"},
                    {"type": "text", "text": "prior answer"}
                ]},
                {"role": "user", "content": "follow-up"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_sensitive() {
        let req = request_with_thinking_turn();
        let a = SignatureCache::fingerprint(&req.messages, 1);
        let b = SignatureCache::fingerprint(&req.messages, 1);
        assert_eq!(a, b);
        assert_ne!(a, SignatureCache::fingerprint(&req.messages, 2));
    }

    #[test]
    fn cached_signature_is_reattached() {
        let cache = SignatureCache::new(Duration::from_secs(60));
        let mut req = request_with_thinking_turn();
        let key = SignatureKey {
            token_id: 9,
            fingerprint: SignatureCache::fingerprint(&req.messages, 1),
            message_index: 1,
            block_index: 0,
        };
        cache.store(key, "sig-abc".into());

        cache.apply(9, &mut req);
        let ClaudeContent::Blocks(blocks) = &req.messages[1].content else {
            panic!("expected blocks");
        };
        let ClaudeBlock::Thinking { signature, .. } = &blocks[0] else {
            panic!("expected thinking block");
        };
        assert_eq!(signature.as_deref(), Some("sig-abc"));
        assert!(req.thinking.is_some());
    }

    #[test]
    fn miss_downgrades_to_think_text_and_disables_thinking() {
        let cache = SignatureCache::new(Duration::from_secs(60));
        let mut req = request_with_thinking_turn();
        cache.apply(9, &mut req);

        let ClaudeContent::Blocks(blocks) = &req.messages[1].content else {
            panic!("expected blocks");
        };
        let ClaudeBlock::Text { text } = &blocks[0] else {
            panic!("expected text fallback, got {blocks:?}");
        };
        assert_eq!(text, "<think>prior chain</think>");
        assert!(req.thinking.is_none());
    }

    #[test]
    fn expired_entries_miss() {
        let cache = SignatureCache::new(Duration::from_millis(5));
        let mut req = request_with_thinking_turn();
        let key = SignatureKey {
            token_id: 9,
            fingerprint: SignatureCache::fingerprint(&req.messages, 1),
            message_index: 1,
            block_index: 0,
        };
        cache.store(key, "sig-abc".into());
        std::thread::sleep(Duration::from_millis(15));

        cache.apply(9, &mut req);
        assert!(req.thinking.is_none(), "expired entry must fall back");
        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn response_signatures_round_trip_to_next_turn() {
        let cache = SignatureCache::new(Duration::from_secs(60));
        // Turn 1: user asks; response carries a signed thinking block.
        let turn1: Vec<ClaudeMessage> =
            serde_json::from_value(json!([{"role": "user", "content": "first question"}])).unwrap();
        let response_blocks: Vec<ClaudeBlock> = serde_json::from_value(json!([
            {"type": "thinking", "thinking": "prior chain", "signature": "sig-xyz"},
            {"type": "text", "text": "prior answer"}
        ]))
        .unwrap();
        cache.remember_response(9, &turn1, &response_blocks);

        // Turn 2 replays the exchange without the signature.
        let mut req = request_with_thinking_turn();
        req.thinking = Some(ClaudeThinking {
            kind: "enabled".into(),
            budget_tokens: Some(1024),
        });
        cache.apply(9, &mut req);

        let ClaudeContent::Blocks(blocks) = &req.messages[1].content else {
            panic!("expected blocks");
        };
        let ClaudeBlock::Thinking { signature, .. } = &blocks[0] else {
            panic!("expected thinking block to survive");
        };
        assert_eq!(signature.as_deref(), Some("sig-xyz"));
    }
}
