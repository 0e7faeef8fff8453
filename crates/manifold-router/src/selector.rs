use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::cache::AbilityCache;
use crate::ratelimit::ChannelRateLimiter;
use crate::suspend::SuspensionMap;
use manifold_core::{Channel, ChannelStatus, RelayError, RelayMode, Result};

/// One selection request. `exclude` accumulates across the attempts of a
/// single relay: suspended channels, incompatible channels, and channels
/// that already failed this request all land there.
pub struct SelectQuery<'a> {
    pub group: &'a str,
    pub model: &'a str,
    pub mode: RelayMode,
    pub websocket: bool,
    pub exclude: &'a mut HashSet<i64>,
    /// Skip the highest-priority tier entirely; set by the relay loop when
    /// the top tier has been exhausted.
    pub ignore_first_priority: bool,
}

/// Resolves `(group, model, endpoint, transport)` to a channel. Stateless
/// beyond the cached projection; never mutates channels.
pub struct Selector {
    cache: Arc<AbilityCache>,
    suspensions: Arc<SuspensionMap>,
    limiter: Arc<ChannelRateLimiter>,
}

impl Selector {
    pub fn new(
        cache: Arc<AbilityCache>,
        suspensions: Arc<SuspensionMap>,
        limiter: Arc<ChannelRateLimiter>,
    ) -> Self {
        Self {
            cache,
            suspensions,
            limiter,
        }
    }

    pub fn cache(&self) -> &Arc<AbilityCache> {
        &self.cache
    }

    pub fn suspensions(&self) -> &Arc<SuspensionMap> {
        &self.suspensions
    }

    /// Auto selection. Candidates come back priority DESC, channel id ASC;
    /// the scan therefore visits tiers in order and the attempted-priority
    /// sequence over a request is non-increasing.
    pub fn pick(&self, q: &mut SelectQuery<'_>) -> Result<Arc<Channel>> {
        self.suspensions.prune();
        let snap = self.cache.snapshot();
        let candidates = snap.candidates(q.group, q.model);
        if candidates.is_empty() {
            return Err(RelayError::no_channel(q.group, q.model));
        }

        let top_priority = candidates[0].priority;
        for ability in candidates {
            if q.ignore_first_priority && ability.priority == top_priority {
                continue;
            }
            if !ability.enabled || q.exclude.contains(&ability.channel_id) {
                continue;
            }
            if self.suspensions.is_suspended(ability.channel_id) {
                continue;
            }
            let Some(channel) = snap.channel(ability.channel_id) else {
                // Stale ability: the channel vanished from the projection.
                continue;
            };
            if !channel.supports_endpoint(q.mode) || !channel.supports_transport(q.mode, q.websocket)
            {
                // Incompatible with this request shape for its whole
                // lifetime; no point revisiting on retry.
                q.exclude.insert(channel.id);
                continue;
            }
            if !self.limiter.check(channel.id, channel.rate_limit) {
                debug!(channel_id = channel.id, "channel over its per-minute limit, skipping");
                continue;
            }
            debug!(
                channel_id = channel.id,
                priority = ability.priority,
                model = q.model,
                "channel selected"
            );
            return Ok(Arc::clone(channel));
        }

        Err(RelayError::no_channel(q.group, q.model))
    }

    /// Pinned selection: the caller's key carried `-{channel-id}` and the
    /// caller is an admin. Every mismatch is terminal.
    pub fn pick_pinned(
        &self,
        channel_id: i64,
        model: &str,
        mode: RelayMode,
        websocket: bool,
    ) -> Result<Arc<Channel>> {
        let channel = self
            .cache
            .channel(channel_id)
            .ok_or_else(|| RelayError::bad_request(format!("channel {channel_id} not found")))?;
        if channel.status != ChannelStatus::Enabled {
            return Err(RelayError::forbidden(format!(
                "channel {channel_id} is disabled"
            )));
        }
        if !channel.supports_model(model) {
            return Err(RelayError::bad_request(format!(
                "channel {channel_id} does not support model {model}"
            )));
        }
        if !channel.supports_endpoint(mode) {
            return Err(RelayError::bad_request(format!(
                "channel {channel_id} does not support endpoint {}",
                mode.endpoint_name()
            )));
        }
        if !channel.supports_transport(mode, websocket) {
            return Err(RelayError::bad_request(format!(
                "channel {channel_id} does not support the requested transport"
            )));
        }
        Ok(channel)
    }

    /// Websocket-before-model path: the Response-API upgrade arrived before
    /// the client named a model, so select on `(group, endpoint, ws)` alone.
    /// Only kinds that admit Response-API over ws qualify.
    pub fn pick_for_ws(&self, group: &str, exclude: &HashSet<i64>) -> Result<Arc<Channel>> {
        let snap = self.cache.snapshot();
        for channel in snap.channels_in_group(group) {
            if exclude.contains(&channel.id) || self.suspensions.is_suspended(channel.id) {
                continue;
            }
            if !channel.kind.supports_response_api_ws() {
                continue;
            }
            if !channel.supports_endpoint(RelayMode::ResponseApi) {
                continue;
            }
            return Ok(channel);
        }
        Err(RelayError::no_channel(group, "(websocket)"))
    }
}
