use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use manifold_core::{Ability, Channel, ChannelStatus, ChannelStore, Result};

/// A consistent point-in-time view of channels and abilities. Readers clone
/// the `Arc`; the refresher swaps the whole snapshot under a brief write
/// lock.
#[derive(Debug, Default)]
pub struct Snapshot {
    channels: HashMap<i64, Arc<Channel>>,
    /// `(group, model)` → abilities sorted by priority DESC, channel id ASC.
    abilities: HashMap<(String, String), Vec<Ability>>,
}

/// Cached projection of the channel table. The selector queries abilities,
/// never the store.
pub struct AbilityCache {
    snapshot: RwLock<Arc<Snapshot>>,
    refreshed_at: RwLock<Instant>,
    ttl: Duration,
}

impl AbilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refreshed_at: RwLock::new(Instant::now()),
            ttl,
        }
    }

    /// Rebuild the snapshot from a channel list. Disabled channels keep
    /// their channel entry (so pinned lookups can report "disabled") but
    /// materialize no abilities.
    pub fn install(&self, channels: Vec<Channel>) {
        let mut snap = Snapshot::default();
        for ch in channels {
            let ch = Arc::new(ch);
            for group in &ch.groups {
                for model in &ch.models {
                    let key = (group.clone(), model.clone());
                    snap.abilities.entry(key).or_default().push(Ability {
                        group: group.clone(),
                        model: model.clone(),
                        channel_id: ch.id,
                        priority: ch.priority,
                        enabled: ch.status == ChannelStatus::Enabled,
                    });
                }
            }
            snap.channels.insert(ch.id, ch);
        }
        for list in snap.abilities.values_mut() {
            list.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.channel_id.cmp(&b.channel_id))
            });
        }
        let ability_count: usize = snap.abilities.values().map(Vec::len).sum();
        info!(
            channels = snap.channels.len(),
            abilities = ability_count,
            "channel cache installed"
        );
        *self.snapshot.write() = Arc::new(snap);
        *self.refreshed_at.write() = Instant::now();
    }

    /// Reload from the store when the TTL has lapsed.
    pub async fn refresh_if_stale(&self, store: &dyn ChannelStore) -> Result<()> {
        if self.refreshed_at.read().elapsed() < self.ttl {
            return Ok(());
        }
        debug!("channel cache stale, refreshing");
        let channels = store.channels().await?;
        self.install(channels);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn channel(&self, id: i64) -> Option<Arc<Channel>> {
        self.snapshot.read().channels.get(&id).cloned()
    }

    /// Models visible to a group across enabled channels, for `/v1/models`.
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let snap = self.snapshot();
        let mut models: Vec<String> = snap
            .abilities
            .keys()
            .filter(|(g, _)| g == group)
            .filter(|(g, m)| {
                snap.abilities[&(g.clone(), m.clone())]
                    .iter()
                    .any(|a| a.enabled)
            })
            .map(|(_, m)| m.clone())
            .collect();
        models.sort();
        models.dedup();
        models
    }
}

impl Snapshot {
    /// Enabled abilities for `(group, model)`, already priority-ordered.
    pub fn candidates(&self, group: &str, model: &str) -> &[Ability] {
        self.abilities
            .get(&(group.to_string(), model.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn channel(&self, id: i64) -> Option<&Arc<Channel>> {
        self.channels.get(&id)
    }

    /// All channels in a group, priority-ordered, for the
    /// websocket-before-model path where no model is known yet.
    pub fn channels_in_group(&self, group: &str) -> Vec<Arc<Channel>> {
        let mut out: Vec<Arc<Channel>> = self
            .channels
            .values()
            .filter(|c| c.groups.contains(group) && c.status == ChannelStatus::Enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        out
    }
}
