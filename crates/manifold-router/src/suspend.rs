use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// In-memory suspension book-keeping. A suspended channel is treated as
/// excluded by the selector until its timestamp passes; persistence of
/// longer-lived disables is the admin layer's concern.
#[derive(Default)]
pub struct SuspensionMap {
    until: DashMap<i64, Instant>,
}

impl SuspensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self, channel_id: i64, dur: Duration) {
        let until = Instant::now() + dur;
        // Keep the later deadline when suspensions race.
        let mut entry = self.until.entry(channel_id).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        warn!(channel_id, secs = dur.as_secs(), "channel suspended");
    }

    pub fn is_suspended(&self, channel_id: i64) -> bool {
        let now = Instant::now();
        let active = self.until.get(&channel_id).map(|entry| *entry > now);
        match active {
            Some(true) => true,
            Some(false) => {
                self.until.remove(&channel_id);
                false
            }
            None => false,
        }
    }

    /// Drop lapsed entries. Called opportunistically from the selector.
    pub fn prune(&self) {
        let now = Instant::now();
        self.until.retain(|_, until| *until > now);
    }
}
