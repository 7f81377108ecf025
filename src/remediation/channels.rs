use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use super::RemediationSummary;
use crate::platform::Platform;

/// Channels created per guild during the current observation window.
///
/// Only consulted when a channel raid ends in a lockdown that asks for cleanup.
#[derive(Debug, Default)]
pub struct RaidChannelRegistry {
    created: DashMap<u64, Vec<(u64, Instant)>>,
}

impl RaidChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `channel_id` and forget channels older than `window`.
    pub fn register(&self, guild_id: u64, channel_id: u64, now: Instant, window: Duration) {
        let mut list = self.created.entry(guild_id).or_default();
        list.retain(|(_, at)| now.saturating_duration_since(*at) < window);
        if !list.iter().any(|(id, _)| *id == channel_id) {
            list.push((channel_id, now));
        }
    }

    pub fn channels(&self, guild_id: u64) -> Vec<u64> {
        self.created
            .get(&guild_id)
            .map(|l| l.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    /// Remove and return the guild's channels.
    pub fn take(&self, guild_id: u64) -> Vec<u64> {
        self.created
            .remove(&guild_id)
            .map(|(_, l)| l.into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, guild_id: u64) {
        self.created.remove(&guild_id);
    }
}

/// Delete every channel in `channel_ids`, each attempt independent of the others.
pub async fn nuke_channels(
    platform: &dyn Platform,
    guild_id: u64,
    channel_ids: &[u64],
    reason: &str,
) -> RemediationSummary {
    let mut summary = RemediationSummary::default();
    for &id in channel_ids {
        match platform.delete_channel(id, reason).await {
            Ok(()) => summary.ok(1),
            Err(e) => {
                warn!(error=?e, gid = guild_id, channel = id, "raid channel delete failed");
                summary.fail(1);
            }
        }
    }
    summary
}
