//! Per-guild detection rules, read-only from the guard's point of view.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serenity::async_trait;
use thiserror::Error;

use crate::cache::Namespace;
use crate::config::RaidGuardConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule is disabled")]
    Disabled,
    #[error("threshold must be at least 1")]
    ZeroThreshold,
    #[error("window must be at least 1 second")]
    ZeroWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpamRule {
    pub enabled: bool,
    pub max_messages: u32,
    pub window_secs: u64,
    /// How long an offender stays suppressed after a purge.
    pub cooldown_secs: u64,
    /// How far back the purge looks; wider than the detection window.
    pub purge_window_secs: u64,
    #[serde(default)]
    pub exempt_roles: Vec<u64>,
}

impl SpamRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<&Self, RuleError> {
        if !self.enabled {
            return Err(RuleError::Disabled);
        }
        if self.max_messages == 0 {
            return Err(RuleError::ZeroThreshold);
        }
        if self.window_secs == 0 {
            return Err(RuleError::ZeroWindow);
        }
        Ok(self)
    }
}

impl Default for SpamRule {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: 5,
            window_secs: 5,
            cooldown_secs: 60,
            purge_window_secs: 60,
            exempt_roles: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidRule {
    pub enabled: bool,
    pub threshold: u32,
    pub window_secs: u64,
    pub lockdown_minutes: u32,
    /// Channel raids only: delete channels created during the burst.
    #[serde(default)]
    pub delete_created_channels: bool,
}

impl RaidRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> Result<&Self, RuleError> {
        if !self.enabled {
            return Err(RuleError::Disabled);
        }
        if self.threshold == 0 {
            return Err(RuleError::ZeroThreshold);
        }
        if self.window_secs == 0 {
            return Err(RuleError::ZeroWindow);
        }
        Ok(self)
    }
}

impl Default for RaidRule {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            window_secs: 10,
            lockdown_minutes: 10,
            delete_created_channels: false,
        }
    }
}

/// Everything the guard needs to know about one guild.
///
/// Sections missing from a config entry fall back to the built-in defaults; a detector
/// is switched off with `enabled = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildRules {
    pub alert_channel: Option<u64>,
    pub spam: Option<SpamRule>,
    pub join_raid: Option<RaidRule>,
    pub channel_raid: Option<RaidRule>,
    pub role_raid: Option<RaidRule>,
}

impl Default for GuildRules {
    fn default() -> Self {
        Self {
            alert_channel: None,
            spam: Some(SpamRule::default()),
            join_raid: Some(RaidRule::default()),
            channel_raid: Some(RaidRule {
                threshold: 3,
                delete_created_channels: true,
                ..RaidRule::default()
            }),
            role_raid: Some(RaidRule {
                threshold: 3,
                ..RaidRule::default()
            }),
        }
    }
}

impl GuildRules {
    /// Detection window of every configured rule, keyed by the cache namespace it reads.
    pub fn windows(&self) -> Vec<(Namespace, u64)> {
        let raids = [
            (Namespace::RecentJoins, &self.join_raid),
            (Namespace::RecentChannels, &self.channel_raid),
            (Namespace::RecentRoles, &self.role_raid),
        ];
        self.spam
            .iter()
            .map(|r| (Namespace::RecentMessages, r.window_secs))
            .chain(
                raids
                    .into_iter()
                    .filter_map(|(ns, r)| r.as_ref().map(|r| (ns, r.window_secs))),
            )
            .collect()
    }
}

/// Read-only access to the configuration store.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn guild_rules(&self, guild_id: u64) -> Result<Option<GuildRules>>;
}

/// Serves the `[raidguard]` section of the settings: per-guild override, else defaults.
pub struct SettingsRules {
    config: RaidGuardConfig,
}

impl SettingsRules {
    pub fn new(config: RaidGuardConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuleSource for SettingsRules {
    async fn guild_rules(&self, guild_id: u64) -> Result<Option<GuildRules>> {
        let rules = self
            .config
            .guilds
            .iter()
            .find(|g| g.guild_id == guild_id)
            .map(|g| g.rules.clone())
            .unwrap_or_else(|| self.config.defaults.clone());
        Ok(Some(rules))
    }
}

/// TTL cache in front of a [`RuleSource`]. Load failures are not cached.
pub struct RuleCache {
    source: Arc<dyn RuleSource>,
    cache: Cache<u64, Arc<GuildRules>>,
}

impl RuleCache {
    pub fn new(source: Arc<dyn RuleSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
        }
    }

    /// Rules for the guild, or `None` when the store has none / is unreachable.
    pub async fn get(&self, guild_id: u64) -> Option<Arc<GuildRules>> {
        if let Some(hit) = self.cache.get(&guild_id).await {
            return Some(hit);
        }
        match self.source.guild_rules(guild_id).await {
            Ok(Some(rules)) => {
                let rules = Arc::new(rules);
                self.cache.insert(guild_id, rules.clone()).await;
                Some(rules)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error=?e, gid = guild_id, "rule load failed");
                None
            }
        }
    }

    pub async fn invalidate(&self, guild_id: u64) {
        self.cache.invalidate(&guild_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuildRulesOverride;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource(AtomicUsize);

    #[async_trait]
    impl RuleSource for CountingSource {
        async fn guild_rules(&self, guild_id: u64) -> Result<Option<GuildRules>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if guild_id == 0 {
                anyhow::bail!("store offline");
            }
            Ok(Some(GuildRules::default()))
        }
    }

    #[test]
    fn validation_rejects_broken_rules() {
        let zero = SpamRule { max_messages: 0, ..SpamRule::default() };
        assert_eq!(zero.validate(), Err(RuleError::ZeroThreshold));
        let off = RaidRule { enabled: false, ..RaidRule::default() };
        assert_eq!(off.validate(), Err(RuleError::Disabled));
        let no_window = RaidRule { window_secs: 0, ..RaidRule::default() };
        assert_eq!(no_window.validate(), Err(RuleError::ZeroWindow));
        assert!(RaidRule::default().validate().is_ok());
    }

    #[tokio::test]
    async fn settings_prefer_guild_override() {
        let mut cfg = RaidGuardConfig::default();
        let mut custom = GuildRules::default();
        custom.alert_channel = Some(77);
        cfg.guilds.push(GuildRulesOverride { guild_id: 5, rules: custom.clone() });
        let src = SettingsRules::new(cfg);

        assert_eq!(src.guild_rules(5).await.unwrap(), Some(custom));
        assert_eq!(src.guild_rules(6).await.unwrap(), Some(GuildRules::default()));
    }

    #[tokio::test]
    async fn cache_hits_skip_the_store_and_errors_are_not_cached() {
        let src = Arc::new(CountingSource(AtomicUsize::new(0)));
        let cache = RuleCache::new(src.clone(), Duration::from_secs(60));

        assert!(cache.get(1).await.is_some());
        assert!(cache.get(1).await.is_some());
        assert_eq!(src.0.load(Ordering::SeqCst), 1);

        assert!(cache.get(0).await.is_none());
        assert!(cache.get(0).await.is_none());
        assert_eq!(src.0.load(Ordering::SeqCst), 3);

        cache.invalidate(1).await;
        cache.get(1).await;
        assert_eq!(src.0.load(Ordering::SeqCst), 4);
    }
}
