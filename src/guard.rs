//! RaidGuard: the detectors, the lockdown state machine and the stores they share.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::debug;

use crate::audit::AuditSink;
use crate::cache::{EventStore, RateCounter, RateKey, TtlCache};
use crate::config::RaidGuardConfig;
use crate::cooldown::{CooldownRegister, Debouncer};
use crate::detectors::{IncomingMessage, RaidDetector, RaidVerdict, SpamDetector, SpamVerdict};
use crate::lockdown::LockdownStateMachine;
use crate::platform::Platform;
use crate::remediation::RaidChannelRegistry;
use crate::rules::{GuildRules, RuleCache, RuleSource};

/// One instance per process, shared by the gateway handler and the commands.
pub struct RaidGuard {
    rules: RuleCache,
    cache: Arc<TtlCache>,
    cooldowns: Arc<CooldownRegister>,
    spam: SpamDetector,
    raids: RaidDetector,
    lockdown: Arc<LockdownStateMachine>,
    command_cooldown: Duration,
    debounce_every: Duration,
}

impl RaidGuard {
    pub fn new(
        platform: Arc<dyn Platform>,
        audit: Arc<dyn AuditSink>,
        rules: Arc<dyn RuleSource>,
        cfg: &RaidGuardConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(TtlCache::new(cfg.effective_cache_limits()));
        let store: Arc<dyn EventStore> = cache.clone();
        let counter = RateCounter::new(store);
        let cooldowns = Arc::new(CooldownRegister::new());
        let registry = Arc::new(RaidChannelRegistry::new());
        let debounce_every = Duration::from_secs(cfg.lockdown.debounce_secs.max(1));

        let lockdown = LockdownStateMachine::new(
            platform.clone(),
            audit.clone(),
            registry.clone(),
            cfg.lockdown,
        );
        let spam = SpamDetector::new(
            counter.clone(),
            cooldowns.clone(),
            platform,
            audit.clone(),
            cfg.purge,
        );
        let raids = RaidDetector::new(
            counter,
            Debouncer::new(Duration::from_secs(cfg.lockdown.debounce_secs)),
            lockdown.clone(),
            registry,
            audit,
        );

        Arc::new(Self {
            rules: RuleCache::new(rules, cfg.rules_cache_ttl()),
            cache,
            cooldowns,
            spam,
            raids,
            lockdown,
            command_cooldown: Duration::from_secs(cfg.commands.cooldown_secs),
            debounce_every,
        })
    }

    /// Start the background sweepers. They stop once the guard is dropped.
    pub fn start(self: &Arc<Self>) {
        TtlCache::spawn_sweepers(&self.cache);

        let weak = Arc::downgrade(self);
        let every = self.debounce_every;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(guard) = weak.upgrade() else {
                    break;
                };
                guard.raids.sweep(Instant::now());
            }
        });
    }

    pub fn lockdown(&self) -> &Arc<LockdownStateMachine> {
        &self.lockdown
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    async fn rules_for(&self, guild_id: u64) -> Option<Arc<GuildRules>> {
        let rules = self.rules.get(guild_id).await;
        if rules.is_none() {
            debug!(gid = guild_id, "no rules, event skipped");
        }
        rules
    }

    pub async fn on_message(&self, msg: &IncomingMessage) -> SpamVerdict {
        let Some(rules) = self.rules_for(msg.guild_id).await else {
            return SpamVerdict::Ignored;
        };
        self.spam.on_message(msg, &rules, Instant::now()).await
    }

    pub async fn on_member_join(&self, guild_id: u64) -> RaidVerdict {
        let Some(rules) = self.rules_for(guild_id).await else {
            return RaidVerdict::Ignored;
        };
        self.raids.on_member_join(guild_id, &rules, Instant::now()).await
    }

    pub async fn on_channel_create(&self, guild_id: u64, channel_id: u64) -> RaidVerdict {
        let Some(rules) = self.rules_for(guild_id).await else {
            return RaidVerdict::Ignored;
        };
        self.raids
            .on_channel_create(guild_id, channel_id, &rules, Instant::now())
            .await
    }

    pub async fn on_role_create(&self, guild_id: u64) -> RaidVerdict {
        let Some(rules) = self.rules_for(guild_id).await else {
            return RaidVerdict::Ignored;
        };
        self.raids.on_role_create(guild_id, &rules, Instant::now()).await
    }

    /// Alert channel configured for the guild, if any.
    pub async fn alert_channel(&self, guild_id: u64) -> Option<u64> {
        self.rules.get(guild_id).await.and_then(|r| r.alert_channel)
    }

    /// Per-user command cooldown: false while the user is still cooling down.
    pub fn command_allowed(&self, guild_id: u64, user_id: u64, command: &str) -> bool {
        self.cooldowns.try_acquire(
            RateKey::command(guild_id, user_id, command),
            self.command_cooldown,
            Instant::now(),
        )
    }

    /// Drop cached rules, e.g. after the bot left the guild.
    pub async fn forget_guild(&self, guild_id: u64) {
        self.rules.invalidate(guild_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::memory::MemoryAudit;
    use crate::cache::Namespace;
    use crate::platform::mock::MockPlatform;
    use crate::rules::{RaidRule, SettingsRules};
    use serenity::all::Permissions;

    fn guard() -> (Arc<RaidGuard>, Arc<MockPlatform>) {
        let mock = Arc::new(MockPlatform::guild(1, Permissions::SEND_MESSAGES, &[10]));
        let cfg = RaidGuardConfig::default();
        let guard = RaidGuard::new(
            mock.clone(),
            Arc::new(MemoryAudit::default()),
            Arc::new(SettingsRules::new(cfg.clone())),
            &cfg,
        );
        (guard, mock)
    }

    #[tokio::test(start_paused = true)]
    async fn command_cooldown_is_per_user_and_command() {
        let (guard, _) = guard();
        assert!(guard.command_allowed(1, 5, "lockdown"));
        assert!(!guard.command_allowed(1, 5, "lockdown"));
        assert!(guard.command_allowed(1, 6, "lockdown"));
        assert!(guard.command_allowed(1, 5, "other"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(guard.command_allowed(1, 5, "lockdown"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweepers_drain_the_cache_after_retention() {
        let (guard, _) = guard();
        guard.start();
        guard.on_member_join(1).await;
        assert_eq!(guard.cache().key_count(Namespace::RecentJoins), 1);

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert_eq!(guard.cache().key_count(Namespace::RecentJoins), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_join_raid_outlives_the_default_retention() {
        let mock = Arc::new(MockPlatform::guild(1, Permissions::SEND_MESSAGES, &[10]));
        let mut cfg = RaidGuardConfig::default();
        cfg.defaults.join_raid = Some(RaidRule {
            threshold: 2,
            window_secs: 1200,
            ..RaidRule::default()
        });
        let guard = RaidGuard::new(
            mock,
            Arc::new(MemoryAudit::default()),
            Arc::new(SettingsRules::new(cfg.clone())),
            &cfg,
        );
        guard.start();

        assert_eq!(guard.on_member_join(1).await, RaidVerdict::Counted(1));
        tokio::time::sleep(Duration::from_secs(700)).await;
        assert!(matches!(guard.on_member_join(1).await, RaidVerdict::Lockdown(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn join_burst_routes_to_lockdown() {
        let (guard, _) = guard();
        for _ in 0..4 {
            guard.on_member_join(1).await;
        }
        assert!(matches!(guard.on_member_join(1).await, RaidVerdict::Lockdown(_)));
        assert!(guard.lockdown().is_locked(1));
    }
}
