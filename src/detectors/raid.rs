use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use super::RaidKind;
use crate::audit::{AuditSink, IncidentKind, IncidentRecord};
use crate::cache::{RateCounter, RateKey};
use crate::cooldown::Debouncer;
use crate::lockdown::{LockdownOutcome, LockdownRequest, LockdownStateMachine};
use crate::remediation::RaidChannelRegistry;
use crate::rules::{GuildRules, RaidRule};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaidVerdict {
    Ignored,
    Counted(usize),
    /// Threshold reached while the guild is already locked.
    AlreadyLocked,
    /// Threshold reached again inside the debounce interval.
    Debounced,
    Lockdown(LockdownOutcome),
}

/// Join, channel and role raid detection for every guild.
///
/// All three kinds share the same path: count per guild, and on a breach hand one
/// lockdown request per burst to the state machine.
pub struct RaidDetector {
    counter: RateCounter,
    debounce: Debouncer,
    lockdown: Arc<LockdownStateMachine>,
    registry: Arc<RaidChannelRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl RaidDetector {
    pub fn new(
        counter: RateCounter,
        debounce: Debouncer,
        lockdown: Arc<LockdownStateMachine>,
        registry: Arc<RaidChannelRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            counter,
            debounce,
            lockdown,
            registry,
            audit,
        }
    }

    pub async fn on_member_join(&self, guild_id: u64, rules: &GuildRules, now: Instant) -> RaidVerdict {
        self.observe(RaidKind::Join, guild_id, rules.join_raid.as_ref(), rules, now).await
    }

    pub async fn on_channel_create(
        &self,
        guild_id: u64,
        channel_id: u64,
        rules: &GuildRules,
        now: Instant,
    ) -> RaidVerdict {
        if let Some(rule) = rules.channel_raid.as_ref().filter(|r| r.validate().is_ok()) {
            self.registry.register(guild_id, channel_id, now, rule.window());
        }
        self.observe(RaidKind::Channel, guild_id, rules.channel_raid.as_ref(), rules, now)
            .await
    }

    pub async fn on_role_create(&self, guild_id: u64, rules: &GuildRules, now: Instant) -> RaidVerdict {
        self.observe(RaidKind::Role, guild_id, rules.role_raid.as_ref(), rules, now).await
    }

    /// Forget debounce entries whose interval passed.
    pub fn sweep(&self, now: Instant) {
        self.debounce.sweep(now);
    }

    async fn observe(
        &self,
        kind: RaidKind,
        guild_id: u64,
        rule: Option<&RaidRule>,
        rules: &GuildRules,
        now: Instant,
    ) -> RaidVerdict {
        let rule = match rule.map(|r| r.validate()) {
            Some(Ok(rule)) => rule,
            Some(Err(e)) => {
                debug!(gid = guild_id, kind = %kind, reason = %e, "raid rule skipped");
                return RaidVerdict::Ignored;
            }
            None => return RaidVerdict::Ignored,
        };
        let Some(ns) = kind.namespace() else {
            return RaidVerdict::Ignored;
        };

        let key = RateKey::guild(guild_id);
        let obs = self.counter.observe(ns, &key, rule.window(), rule.threshold, now);
        if !obs.exceeded {
            return RaidVerdict::Counted(obs.count);
        }
        if self.lockdown.is_locked(guild_id) {
            return RaidVerdict::AlreadyLocked;
        }
        if !self.debounce.try_fire(guild_id, kind, now) {
            return RaidVerdict::Debounced;
        }
        self.counter.reset(ns, &key);

        info!(gid = guild_id, kind = %kind, count = obs.count, threshold = rule.threshold, "raid detected");
        self.audit
            .record(
                &IncidentRecord::new(guild_id, IncidentKind::RaidDetected)
                    .counts(obs.count, rule.threshold)
                    .detail(json!({
                        "raid_kind": kind.as_str(),
                        "window_secs": rule.window_secs,
                    })),
            )
            .await;

        let outcome = self
            .lockdown
            .apply_lockdown(LockdownRequest {
                guild_id,
                minutes: rule.lockdown_minutes,
                kind,
                alert_channel: rules.alert_channel,
                delete_created_channels: kind == RaidKind::Channel && rule.delete_created_channels,
                reason: format!(
                    "{}: {} events in {}s (threshold {}).",
                    kind.label(),
                    obs.count,
                    rule.window_secs,
                    rule.threshold
                ),
            })
            .await;
        RaidVerdict::Lockdown(outcome)
    }
}
