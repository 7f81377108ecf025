use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, IncidentKind, IncidentRecord};
use crate::cache::{Namespace, RateCounter, RateKey};
use crate::config::PurgeConfig;
use crate::cooldown::CooldownRegister;
use crate::platform::{Alert, AlertLevel, Platform};
use crate::remediation::{RemediationSummary, purge::PurgeTarget, purge_member_messages};
use crate::rules::GuildRules;

/// A guild message as the spam detector sees it.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub author_is_bot: bool,
    pub author_roles: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpamVerdict {
    /// No rule applies to this message.
    Ignored,
    /// Counted, below the threshold.
    Counted(usize),
    /// Author is cooling down; the message was deleted without counting.
    Suppressed,
    /// Threshold reached; the burst was purged.
    Purged(RemediationSummary),
}

pub struct SpamDetector {
    counter: RateCounter,
    cooldowns: Arc<CooldownRegister>,
    platform: Arc<dyn Platform>,
    audit: Arc<dyn AuditSink>,
    purge: PurgeConfig,
}

impl SpamDetector {
    pub fn new(
        counter: RateCounter,
        cooldowns: Arc<CooldownRegister>,
        platform: Arc<dyn Platform>,
        audit: Arc<dyn AuditSink>,
        purge: PurgeConfig,
    ) -> Self {
        Self {
            counter,
            cooldowns,
            platform,
            audit,
            purge,
        }
    }

    async fn suppress(&self, msg: &IncomingMessage) -> SpamVerdict {
        if let Err(e) = self.platform.delete_message(msg.channel_id, msg.message_id).await {
            warn!(error=?e, gid = msg.guild_id, uid = msg.author_id, "cooldown delete failed");
        }
        SpamVerdict::Suppressed
    }

    pub async fn on_message(&self, msg: &IncomingMessage, rules: &GuildRules, now: Instant) -> SpamVerdict {
        if msg.author_is_bot {
            return SpamVerdict::Ignored;
        }
        let rule = match rules.spam.as_ref().map(|r| r.validate()) {
            Some(Ok(rule)) => rule,
            Some(Err(e)) => {
                debug!(gid = msg.guild_id, reason = %e, "spam rule skipped");
                return SpamVerdict::Ignored;
            }
            None => return SpamVerdict::Ignored,
        };
        if msg.author_roles.iter().any(|r| rule.exempt_roles.contains(r)) {
            return SpamVerdict::Ignored;
        }

        let key = RateKey::member(msg.guild_id, msg.author_id);
        if self.cooldowns.is_active(&key, now) {
            return self.suppress(msg).await;
        }

        let obs = self.counter.observe(
            Namespace::RecentMessages,
            &key,
            rule.window(),
            rule.max_messages,
            now,
        );
        if !obs.exceeded {
            return SpamVerdict::Counted(obs.count);
        }

        // in-memory state first, so messages arriving during the purge hit the cooldown;
        // a concurrent breach that lost the acquire is treated as a cooldown hit
        if !self.cooldowns.try_acquire(key.clone(), rule.cooldown(), now) {
            return self.suppress(msg).await;
        }
        self.counter.reset(Namespace::RecentMessages, &key);

        info!(
            gid = msg.guild_id,
            uid = msg.author_id,
            count = obs.count,
            threshold = rule.max_messages,
            "spam detected"
        );

        let recency = Duration::from_secs(rule.purge_window_secs.max(rule.window_secs));
        let summary = purge_member_messages(
            self.platform.as_ref(),
            &self.purge,
            PurgeTarget {
                channel_id: msg.channel_id,
                trigger_message_id: msg.message_id,
                author_id: msg.author_id,
            },
            recency,
            Utc::now(),
        )
        .await;

        self.audit
            .record(
                &IncidentRecord::new(msg.guild_id, IncidentKind::SpamDetected)
                    .counts(obs.count, rule.max_messages)
                    .detail(json!({
                        "user_id": msg.author_id,
                        "channel_id": msg.channel_id,
                        "window_secs": rule.window_secs,
                        "deleted": summary.succeeded,
                        "failed": summary.failed,
                        "cooldown_secs": rule.cooldown_secs,
                    })),
            )
            .await;

        let alert = Alert::new(
            AlertLevel::Warning,
            "🚫 Spam removed",
            format!(
                "<@{}> sent {} messages in {}s. Their new messages are removed for the next {}s.",
                msg.author_id, obs.count, rule.window_secs, rule.cooldown_secs
            ),
        )
        .field("Deleted", summary.succeeded);
        if let Err(e) = self.platform.send_alert(msg.channel_id, &alert).await {
            warn!(error=?e, gid = msg.guild_id, "spam alert failed");
        }

        SpamVerdict::Purged(summary)
    }
}
