//! Per-guild lockdown state machine.
//!
//! `Unlocked -> Locking -> Locked -> Unlocking -> Unlocked`. Unlocked is the absence of a
//! [`LockdownRecord`]. The record is inserted through a single `DashMap::entry` call
//! before the first external request, so two detectors racing on one guild cannot
//! both get past the guard.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::json;
use thiserror::Error;
use tokio::{task::AbortHandle, time::Instant};
use tracing::{error, info, warn};

pub mod policy;

use policy::{ChannelRestore, LockdownSnapshot, agent_can_lock, locked_overwrite, locked_role, plan_restore};

use crate::audit::{AuditSink, IncidentKind, IncidentRecord};
use crate::config::LockdownConfig;
use crate::detectors::RaidKind;
use crate::platform::{Alert, AlertLevel, Platform};
use crate::remediation::{RaidChannelRegistry, RemediationSummary, channels::nuke_channels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownPhase {
    Locking,
    Locked,
    Unlocking,
}

#[derive(Debug)]
pub struct LockdownRecord {
    pub incident_id: u64,
    pub guild_id: u64,
    pub phase: LockdownPhase,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub duration_minutes: u32,
    pub kind: RaidKind,
    pub snapshot: LockdownSnapshot,
    pub alert_channel: Option<u64>,
    expiry: Option<AbortHandle>,
}

#[derive(Debug, Clone)]
pub struct LockdownRequest {
    pub guild_id: u64,
    pub minutes: u32,
    pub kind: RaidKind,
    pub alert_channel: Option<u64>,
    /// Channel raids: delete the channels recorded in the raid registry.
    pub delete_created_channels: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("duration {minutes} min is outside {min}..={max} min")]
    DurationOutOfBounds { minutes: u32, min: u32, max: u32 },
    #[error("unknown raid kind `{0}`")]
    UnknownKind(String),
    #[error("guild is already locked down")]
    AlreadyLocked,
    #[error("bot lacks Manage Roles / Manage Channels")]
    MissingPermissions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockdownReport {
    pub incident_id: u64,
    pub role_restricted: bool,
    pub snapshot_complete: bool,
    pub channels: RemediationSummary,
    pub nuked: RemediationSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockdownOutcome {
    Applied(LockdownReport),
    Rejected(RejectReason),
}

impl LockdownOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, LockdownOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockCause {
    /// The record's own expiry timer.
    Expired,
    /// Programmatic revert.
    Reverted,
    Manual { by: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub role_restored: bool,
    pub used_fallback: bool,
    pub channels: RemediationSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Restored(RestoreReport),
    NotLocked,
    /// Another path is locking or unlocking this guild right now.
    InTransition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockdownStatus {
    pub phase: LockdownPhase,
    pub kind: RaidKind,
    pub duration_minutes: u32,
    pub started_at: DateTime<Utc>,
    pub remaining: Duration,
}

pub struct LockdownStateMachine {
    platform: Arc<dyn Platform>,
    audit: Arc<dyn AuditSink>,
    registry: Arc<RaidChannelRegistry>,
    config: LockdownConfig,
    records: DashMap<u64, LockdownRecord>,
    next_id: AtomicU64,
}

impl LockdownStateMachine {
    pub fn new(
        platform: Arc<dyn Platform>,
        audit: Arc<dyn AuditSink>,
        registry: Arc<RaidChannelRegistry>,
        config: LockdownConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            audit,
            registry,
            config,
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn is_locked(&self, guild_id: u64) -> bool {
        self.records.contains_key(&guild_id)
    }

    pub fn status(&self, guild_id: u64) -> Option<LockdownStatus> {
        self.records.get(&guild_id).map(|r| {
            let total = Duration::from_secs(r.duration_minutes as u64 * 60);
            LockdownStatus {
                phase: r.phase,
                kind: r.kind,
                duration_minutes: r.duration_minutes,
                started_at: r.started_wall,
                remaining: total.saturating_sub(r.started_at.elapsed()),
            }
        })
    }

    /// Put a guild under lockdown and schedule its automatic end.
    pub async fn apply_lockdown(self: &Arc<Self>, req: LockdownRequest) -> LockdownOutcome {
        let gid = req.guild_id;
        let (min, max) = (self.config.min_minutes, self.config.max_minutes);
        if req.minutes < min || req.minutes > max {
            warn!(gid, minutes = req.minutes, "lockdown rejected: duration out of bounds");
            return LockdownOutcome::Rejected(RejectReason::DurationOutOfBounds {
                minutes: req.minutes,
                min,
                max,
            });
        }

        let incident_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.records.entry(gid) {
            Entry::Occupied(_) => {
                info!(gid, kind = %req.kind, "lockdown skipped: already locked");
                return LockdownOutcome::Rejected(RejectReason::AlreadyLocked);
            }
            Entry::Vacant(v) => {
                v.insert(LockdownRecord {
                    incident_id,
                    guild_id: gid,
                    phase: LockdownPhase::Locking,
                    started_at: Instant::now(),
                    started_wall: Utc::now(),
                    duration_minutes: req.minutes,
                    kind: req.kind,
                    snapshot: LockdownSnapshot::default(),
                    alert_channel: req.alert_channel,
                    expiry: None,
                });
            }
        }

        match self.platform.agent_permissions(gid).await {
            Ok(p) if agent_can_lock(p) => {}
            Ok(_) => {
                self.records.remove(&gid);
                warn!(gid, "lockdown aborted: missing permissions");
                return LockdownOutcome::Rejected(RejectReason::MissingPermissions);
            }
            Err(e) => {
                self.records.remove(&gid);
                warn!(error=?e, gid, "lockdown aborted: permission check failed");
                return LockdownOutcome::Rejected(RejectReason::MissingPermissions);
            }
        }

        // Snapshot before the first mutation.
        let role_before = match self.platform.role_permissions(gid, gid).await {
            Ok(p) => Some(p),
            Err(e) => {
                error!(error=?e, gid, "data integrity: @everyone snapshot unavailable, locking from safe defaults");
                None
            }
        };
        let channels = self.platform.lockdown_channels(gid).await.unwrap_or_else(|e| {
            warn!(error=?e, gid, "channel listing failed, locking role only");
            Vec::new()
        });

        let raid_channels = match req.kind {
            RaidKind::Channel if req.delete_created_channels => self.registry.take(gid),
            _ => Vec::new(),
        };
        let lockable: Vec<_> = channels
            .into_iter()
            .filter(|c| !raid_channels.contains(&c.id))
            .collect();

        let snapshot = LockdownSnapshot {
            role: role_before,
            channels: lockable.iter().map(|c| (c.id, c.everyone)).collect(),
        };
        let alert_channel = req
            .alert_channel
            .or_else(|| lockable.iter().find(|c| c.is_text).map(|c| c.id));
        if let Some(mut rec) = self.records.get_mut(&gid) {
            rec.snapshot = snapshot;
            rec.alert_channel = alert_channel;
        }

        let base = role_before.unwrap_or(policy::SAFE_DEFAULT_EVERYONE);
        let role_restricted = match self.platform.set_role_permissions(gid, gid, locked_role(base)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error=?e, gid, "@everyone restriction failed");
                false
            }
        };

        let mut locked = RemediationSummary::default();
        for c in &lockable {
            match self
                .platform
                .set_channel_overwrite(c.id, gid, locked_overwrite(c.everyone))
                .await
            {
                Ok(()) => locked.ok(1),
                Err(e) => {
                    warn!(error=?e, gid, channel = c.id, "channel lock failed");
                    locked.fail(1);
                }
            }
        }

        let nuked = if raid_channels.is_empty() {
            RemediationSummary::default()
        } else {
            let nuked = nuke_channels(self.platform.as_ref(), gid, &raid_channels, &req.reason).await;
            self.audit
                .record(
                    &IncidentRecord::new(gid, IncidentKind::ChannelsNuked)
                        .counts(nuked.succeeded, 0)
                        .detail(json!({ "channels": raid_channels, "failed": nuked.failed })),
                )
                .await;
            nuked
        };

        if let Some(ch) = alert_channel {
            let alert = Alert::new(
                AlertLevel::Critical,
                "🔒 Lockdown active",
                format!("{}\nMembers can read but not post until the lockdown ends.", req.reason),
            )
            .field("Raid", req.kind.label())
            .field("Duration", format!("{} min", req.minutes))
            .field("Channels locked", locked.succeeded);
            if let Err(e) = self.platform.send_alert(ch, &alert).await {
                warn!(error=?e, gid, channel = ch, "lockdown alert failed");
            }
        }

        self.audit
            .record(
                &IncidentRecord::new(gid, IncidentKind::LockdownStarted).detail(json!({
                    "incident_id": incident_id,
                    "raid_kind": req.kind.as_str(),
                    "minutes": req.minutes,
                    "reason": req.reason,
                    "role_restricted": role_restricted,
                    "channels_locked": locked.succeeded,
                    "channels_failed": locked.failed,
                    "channels_nuked": nuked.succeeded,
                })),
            )
            .await;

        let expiry = self.schedule_expiry(gid, incident_id, req.minutes);
        if let Some(mut rec) = self.records.get_mut(&gid) {
            rec.phase = LockdownPhase::Locked;
            rec.expiry = Some(expiry);
        }

        info!(gid, kind = %req.kind, minutes = req.minutes, "lockdown applied");
        LockdownOutcome::Applied(LockdownReport {
            incident_id,
            role_restricted,
            snapshot_complete: role_before.is_some(),
            channels: locked,
            nuked,
        })
    }

    fn schedule_expiry(self: &Arc<Self>, guild_id: u64, incident_id: u64, minutes: u32) -> AbortHandle {
        let weak = Arc::downgrade(self);
        let after = Duration::from_secs(minutes as u64 * 60);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(sm) = weak.upgrade() {
                sm.revert(guild_id, UnlockCause::Expired, Some(incident_id)).await;
            }
        });
        task.abort_handle()
    }

    /// Restore the guild. A second call, or a call without lockdown, is a no-op.
    pub async fn revert_lockdown(&self, guild_id: u64) -> UnlockOutcome {
        self.revert(guild_id, UnlockCause::Reverted, None).await
    }

    /// Operator unlock: cancels the pending expiry, then restores.
    pub async fn manual_unlock(&self, guild_id: u64, by: u64) -> UnlockOutcome {
        self.revert(guild_id, UnlockCause::Manual { by }, None).await
    }

    async fn revert(&self, gid: u64, cause: UnlockCause, expected: Option<u64>) -> UnlockOutcome {
        let (snapshot, alert_channel, kind, incident_id) = {
            let Some(mut rec) = self.records.get_mut(&gid) else {
                return UnlockOutcome::NotLocked;
            };
            if expected.is_some_and(|id| id != rec.incident_id) {
                return UnlockOutcome::NotLocked;
            }
            if rec.phase != LockdownPhase::Locked {
                return UnlockOutcome::InTransition;
            }
            rec.phase = LockdownPhase::Unlocking;
            if let Some(timer) = rec.expiry.take() {
                // the timer path must not abort the task it runs on
                if cause != UnlockCause::Expired {
                    timer.abort();
                }
            }
            (rec.snapshot.clone(), rec.alert_channel, rec.kind, rec.incident_id)
        };

        let current = self.platform.role_permissions(gid, gid).await.ok();
        let plan = plan_restore(&snapshot, current);
        if plan.role_fallback {
            error!(gid, "data integrity: no @everyone snapshot, restoring safe defaults");
        }

        let role_restored = match plan.role {
            None => true,
            Some(perms) => match self.platform.set_role_permissions(gid, gid, perms).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error=?e, gid, "@everyone restore failed");
                    false
                }
            },
        };

        let mut channels = RemediationSummary::default();
        for (channel_id, action) in &plan.channels {
            let res = match action {
                ChannelRestore::Reapply(ow) => {
                    self.platform.set_channel_overwrite(*channel_id, gid, *ow).await
                }
                ChannelRestore::Inherit => self.platform.clear_channel_overwrite(*channel_id, gid).await,
            };
            match res {
                Ok(()) => channels.ok(1),
                Err(e) => {
                    warn!(error=?e, gid, channel = channel_id, "channel restore failed");
                    channels.fail(1);
                }
            }
        }

        self.records.remove(&gid);
        self.registry.clear(gid);

        let by = match cause {
            UnlockCause::Expired => "lockdown expired".to_string(),
            UnlockCause::Reverted => "lockdown reverted".to_string(),
            UnlockCause::Manual { by } => format!("unlocked by <@{by}>"),
        };
        if let Some(ch) = alert_channel {
            let alert = Alert::new(AlertLevel::Info, "🔓 Lockdown lifted", format!("Server restored ({by})."))
                .field("Raid", kind.label())
                .field("Channels restored", channels.succeeded);
            if let Err(e) = self.platform.send_alert(ch, &alert).await {
                warn!(error=?e, gid, channel = ch, "resolution alert failed");
            }
        }

        self.audit
            .record(&IncidentRecord::new(gid, IncidentKind::LockdownEnded).detail(json!({
                "incident_id": incident_id,
                "raid_kind": kind.as_str(),
                "cause": by,
                "role_restored": role_restored,
                "used_fallback": plan.role_fallback,
                "channels_restored": channels.succeeded,
                "channels_failed": channels.failed,
            })))
            .await;

        info!(gid, kind = %kind, "lockdown lifted");
        UnlockOutcome::Restored(RestoreReport {
            role_restored,
            used_fallback: plan.role_fallback,
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::memory::MemoryAudit;
    use crate::platform::Overwrite;
    use crate::platform::mock::{Call, MockPlatform};
    use serenity::all::Permissions;

    const G: u64 = 1;

    fn everyone() -> Permissions {
        policy::SAFE_DEFAULT_EVERYONE | Permissions::USE_EXTERNAL_STICKERS
    }

    fn machine(mock: Arc<MockPlatform>) -> (Arc<LockdownStateMachine>, Arc<MemoryAudit>, Arc<RaidChannelRegistry>) {
        let audit = Arc::new(MemoryAudit::default());
        let registry = Arc::new(RaidChannelRegistry::new());
        let sm = LockdownStateMachine::new(mock, audit.clone(), registry.clone(), LockdownConfig::default());
        (sm, audit, registry)
    }

    fn request(kind: RaidKind, minutes: u32) -> LockdownRequest {
        LockdownRequest {
            guild_id: G,
            minutes,
            kind,
            alert_channel: Some(99),
            delete_created_channels: false,
            reason: "test".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn apply_then_revert_restores_exact_state() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10, 11]));
        let custom = Overwrite { allow: Permissions::SEND_MESSAGES, deny: Permissions::SPEAK };
        mock.with(|s| s.channels[1].everyone = Some(custom));
        let (sm, audit, _) = machine(mock.clone());

        let out = sm.apply_lockdown(request(RaidKind::Join, 10)).await;
        assert!(out.is_applied());
        assert!(!mock.role(G).contains(Permissions::SEND_MESSAGES));
        assert!(mock.overwrite(10).unwrap().deny.contains(Permissions::SEND_MESSAGES));
        assert_eq!(sm.status(G).unwrap().phase, LockdownPhase::Locked);

        let back = sm.revert_lockdown(G).await;
        assert!(matches!(back, UnlockOutcome::Restored(ref r) if r.role_restored && !r.used_fallback));
        assert_eq!(mock.role(G), everyone());
        assert_eq!(mock.overwrite(10), None);
        assert_eq!(mock.overwrite(11), Some(custom));
        assert!(!sm.is_locked(G));
        assert_eq!(
            audit.kinds(),
            vec![IncidentKind::LockdownStarted, IncidentKind::LockdownEnded]
        );

        assert_eq!(sm.revert_lockdown(G).await, UnlockOutcome::NotLocked);
    }

    #[tokio::test(start_paused = true)]
    async fn second_apply_is_rejected_without_mutations() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10]));
        let (sm, _, _) = machine(mock.clone());

        let (a, b) = tokio::join!(
            sm.apply_lockdown(request(RaidKind::Join, 10)),
            sm.apply_lockdown(request(RaidKind::Role, 10)),
        );
        let applied = [&a, &b].iter().filter(|o| o.is_applied()).count();
        assert_eq!(applied, 1);
        assert!(
            a == LockdownOutcome::Rejected(RejectReason::AlreadyLocked)
                || b == LockdownOutcome::Rejected(RejectReason::AlreadyLocked)
        );
        let role_writes = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetRole(..)))
            .count();
        assert_eq!(role_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_timer_restores_after_duration() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10]));
        let (sm, _, _) = machine(mock.clone());
        sm.apply_lockdown(request(RaidKind::Join, 10)).await;

        tokio::time::sleep(Duration::from_secs(9 * 60)).await;
        assert!(sm.is_locked(G));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!sm.is_locked(G));
        assert_eq!(mock.role(G), everyone());
        assert_eq!(mock.alerts(), vec!["🔒 Lockdown active", "🔓 Lockdown lifted"]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_unlock_cancels_the_timer() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10]));
        let (sm, _, _) = machine(mock.clone());
        sm.apply_lockdown(request(RaidKind::Join, 10)).await;

        assert!(matches!(sm.manual_unlock(G, 42).await, UnlockOutcome::Restored(_)));
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;

        assert_eq!(mock.alerts(), vec!["🔒 Lockdown active", "🔓 Lockdown lifted"]);
        let role_writes = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetRole(..)))
            .count();
        assert_eq!(role_writes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_stale_timer_does_not_end_a_newer_lockdown() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10]));
        let (sm, _, _) = machine(mock.clone());
        sm.apply_lockdown(request(RaidKind::Join, 5)).await;
        sm.revert_lockdown(G).await;
        sm.apply_lockdown(request(RaidKind::Role, 30)).await;

        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert!(sm.is_locked(G));
        assert_eq!(sm.status(G).unwrap().kind, RaidKind::Role);
    }

    #[tokio::test]
    async fn rejects_bad_duration_and_missing_permissions() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10]));
        let (sm, _, _) = machine(mock.clone());

        let out = sm.apply_lockdown(request(RaidKind::Join, 0)).await;
        assert!(matches!(out, LockdownOutcome::Rejected(RejectReason::DurationOutOfBounds { .. })));

        mock.with(|s| s.agent = Permissions::MANAGE_ROLES);
        let out = sm.apply_lockdown(request(RaidKind::Join, 10)).await;
        assert_eq!(out, LockdownOutcome::Rejected(RejectReason::MissingPermissions));
        assert!(!sm.is_locked(G));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_failures_do_not_abort_the_rest() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10, 11, 12]));
        let (sm, _, _) = machine(mock.clone());
        sm.apply_lockdown(request(RaidKind::General, 10)).await;

        mock.with(|s| {
            s.fail_channels.insert(11);
        });
        let UnlockOutcome::Restored(report) = sm.manual_unlock(G, 7).await else {
            panic!("expected restore");
        };
        assert_eq!(report.channels, RemediationSummary { succeeded: 2, failed: 1 });
        assert_eq!(mock.overwrite(10), None);
        assert_eq!(mock.overwrite(12), None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_snapshot_uses_safe_defaults_on_both_ends() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10]));
        mock.with(|s| s.fail_role_read = true);
        let (sm, _, _) = machine(mock.clone());

        let LockdownOutcome::Applied(report) = sm.apply_lockdown(request(RaidKind::Join, 10)).await else {
            panic!("expected lockdown");
        };
        assert!(!report.snapshot_complete);

        let UnlockOutcome::Restored(back) = sm.revert_lockdown(G).await else {
            panic!("expected restore");
        };
        assert!(back.used_fallback);
        assert_eq!(mock.role(G), policy::SAFE_DEFAULT_EVERYONE);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_raid_deletes_registered_channels() {
        let mock = Arc::new(MockPlatform::guild(G, everyone(), &[10, 50, 51]));
        let (sm, audit, registry) = machine(mock.clone());
        let now = Instant::now();
        registry.register(G, 50, now, Duration::from_secs(60));
        registry.register(G, 51, now, Duration::from_secs(60));

        let mut req = request(RaidKind::Channel, 10);
        req.delete_created_channels = true;
        let LockdownOutcome::Applied(report) = sm.apply_lockdown(req).await else {
            panic!("expected lockdown");
        };
        assert_eq!(report.nuked.succeeded, 2);
        assert_eq!(report.channels.succeeded, 1);
        assert!(audit.kinds().contains(&IncidentKind::ChannelsNuked));

        let UnlockOutcome::Restored(back) = sm.revert_lockdown(G).await else {
            panic!("expected restore");
        };
        assert_eq!(back.channels, RemediationSummary { succeeded: 1, failed: 0 });
    }
}
