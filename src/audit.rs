//! Structured incident records for the audit log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::async_trait;
use tracing::{info, warn};

use crate::db::{self, Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    SpamDetected,
    RaidDetected,
    LockdownStarted,
    LockdownEnded,
    ChannelsNuked,
}

impl IncidentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentKind::SpamDetected => "spam_detected",
            IncidentKind::RaidDetected => "raid_detected",
            IncidentKind::LockdownStarted => "lockdown_started",
            IncidentKind::LockdownEnded => "lockdown_ended",
            IncidentKind::ChannelsNuked => "channels_nuked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub guild_id: u64,
    pub kind: IncidentKind,
    pub count: u64,
    pub threshold: u64,
    pub at: DateTime<Utc>,
    pub detail: Value,
}

impl IncidentRecord {
    pub fn new(guild_id: u64, kind: IncidentKind) -> Self {
        Self {
            guild_id,
            kind,
            count: 0,
            threshold: 0,
            at: Utc::now(),
            detail: Value::Null,
        }
    }

    pub fn counts(mut self, count: usize, threshold: u32) -> Self {
        self.count = count as u64;
        self.threshold = threshold as u64;
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Sink for incident records. Implementations swallow their own failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, incident: &IncidentRecord);
}

/// Writes incidents to the log only.
#[derive(Debug, Default)]
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, incident: &IncidentRecord) {
        log_incident(incident);
    }
}

/// Logs and persists incidents to `tss.raidguard_incidents`, best-effort.
pub struct PgAudit {
    db: Db,
}

impl PgAudit {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn try_record(&self, incident: &IncidentRecord) -> Result<i64> {
        db::insert_incident(&self.db, incident).await
    }
}

#[async_trait]
impl AuditSink for PgAudit {
    async fn record(&self, incident: &IncidentRecord) {
        log_incident(incident);
        if let Err(e) = self.try_record(incident).await {
            warn!(error=?e, gid = incident.guild_id, kind = incident.kind.as_str(), "audit insert failed");
        }
    }
}

fn log_incident(incident: &IncidentRecord) {
    info!(
        gid = incident.guild_id,
        kind = incident.kind.as_str(),
        count = incident.count,
        threshold = incident.threshold,
        at = %incident.at.to_rfc3339(),
        detail = %incident.detail,
        "incident"
    );
}
