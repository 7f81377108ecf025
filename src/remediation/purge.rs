use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::RemediationSummary;
use crate::config::PurgeConfig;
use crate::platform::Platform;

/// Hard platform cap on bulk deletes.
const BULK_MAX: usize = 100;

/// What to purge: the offending message and its author's burst around it.
#[derive(Debug, Clone, Copy)]
pub struct PurgeTarget {
    pub channel_id: u64,
    pub trigger_message_id: u64,
    pub author_id: u64,
}

/// Delete the triggering message, then the author's recent messages in the channel.
///
/// History is read in at most `cfg.fetch_pages` pages. Only messages newer than
/// `recency` and younger than the bulk-delete age limit are taken. Each batch is
/// bulk-deleted; a batch that fails falls back to one delete per message.
pub async fn purge_member_messages(
    platform: &dyn Platform,
    cfg: &PurgeConfig,
    target: PurgeTarget,
    recency: Duration,
    now: DateTime<Utc>,
) -> RemediationSummary {
    let mut summary = RemediationSummary::default();

    match platform
        .delete_message(target.channel_id, target.trigger_message_id)
        .await
    {
        Ok(()) => summary.ok(1),
        Err(e) => {
            warn!(error=?e, channel = target.channel_id, msg = target.trigger_message_id, "trigger delete failed");
            summary.fail(1);
        }
    }

    let ids = collect_burst(platform, cfg, target, recency, now).await;
    if ids.is_empty() {
        return summary;
    }

    let batch = cfg.batch_size.clamp(1, BULK_MAX);
    for chunk in ids.chunks(batch) {
        summary.merge(delete_batch(platform, target.channel_id, chunk).await);
    }

    debug!(
        channel = target.channel_id,
        author = target.author_id,
        deleted = summary.succeeded,
        failed = summary.failed,
        "purge finished"
    );
    summary
}

async fn collect_burst(
    platform: &dyn Platform,
    cfg: &PurgeConfig,
    target: PurgeTarget,
    recency: Duration,
    now: DateTime<Utc>,
) -> Vec<u64> {
    let recency = chrono::Duration::from_std(recency).unwrap_or(chrono::Duration::zero());
    let recent_cutoff = now - recency;
    let age_cutoff = now - chrono::Duration::days(cfg.max_age_days);
    let cutoff = recent_cutoff.max(age_cutoff);

    let mut ids = Vec::new();
    let mut before: Option<u64> = None;
    let page_size = cfg.page_size.clamp(1, BULK_MAX as u8);

    for _ in 0..cfg.fetch_pages {
        let page = match platform
            .fetch_messages(target.channel_id, before, page_size)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error=?e, channel = target.channel_id, "history fetch failed");
                break;
            }
        };
        if page.is_empty() {
            break;
        }

        let mut reached_cutoff = false;
        for m in &page {
            if m.created_at <= cutoff {
                reached_cutoff = true;
                continue;
            }
            if m.author_id == target.author_id && m.id != target.trigger_message_id {
                ids.push(m.id);
            }
        }

        // pages are newest first; everything further back is older
        if reached_cutoff || page.len() < page_size as usize {
            break;
        }
        before = page.last().map(|m| m.id);
    }
    ids
}

async fn delete_batch(platform: &dyn Platform, channel_id: u64, ids: &[u64]) -> RemediationSummary {
    let mut summary = RemediationSummary::default();

    if ids.len() > 1 {
        match platform.delete_messages(channel_id, ids).await {
            Ok(()) => {
                summary.ok(ids.len());
                return summary;
            }
            Err(e) => {
                warn!(error=?e, channel = channel_id, batch = ids.len(), "bulk delete failed, deleting one by one");
            }
        }
    }

    for &id in ids {
        match platform.delete_message(channel_id, id).await {
            Ok(()) => summary.ok(1),
            Err(e) => {
                warn!(error=?e, channel = channel_id, msg = id, "message delete failed");
                summary.fail(1);
            }
        }
    }
    summary
}
