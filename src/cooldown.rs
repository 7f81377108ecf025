//! Hard cooldowns per subject and debounce per (guild, raid kind).

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{task::AbortHandle, time::Instant};
use tracing::debug;

use crate::cache::RateKey;
use crate::detectors::RaidKind;

#[derive(Debug)]
struct CooldownEntry {
    expires_at: Instant,
    expiry: Option<AbortHandle>,
}

/// Suppresses every qualifying action of a subject until its entry expires.
///
/// Each entry owns a small task that removes it at `expires_at`; clearing the entry by
/// hand aborts that task. Lookups also compare against `expires_at`, so an entry whose
/// task has not run yet is never reported as active.
#[derive(Debug, Default)]
pub struct CooldownRegister {
    entries: Arc<DashMap<RateKey, CooldownEntry>>,
}

impl CooldownRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or extend) a cooldown. Returns the expiry instant.
    pub fn activate(&self, subject: RateKey, duration: Duration, now: Instant) -> Instant {
        let expires_at = now + duration;
        let expiry = self.spawn_expiry(subject.clone(), expires_at);
        let previous = self.entries.insert(
            subject,
            CooldownEntry {
                expires_at,
                expiry: Some(expiry),
            },
        );
        if let Some(old) = previous.and_then(|e| e.expiry) {
            old.abort();
        }
        expires_at
    }

    fn spawn_expiry(&self, key: RateKey, expires_at: Instant) -> AbortHandle {
        let weak = Arc::downgrade(&self.entries);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(entries) = weak.upgrade() {
                entries.remove_if(&key, |_, e| e.expires_at <= Instant::now());
            }
        });
        task.abort_handle()
    }

    pub fn is_active(&self, subject: &RateKey, now: Instant) -> bool {
        self.entries
            .get(subject)
            .is_some_and(|e| e.expires_at > now)
    }

    pub fn expires_at(&self, subject: &RateKey) -> Option<Instant> {
        self.entries.get(subject).map(|e| e.expires_at)
    }

    /// Cancel a cooldown and its expiry task. Returns whether one existed.
    pub fn clear(&self, subject: &RateKey) -> bool {
        match self.entries.remove(subject) {
            Some((_, entry)) => {
                if let Some(task) = entry.expiry {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Check and start in one shard-locked step: true for exactly one of any number of
    /// concurrent callers while the subject is free.
    pub fn try_acquire(&self, subject: RateKey, duration: Duration, now: Instant) -> bool {
        let expires_at = now + duration;
        match self.entries.entry(subject) {
            Entry::Occupied(mut e) => {
                if e.get().expires_at > now {
                    return false;
                }
                let expiry = self.spawn_expiry(e.key().clone(), expires_at);
                let old = e.insert(CooldownEntry {
                    expires_at,
                    expiry: Some(expiry),
                });
                if let Some(task) = old.expiry {
                    task.abort();
                }
                true
            }
            Entry::Vacant(e) => {
                let expiry = self.spawn_expiry(e.key().clone(), expires_at);
                e.insert(CooldownEntry {
                    expires_at,
                    expiry: Some(expiry),
                });
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collapses a burst of threshold breaches into one remediation call.
///
/// Policy: the first breach for a (guild, kind) pair fires, every further breach within
/// `interval` of it is suppressed.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    last_fired: DashMap<(u64, RaidKind), Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: DashMap::new(),
        }
    }

    pub fn try_fire(&self, guild_id: u64, kind: RaidKind, now: Instant) -> bool {
        match self.last_fired.entry((guild_id, kind)) {
            Entry::Occupied(mut e) => {
                if now.saturating_duration_since(*e.get()) < self.interval {
                    debug!(gid = guild_id, kind = %kind, "breach debounced");
                    false
                } else {
                    e.insert(now);
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    /// Drop entries whose interval elapsed.
    pub fn sweep(&self, now: Instant) {
        let interval = self.interval;
        self.last_fired
            .retain(|_, t| now.saturating_duration_since(*t) < interval);
    }
}
