//! Bounded TTL cache of timestamped events.
//!
//! Every detector writes into one [`Namespace`] of an [`EventStore`]. The store keeps
//! one list of instants per [`RateKey`], drops instants that fell out of the retention
//! window and caps the number of distinct keys per namespace. When the cap is hit the
//! keys whose oldest surviving event is the oldest go first, even if they are still
//! inside their detection window.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

pub mod rate;

pub use rate::{Observation, RateCounter};

/// Logical bucket of the cache. Each detector owns exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
    RecentMessages,
    RecentJoins,
    RecentChannels,
    RecentRoles,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::RecentMessages,
        Namespace::RecentJoins,
        Namespace::RecentChannels,
        Namespace::RecentRoles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::RecentMessages => "recent-messages",
            Namespace::RecentJoins => "recent-joins",
            Namespace::RecentChannels => "recent-channels",
            Namespace::RecentRoles => "recent-roles",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key scoping a counter or a cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateKey(String);

impl RateKey {
    /// Per-member key (spam).
    pub fn member(guild_id: u64, user_id: u64) -> Self {
        Self(format!("{guild_id}:{user_id}"))
    }

    /// Per-guild key (raids).
    pub fn guild(guild_id: u64) -> Self {
        Self(guild_id.to_string())
    }

    /// Per-member, per-command key (command cooldowns).
    pub fn command(guild_id: u64, user_id: u64, command: &str) -> Self {
        Self(format!("{guild_id}:{user_id}:{command}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Size and retention limits of one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceLimits {
    /// Maximum number of distinct keys.
    pub max_keys: usize,
    /// Events older than this are purged by the sweeper.
    pub retention_secs: u64,
    /// Sweeper period.
    pub sweep_every_secs: u64,
}

impl NamespaceLimits {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_secs(self.sweep_every_secs.max(1))
    }
}

impl Default for NamespaceLimits {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            retention_secs: 600,
            sweep_every_secs: 60,
        }
    }
}

/// Store abstraction the rate counter and detectors are built on.
///
/// Implementations must keep each call atomic with respect to a single namespace:
/// callers rely on [`EventStore::record_and_count`] never observing a half-updated list.
pub trait EventStore: Send + Sync {
    /// Events currently held for `key`, oldest first.
    fn events(&self, ns: Namespace, key: &RateKey) -> Vec<Instant>;

    /// Replace the list for `key`. An empty list removes the key.
    fn set(&self, ns: Namespace, key: &RateKey, events: Vec<Instant>);

    /// Append one event and enforce the namespace key limit.
    fn record(&self, ns: Namespace, key: &RateKey, at: Instant);

    /// Append one event, prune `key` to `window` and return the surviving count.
    fn record_and_count(&self, ns: Namespace, key: &RateKey, at: Instant, window: Duration)
        -> usize;

    /// Remove events older than `window` for every key; returns removed keys.
    fn sweep(&self, ns: Namespace, window: Duration, now: Instant) -> usize;

    /// Evict keys (oldest first event first) until at most `limit` remain.
    fn evict(&self, ns: Namespace, limit: usize) -> usize;

    /// Drop a key entirely.
    fn reset(&self, ns: Namespace, key: &RateKey);

    /// Number of distinct keys in a namespace.
    fn key_count(&self, ns: Namespace) -> usize;
}

type Bucket = HashMap<RateKey, VecDeque<Instant>>;

/// In-process [`EventStore`] backed by a [`DashMap`] of namespaces.
///
/// The namespace shard guard is held for the whole of every call and never across an
/// `.await`, which is what makes each call atomic.
#[derive(Debug)]
pub struct TtlCache {
    buckets: DashMap<Namespace, Bucket>,
    limits: HashMap<Namespace, NamespaceLimits>,
}

impl TtlCache {
    pub fn new(limits: HashMap<Namespace, NamespaceLimits>) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self, ns: Namespace) -> NamespaceLimits {
        self.limits.get(&ns).copied().unwrap_or_default()
    }

    /// Spawn one sweeper per namespace. Tasks stop once the cache is dropped.
    pub fn spawn_sweepers(this: &Arc<Self>) {
        for ns in Namespace::ALL {
            let weak = Arc::downgrade(this);
            let limits = this.limits(ns);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(limits.sweep_every());
                loop {
                    interval.tick().await;
                    let Some(strong) = weak.upgrade() else {
                        break;
                    };
                    let now = Instant::now();
                    let swept = strong.sweep(ns, limits.retention(), now);
                    let evicted = strong.evict(ns, limits.max_keys);
                    if swept > 0 || evicted > 0 {
                        debug!(namespace = %ns, swept, evicted, "cache sweep");
                    }
                }
            });
        }
    }
}

impl EventStore for TtlCache {
    fn events(&self, ns: Namespace, key: &RateKey) -> Vec<Instant> {
        self.buckets
            .get(&ns)
            .and_then(|b| b.get(key).map(|q| q.iter().copied().collect()))
            .unwrap_or_default()
    }

    fn set(&self, ns: Namespace, key: &RateKey, events: Vec<Instant>) {
        let mut bucket = self.buckets.entry(ns).or_default();
        if events.is_empty() {
            bucket.remove(key);
            return;
        }
        let mut q: VecDeque<Instant> = events.into();
        q.make_contiguous().sort();
        bucket.insert(key.clone(), q);
        evict_oldest(&mut bucket, self.limits(ns).max_keys);
    }

    fn record(&self, ns: Namespace, key: &RateKey, at: Instant) {
        let mut bucket = self.buckets.entry(ns).or_default();
        push_sorted(bucket.entry(key.clone()).or_default(), at);
        evict_oldest(&mut bucket, self.limits(ns).max_keys);
    }

    fn record_and_count(
        &self,
        ns: Namespace,
        key: &RateKey,
        at: Instant,
        window: Duration,
    ) -> usize {
        let mut bucket = self.buckets.entry(ns).or_default();
        let count = {
            let q = bucket.entry(key.clone()).or_default();
            push_sorted(q, at);
            prune_outside(q, window, at);
            q.len()
        };
        evict_oldest(&mut bucket, self.limits(ns).max_keys);
        count
    }

    fn sweep(&self, ns: Namespace, window: Duration, now: Instant) -> usize {
        let Some(mut bucket) = self.buckets.get_mut(&ns) else {
            return 0;
        };
        let before = bucket.len();
        bucket.retain(|_, q| {
            prune_outside(q, window, now);
            !q.is_empty()
        });
        before - bucket.len()
    }

    fn evict(&self, ns: Namespace, limit: usize) -> usize {
        match self.buckets.get_mut(&ns) {
            Some(mut bucket) => evict_oldest(&mut bucket, limit),
            None => 0,
        }
    }

    fn reset(&self, ns: Namespace, key: &RateKey) {
        if let Some(mut bucket) = self.buckets.get_mut(&ns) {
            bucket.remove(key);
        }
    }

    fn key_count(&self, ns: Namespace) -> usize {
        self.buckets.get(&ns).map(|b| b.len()).unwrap_or(0)
    }
}

/// Keeps the deque ordered; events normally arrive in order so this is a push_back.
fn push_sorted(q: &mut VecDeque<Instant>, at: Instant) {
    match q.back() {
        Some(&last) if last > at => {
            let idx = q.partition_point(|&t| t <= at);
            q.insert(idx, at);
        }
        _ => q.push_back(at),
    }
}

/// Drops events with `now - t >= window`. Events stamped after `now` are kept.
fn prune_outside(q: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&front) = q.front() {
        if now.saturating_duration_since(front) >= window {
            q.pop_front();
        } else {
            break;
        }
    }
}

fn evict_oldest(bucket: &mut Bucket, limit: usize) -> usize {
    if bucket.len() <= limit {
        return 0;
    }
    let excess = bucket.len() - limit;
    let mut ranked: Vec<(Option<Instant>, RateKey)> = bucket
        .iter()
        .map(|(k, q)| (q.front().copied(), k.clone()))
        .collect();
    // empty lists (None) rank first
    ranked.sort();
    for (_, key) in ranked.into_iter().take(excess) {
        bucket.remove(&key);
    }
    excess
}
