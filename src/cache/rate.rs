use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use super::{EventStore, Namespace, RateKey};

/// Result of a single [`RateCounter::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub count: usize,
    pub exceeded: bool,
}

/// "Has key K reached N events within window W?" on top of an [`EventStore`].
#[derive(Clone)]
pub struct RateCounter {
    store: Arc<dyn EventStore>,
}

impl RateCounter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Record one event for `key` and compare the in-window count with `threshold`.
    ///
    /// The event is appended and the key pruned before the comparison, so the
    /// triggering event always counts and stale events never do.
    pub fn observe(
        &self,
        ns: Namespace,
        key: &RateKey,
        window: Duration,
        threshold: u32,
        now: Instant,
    ) -> Observation {
        let count = self.store.record_and_count(ns, key, now, window);
        Observation {
            count,
            exceeded: count >= threshold as usize,
        }
    }

    /// Forget everything recorded for `key`, e.g. after an incident was handled.
    pub fn reset(&self, ns: Namespace, key: &RateKey) {
        self.store.reset(ns, key);
    }
}
