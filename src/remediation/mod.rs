//! Corrective actions taken after a detector fires.

pub mod channels;
pub mod purge;

pub use channels::RaidChannelRegistry;
pub use purge::purge_member_messages;

/// Outcome of a best-effort batch of external mutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemediationSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl RemediationSummary {
    pub fn ok(&mut self, n: usize) {
        self.succeeded += n;
    }

    pub fn fail(&mut self, n: usize) {
        self.failed += n;
    }

    pub fn merge(&mut self, other: RemediationSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }

    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}
