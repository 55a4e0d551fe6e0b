//! Retention policy and delta compaction

use crate::log::PathLog;
use pathfeed_core::VersionedStore;
use tracing::debug;

/// Retention policy configuration
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Number of most recent deltas to keep (default: 10000)
    pub retain_deltas: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retain_deltas: 10_000,
        }
    }
}

/// Purges deltas that fall outside the retention window
///
/// Consumers whose cursor is older than the oldest retained delta get a gap
/// from the log and fall back to a full image.
pub struct DeltaCompactor {
    policy: RetentionPolicy,
}

impl DeltaCompactor {
    /// Create a new compactor with the given policy
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Highest sequence number that may be purged when the log is at `latest_seq`
    pub fn cutoff(&self, latest_seq: u64) -> u64 {
        latest_seq.saturating_sub(self.policy.retain_deltas)
    }

    /// Run one compaction pass, returning the number of purged deltas
    pub fn collect(&self, log: &PathLog) -> anyhow::Result<usize> {
        let cutoff = self.cutoff(log.latest_sequence_number()?);
        if cutoff == 0 || cutoff <= log.purged_through() {
            debug!("Nothing to compact (cutoff {})", cutoff);
            return Ok(0);
        }
        log.purge_through(cutoff)
    }
}
