//! Reconciliation errors

use pathfeed_core::UpdateError;
use thiserror::Error;

/// Why a reconciliation step failed
///
/// Either way the replica keeps its last good position and the next step
/// retries from there.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store request failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error("update rejected: {0}")]
    Rejected(#[from] UpdateError),
}

impl SyncError {
    /// Classify a failed full image retrieval
    ///
    /// The retriever builds a tree from the store's snapshot, so its errors
    /// are either store failures or bad data in the snapshot.
    pub fn from_retrieval(err: anyhow::Error) -> Self {
        match err.downcast::<UpdateError>() {
            Ok(rejected) => SyncError::Rejected(rejected),
            Err(err) => SyncError::Store(err),
        }
    }

    /// True if the failure came from the store rather than the data
    pub fn is_store(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }
}
