//! Replica synchronization
//!
//! This crate provides:
//! - The reconciliation loop that keeps a replica in line with a store
//! - Consumer configuration loaded from TOML
//! - Local snapshots for fast restarts

pub mod config;
pub mod error;
pub mod reconcile;
pub mod snapshot;

// Re-exports
pub use config::SyncConfig;
pub use error::SyncError;
pub use reconcile::{BehindReason, Reconciler, StepOutcome, SyncState};
pub use snapshot::{load_snapshot, save_snapshot};
