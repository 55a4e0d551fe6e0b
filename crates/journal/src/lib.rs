//! Path change log
//!
//! This crate provides:
//! - A sled-backed store of object→paths with an ordered delta log
//! - Full image persistence that starts a new image lineage
//! - Retention policy & delta compaction

pub mod log;
pub mod retention;

// Re-exports
pub use log::PathLog;
pub use retention::{DeltaCompactor, RetentionPolicy};

/// Result type for journal operations
pub type Result<T> = anyhow::Result<T>;
