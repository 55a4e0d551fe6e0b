//! pathfeed core - path change feed primitives
//!
//! This crate provides:
//! - The versioned update model (full images and deltas)
//! - Wire encoding for updates and compact tree dumps
//! - Component interning and managed path prefixes
//! - The path tree and the lock-protected live replica
//! - The versioned store boundary and the full image retriever
//! - Prometheus metrics for image retrieval

pub mod codec;
pub mod dump;
pub mod error;
pub mod intern;
pub mod metrics;
pub mod path;
pub mod replica;
pub mod retriever;
pub mod store;
pub mod tree;
pub mod update;

// Re-export main types for convenience
pub use codec::{decode_update, encode_update};
pub use dump::PathsDump;
pub use error::{CodecError, UpdateError};
pub use intern::{Component, Interner};
pub use metrics::RetrieverMetrics;
pub use path::{join_components, split_path, PathPrefixes};
pub use replica::{Cursor, Replica};
pub use retriever::ImageRetriever;
pub use store::{DeltaFetch, PathsImage, VersionedStore};
pub use tree::PathTree;
pub use update::{PathChanges, PathComponents, PathsUpdate};

/// Common result type used at store and I/O boundaries
pub type Result<T> = anyhow::Result<T>;
