//! Error types for update validation, ordering and encoding

use thiserror::Error;

/// Reasons an update is refused by a path tree or replica
#[derive(Debug, Error)]
pub enum UpdateError {
    /// An object change without an object name
    #[error("update {seq_num} contains a change with an empty object name")]
    EmptyObjectName { seq_num: u64 },

    /// The same path is both added to and deleted from one object
    #[error("update {seq_num} both adds and deletes {path} for {object}")]
    OverlappingChange {
        seq_num: u64,
        object: String,
        path: String,
    },

    /// A full image may only add paths
    #[error("full image {seq_num} carries deletions for {object}")]
    DeletionInFullImage { seq_num: u64, object: String },

    /// Image numbers never run ahead of sequence numbers
    #[error("update {seq_num} claims image {img_num}, which is ahead of its sequence number")]
    InconsistentImage { seq_num: u64, img_num: u64 },

    /// A delta that is not the next expected sequence number
    #[error("expected update {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    /// A delta that belongs to a different image lineage
    #[error("delta {seq_num} belongs to image {actual}, tree is on image {expected}")]
    ImageMismatch {
        seq_num: u64,
        expected: u64,
        actual: u64,
    },

    /// A full image that would move the tree back to an earlier position
    #[error(
        "full image {actual} (image {actual_img}) is older than applied update {current} (image {current_img})"
    )]
    StaleImage {
        current: u64,
        current_img: u64,
        actual: u64,
        actual_img: u64,
    },

    /// The attached dump could not be turned back into a tree
    #[error("attached dump is unusable: {0}")]
    Dump(#[from] CodecError),
}

impl UpdateError {
    /// True when the update itself is bad, as opposed to arriving at the wrong time
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            UpdateError::EmptyObjectName { .. }
                | UpdateError::OverlappingChange { .. }
                | UpdateError::DeletionInFullImage { .. }
                | UpdateError::InconsistentImage { .. }
                | UpdateError::Dump(_)
        )
    }
}

/// Errors raised while encoding or decoding updates and dumps
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer too short for a {0} header")]
    Truncated(&'static str),

    #[error("bad magic bytes: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    /// Structural damage inside a decoded dump
    #[error("corrupt dump: {0}")]
    CorruptDump(String),
}
