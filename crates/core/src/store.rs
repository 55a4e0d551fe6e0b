//! Boundary to the authoritative versioned store

use crate::update::PathsUpdate;
use anyhow::Result;
use std::collections::BTreeMap;

/// A point-in-time view of the complete object→paths mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathsImage {
    /// Raw paths (absolute paths or URIs) per object
    pub paths: BTreeMap<String, Vec<String>>,
    /// Sequence number in effect when the view was taken
    pub seq_num: u64,
    /// Image the view belongs to
    pub img_num: u64,
}

/// Answer to a "deltas since N" request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaFetch {
    /// Contiguous deltas starting right after the requested sequence number.
    /// Empty means there is nothing new.
    Deltas(Vec<PathsUpdate>),
    /// History after `since` is no longer available; a full image is needed
    Gap { since: u64, latest: u64 },
}

/// The store a provider reads images and deltas from
///
/// Every call must be internally consistent: a sequence number returned with
/// a full image must be resolvable by `retrieve_deltas_since` until the
/// history behind it is compacted away.
pub trait VersionedStore: Send + Sync {
    /// Atomic full snapshot together with its sequence and image numbers
    fn retrieve_full_paths_image(&self) -> Result<PathsImage>;

    /// Up to `limit` deltas with sequence numbers greater than `seq_num`, ascending
    fn retrieve_deltas_since(&self, seq_num: u64, limit: usize) -> Result<DeltaFetch>;

    /// Identifier of the most recently persisted full image
    fn last_processed_image_id(&self) -> Result<u64>;

    /// Highest sequence number in the change log
    fn latest_sequence_number(&self) -> Result<u64>;
}

impl<S: VersionedStore + ?Sized> VersionedStore for std::sync::Arc<S> {
    fn retrieve_full_paths_image(&self) -> Result<PathsImage> {
        (**self).retrieve_full_paths_image()
    }

    fn retrieve_deltas_since(&self, seq_num: u64, limit: usize) -> Result<DeltaFetch> {
        (**self).retrieve_deltas_since(seq_num, limit)
    }

    fn last_processed_image_id(&self) -> Result<u64> {
        (**self).last_processed_image_id()
    }

    fn latest_sequence_number(&self) -> Result<u64> {
        (**self).latest_sequence_number()
    }
}
