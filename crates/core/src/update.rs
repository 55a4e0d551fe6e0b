//! The unit of change shipped from the store to consumers

use crate::dump::PathsDump;
use crate::error::UpdateError;
use crate::intern::Component;
use crate::path::join_components;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One path as an ordered list of components
pub type PathComponents = Vec<Component>;

/// Path changes for a single object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChanges {
    /// Paths to add to the object
    pub add_paths: Vec<PathComponents>,
    /// Paths to remove from the object
    pub del_paths: Vec<PathComponents>,
    /// Remove every path of the object before adding (e.g. drop table)
    pub drop_all: bool,
}

impl PathChanges {
    pub fn is_empty(&self) -> bool {
        self.add_paths.is_empty() && self.del_paths.is_empty() && !self.drop_all
    }
}

/// A full image or an incremental delta, stamped with its position in the change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsUpdate {
    seq_num: u64,
    img_num: u64,
    full_image: bool,
    /// Keyed by object name; sorted so the encoding is deterministic
    changes: BTreeMap<String, PathChanges>,
    /// Compact tree dump attached to full images by the retriever
    dump: Option<PathsDump>,
}

impl PathsUpdate {
    /// Create an empty update
    pub fn new(seq_num: u64, img_num: u64, full_image: bool) -> Self {
        Self {
            seq_num,
            img_num,
            full_image,
            changes: BTreeMap::new(),
            dump: None,
        }
    }

    /// Create an empty full image
    pub fn full_image(seq_num: u64, img_num: u64) -> Self {
        Self::new(seq_num, img_num, true)
    }

    /// Create an empty delta
    pub fn delta(seq_num: u64, img_num: u64) -> Self {
        Self::new(seq_num, img_num, false)
    }

    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    pub fn img_num(&self) -> u64 {
        self.img_num
    }

    pub fn is_full_image(&self) -> bool {
        self.full_image
    }

    /// Changes for `object`, created empty on first access
    pub fn changes_mut(&mut self, object: &str) -> &mut PathChanges {
        self.changes.entry(object.to_string()).or_default()
    }

    /// Builder-style add
    pub fn add_path(mut self, object: &str, path: PathComponents) -> Self {
        self.changes_mut(object).add_paths.push(path);
        self
    }

    /// Builder-style delete
    pub fn del_path(mut self, object: &str, path: PathComponents) -> Self {
        self.changes_mut(object).del_paths.push(path);
        self
    }

    /// Builder-style drop of every path of `object`
    pub fn drop_object(mut self, object: &str) -> Self {
        self.changes_mut(object).drop_all = true;
        self
    }

    /// All per-object changes
    pub fn changes(&self) -> &BTreeMap<String, PathChanges> {
        &self.changes
    }

    /// Attach the compact dump of the tree this full image produces
    pub fn attach_dump(&mut self, dump: PathsDump) {
        self.dump = Some(dump);
    }

    pub fn dump(&self) -> Option<&PathsDump> {
        self.dump.as_ref()
    }

    /// Total number of added and deleted paths
    pub fn path_count(&self) -> usize {
        self.changes
            .values()
            .map(|c| c.add_paths.len() + c.del_paths.len())
            .sum()
    }

    /// Check the structural invariants of the update
    ///
    /// Does not look at any tree; ordering is checked by the applier.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.img_num > self.seq_num {
            return Err(UpdateError::InconsistentImage {
                seq_num: self.seq_num,
                img_num: self.img_num,
            });
        }

        for (object, change) in &self.changes {
            if object.is_empty() {
                return Err(UpdateError::EmptyObjectName {
                    seq_num: self.seq_num,
                });
            }

            if self.full_image {
                if !change.del_paths.is_empty() || change.drop_all {
                    return Err(UpdateError::DeletionInFullImage {
                        seq_num: self.seq_num,
                        object: object.clone(),
                    });
                }
                continue;
            }

            if change.del_paths.is_empty() {
                continue;
            }
            let added: AHashSet<&[Component]> =
                change.add_paths.iter().map(|p| p.as_slice()).collect();
            if let Some(overlap) = change
                .del_paths
                .iter()
                .find(|p| added.contains(p.as_slice()))
            {
                return Err(UpdateError::OverlappingChange {
                    seq_num: self.seq_num,
                    object: object.clone(),
                    path: join_components(overlap),
                });
            }
        }

        Ok(())
    }
}
