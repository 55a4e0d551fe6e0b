//! Live replica: a path tree shared between one applier and many readers
//!
//! Readers take the read side of a `parking_lot::RwLock`. Applying an update
//! takes the write side exactly once, for the in-memory merge only:
//! validation happens before the lock, and full images are built off-lock
//! and swapped in. A reader therefore sees the tree before or after an
//! update, never in between.

use crate::error::UpdateError;
use crate::intern::Interner;
use crate::path::PathPrefixes;
use crate::tree::PathTree;
use crate::update::PathsUpdate;
use crate::PathsDump;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Position of a consumer in the change log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last applied sequence number
    pub seq_num: u64,
    /// Image the applied content belongs to (0 = no image yet)
    pub img_num: u64,
}

impl Cursor {
    pub fn has_image(&self) -> bool {
        self.img_num != 0
    }
}

/// The consumer-side path tree
pub struct Replica {
    tree: RwLock<PathTree>,
}

impl Replica {
    /// Create an empty replica with its own interner
    pub fn new(prefixes: PathPrefixes) -> Self {
        Self::from_tree(PathTree::new(prefixes))
    }

    /// Create an empty replica that interns through a shared table
    pub fn with_interner(prefixes: PathPrefixes, interner: Arc<Interner>) -> Self {
        Self::from_tree(PathTree::with_interner(prefixes, interner))
    }

    /// Wrap an existing tree, e.g. one restored from a local snapshot
    pub fn from_tree(tree: PathTree) -> Self {
        Self {
            tree: RwLock::new(tree),
        }
    }

    /// Apply one update atomically with respect to readers
    ///
    /// Rejected updates leave the replica exactly as it was.
    pub fn apply(&self, update: &PathsUpdate) -> Result<(), UpdateError> {
        update.validate()?;

        if update.is_full_image() {
            let fresh = self.build_image(update)?;
            let mut tree = self.tree.write();
            tree.check_order(update)?;
            *tree = fresh;
            drop(tree);
            debug!(
                "Replica replaced by full image {} (image {})",
                update.seq_num(),
                update.img_num()
            );
            return Ok(());
        }

        let mut tree = self.tree.write();
        tree.check_order(update)?;
        tree.apply_validated(update);
        drop(tree);
        debug!(
            "Replica applied delta {} ({} paths)",
            update.seq_num(),
            update.path_count()
        );
        Ok(())
    }

    /// Build the tree a full image describes, preferring its attached dump
    fn build_image(&self, update: &PathsUpdate) -> Result<PathTree, UpdateError> {
        let (prefixes, interner) = {
            let tree = self.tree.read();
            (tree.prefixes().clone(), tree.interner().clone())
        };

        let mut fresh = match update.dump() {
            Some(dump) => PathTree::from_dump(dump, prefixes, interner)?,
            None => {
                let mut scratch = PathTree::with_interner(prefixes, interner);
                scratch.apply_validated(update);
                scratch
            }
        };
        fresh.set_position(update.seq_num(), update.img_num());
        Ok(fresh)
    }

    /// Run `f` against a consistent view of the tree
    pub fn read<R>(&self, f: impl FnOnce(&PathTree) -> R) -> R {
        f(&self.tree.read())
    }

    /// Current position
    pub fn cursor(&self) -> Cursor {
        let tree = self.tree.read();
        Cursor {
            seq_num: tree.seq_num(),
            img_num: tree.img_num(),
        }
    }

    pub fn paths_of(&self, object: &str) -> Option<Vec<String>> {
        self.tree.read().paths_of(object)
    }

    pub fn objects_for_path(&self, path: &str) -> Vec<String> {
        self.tree.read().objects_for_path(path)
    }

    /// Dump of the current content together with its position
    pub fn dump(&self) -> (Cursor, PathsDump) {
        let tree = self.tree.read();
        let cursor = Cursor {
            seq_num: tree.seq_num(),
            img_num: tree.img_num(),
        };
        (cursor, tree.to_dump())
    }

    pub fn prefixes(&self) -> PathPrefixes {
        self.tree.read().prefixes().clone()
    }

    pub fn interner(&self) -> Arc<Interner> {
        self.tree.read().interner().clone()
    }
}
