//! Path tree: the replica of the object→paths mapping
//!
//! Paths are kept twice: as a trie of interned components (for "which object
//! governs this path" lookups and for dumps) and as a per-object index of
//! path keys (for "which paths does this object have" lookups and deletes).
//!
//! A bare `PathTree` has no locking. The scratch trees the retriever builds
//! use it directly; the live replica wraps it in [`crate::Replica`].

use crate::dump::{DumpBuilder, PathsDump};
use crate::error::{CodecError, UpdateError};
use crate::intern::{Component, Interner};
use crate::path::{join_components, split_path, PathPrefixes};
use crate::update::PathsUpdate;
use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Interned component sequence used as an index key
///
/// SmallVec keeps typical warehouse paths (< 8 levels) off the heap.
type PathKey = SmallVec<[Component; 8]>;

/// One trie node: children by component, plus objects registered exactly here
#[derive(Debug, Default)]
struct Node {
    children: AHashMap<Component, Node>,
    objects: SmallVec<[Component; 1]>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.objects.is_empty()
    }

    fn insert(&mut self, path: &[Component], object: &Component) {
        let mut node = self;
        for component in path {
            node = node.children.entry(component.clone()).or_default();
        }
        if !node.objects.iter().any(|o| o == object) {
            node.objects.push(object.clone());
        }
    }

    /// Remove `object` at `path`, pruning nodes that end up empty
    fn remove(&mut self, path: &[Component], object: &str) {
        match path.split_first() {
            None => self.objects.retain(|o| &**o != object),
            Some((head, rest)) => {
                if let Some(child) = self.children.get_mut(&**head) {
                    child.remove(rest, object);
                    if child.is_empty() {
                        self.children.remove(&**head);
                    }
                }
            }
        }
    }

    fn dump_children<'a>(&'a self, builder: &mut DumpBuilder<'a>, idx: u32) {
        let mut children: Vec<_> = self.children.iter().collect();
        children.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (component, child) in children {
            let objects = sorted_strs(&child.objects);
            let child_idx = builder.push_child(idx, component, &objects);
            child.dump_children(builder, child_idx);
        }
    }
}

fn sorted_strs(values: &[Component]) -> Vec<&str> {
    let mut out: Vec<&str> = values.iter().map(|v| &**v).collect();
    out.sort_unstable();
    out
}

/// In-memory mapping from objects to the filesystem paths they own
#[derive(Debug)]
pub struct PathTree {
    prefixes: PathPrefixes,
    interner: Arc<Interner>,
    root: Node,
    objects: AHashMap<Component, AHashSet<PathKey>>,
    /// Sequence number of the last applied update (0 = none)
    seq_num: u64,
    /// Image the tree content belongs to (0 = none)
    img_num: u64,
}

impl PathTree {
    /// Create an empty tree with its own interner
    pub fn new(prefixes: PathPrefixes) -> Self {
        Self::with_interner(prefixes, Arc::new(Interner::new()))
    }

    /// Create an empty tree that interns through a shared table
    pub fn with_interner(prefixes: PathPrefixes, interner: Arc<Interner>) -> Self {
        Self {
            prefixes,
            interner,
            root: Node::default(),
            objects: AHashMap::new(),
            seq_num: 0,
            img_num: 0,
        }
    }

    /// Rebuild a tree from a dump without replaying any update history
    ///
    /// The result has no position; the caller stamps it from the update the
    /// dump came with.
    pub fn from_dump(
        dump: &PathsDump,
        prefixes: PathPrefixes,
        interner: Arc<Interner>,
    ) -> Result<Self, CodecError> {
        let mut tree = Self::with_interner(prefixes, interner);
        dump.for_each_entry(|object, path| {
            tree.insert_path(object, path);
        })?;
        Ok(tree)
    }

    /// Encode the current content as a compact dump
    pub fn to_dump(&self) -> PathsDump {
        let root_objects = sorted_strs(&self.root.objects);
        let mut builder = DumpBuilder::new(&root_objects);
        self.root.dump_children(&mut builder, 0);
        builder.finish()
    }

    pub fn prefixes(&self) -> &PathPrefixes {
        &self.prefixes
    }

    pub fn interner(&self) -> &Arc<Interner> {
        &self.interner
    }

    /// Sequence number of the last applied update
    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    /// Image number the content belongs to
    pub fn img_num(&self) -> u64 {
        self.img_num
    }

    pub(crate) fn set_position(&mut self, seq_num: u64, img_num: u64) {
        self.seq_num = seq_num;
        self.img_num = img_num;
    }

    /// Validate `update`, check it is the next one for this tree, then apply it
    pub fn apply(&mut self, update: &PathsUpdate) -> Result<(), UpdateError> {
        update.validate()?;
        self.check_order(update)?;
        self.apply_validated(update);
        Ok(())
    }

    /// Check that `update` may follow the current position
    ///
    /// Deltas must carry exactly the next sequence number and the current
    /// image. Full images may replace the content but never move the position
    /// backwards: neither the sequence number nor the image number may drop.
    /// Re-applying the current position is allowed.
    pub(crate) fn check_order(&self, update: &PathsUpdate) -> Result<(), UpdateError> {
        if update.is_full_image() {
            if update.seq_num() < self.seq_num || update.img_num() < self.img_num {
                return Err(UpdateError::StaleImage {
                    current: self.seq_num,
                    current_img: self.img_num,
                    actual: update.seq_num(),
                    actual_img: update.img_num(),
                });
            }
            return Ok(());
        }

        let expected = self.seq_num + 1;
        if update.seq_num() != expected {
            return Err(UpdateError::OutOfOrder {
                expected,
                actual: update.seq_num(),
            });
        }
        if update.img_num() != self.img_num {
            return Err(UpdateError::ImageMismatch {
                seq_num: update.seq_num(),
                expected: self.img_num,
                actual: update.img_num(),
            });
        }
        Ok(())
    }

    /// Apply an update that already passed `validate` and `check_order`
    pub(crate) fn apply_validated(&mut self, update: &PathsUpdate) {
        if update.is_full_image() {
            self.clear();
            for (object, changes) in update.changes() {
                for path in &changes.add_paths {
                    self.insert_path(object, path);
                }
            }
            self.set_position(update.seq_num(), update.img_num());
            return;
        }

        for (object, changes) in update.changes() {
            if changes.drop_all {
                self.remove_object(object);
            }
            for path in &changes.add_paths {
                self.insert_path(object, path);
            }
            for path in &changes.del_paths {
                self.remove_path(object, path);
            }
        }
        self.seq_num = update.seq_num();
    }

    fn clear(&mut self) {
        self.root = Node::default();
        self.objects.clear();
    }

    fn path_key<S: AsRef<str>>(&self, path: &[S]) -> PathKey {
        path.iter().map(|c| self.interner.intern(c.as_ref())).collect()
    }

    /// Register `path` for `object`; returns false if the path is not managed
    pub fn insert_path<S: AsRef<str>>(&mut self, object: &str, path: &[S]) -> bool {
        if !self.prefixes.manages(path) {
            return false;
        }
        let object = self.interner.intern(object);
        let key = self.path_key(path);
        self.root.insert(&key, &object);
        self.objects.entry(object).or_default().insert(key);
        true
    }

    /// Key of an already registered path, without interning anything new
    ///
    /// A component the interner has never seen cannot be part of any stored path.
    fn existing_key<S: AsRef<str>>(&self, path: &[S]) -> Option<PathKey> {
        path.iter().map(|c| self.interner.get(c.as_ref())).collect()
    }

    /// Remove one path from `object`; the object disappears with its last path
    pub fn remove_path<S: AsRef<str>>(&mut self, object: &str, path: &[S]) {
        if !self.objects.contains_key(object) {
            return;
        }
        let Some(key) = self.existing_key(path) else {
            return;
        };
        let Some(paths) = self.objects.get_mut(object) else {
            return;
        };
        if !paths.remove(&key) {
            return;
        }
        if paths.is_empty() {
            self.objects.remove(object);
        }
        self.root.remove(&key, object);
    }

    /// Remove `object` and every path it owns
    pub fn remove_object(&mut self, object: &str) {
        let Some(paths) = self.objects.remove(object) else {
            return;
        };
        for key in paths {
            self.root.remove(&key, object);
        }
    }

    /// Paths owned by `object`, sorted
    pub fn paths_of(&self, object: &str) -> Option<Vec<String>> {
        let paths = self.objects.get(object)?;
        let mut out: Vec<String> = paths.iter().map(|k| join_components(k.as_slice())).collect();
        out.sort_unstable();
        Some(out)
    }

    pub fn contains_object(&self, object: &str) -> bool {
        self.objects.contains_key(object)
    }

    /// Objects governing `path`: those registered at its deepest registered ancestor
    ///
    /// A partition directory below a table directory resolves to the table.
    pub fn objects_for_path(&self, path: &str) -> Vec<String> {
        let Some(components) = split_path(path) else {
            return Vec::new();
        };
        if !self.prefixes.manages(&components) {
            return Vec::new();
        }

        let mut node = &self.root;
        let mut found = &node.objects;
        for component in components {
            match node.children.get(component) {
                Some(child) => {
                    node = child;
                    if !node.objects.is_empty() {
                        found = &node.objects;
                    }
                }
                None => break,
            }
        }

        let mut out: Vec<String> = found.iter().map(|o| o.to_string()).collect();
        out.sort_unstable();
        out
    }

    /// Check if `path` lies under a managed prefix
    pub fn is_managed(&self, path: &str) -> bool {
        self.prefixes.manages_path(path)
    }

    /// Number of objects with at least one path
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of (object, path) pairs
    pub fn path_count(&self) -> usize {
        self.objects.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Sorted export of the whole mapping
    pub fn to_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.objects
            .iter()
            .map(|(object, paths)| {
                (
                    object.to_string(),
                    paths.iter().map(|k| join_components(k.as_slice())).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comps(path: &str) -> Vec<Component> {
        split_path(path).unwrap().into_iter().map(Arc::from).collect()
    }

    fn tree() -> PathTree {
        PathTree::new(PathPrefixes::new(["/wh"]).unwrap())
    }

    fn image(seq: u64, entries: &[(&str, &str)]) -> PathsUpdate {
        entries
            .iter()
            .fold(PathsUpdate::full_image(seq, seq), |u, (obj, path)| {
                u.add_path(obj, comps(path))
            })
    }

    fn map(entries: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        entries
            .iter()
            .map(|(obj, paths)| {
                (
                    obj.to_string(),
                    paths.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_scenario_image_then_two_deltas() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db1.t1", "/wh/db1.db/t1")])).unwrap();
        tree.apply(&PathsUpdate::delta(2, 1).add_path("db1.t2", comps("/wh/db1.db/t2")))
            .unwrap();
        tree.apply(&PathsUpdate::delta(3, 1).del_path("db1.t1", comps("/wh/db1.db/t1")))
            .unwrap();

        assert_eq!(tree.to_map(), map(&[("db1.t2", &["/wh/db1.db/t2"])]));
        assert_eq!(tree.seq_num(), 3);
        assert_eq!(tree.img_num(), 1);
        assert!(!tree.contains_object("db1.t1"));
    }

    #[test]
    fn test_full_image_is_idempotent() {
        let update = image(4, &[("db.a", "/wh/a"), ("db.b", "/wh/b"), ("db.b", "/wh/b2")]);

        let mut once = tree();
        once.apply(&update).unwrap();
        let mut twice = tree();
        twice.apply(&update).unwrap();
        twice.apply(&update).unwrap();

        assert_eq!(once.to_map(), twice.to_map());
        assert_eq!(once.to_dump(), twice.to_dump());
        assert_eq!(twice.seq_num(), 4);
    }

    #[test]
    fn test_full_image_replaces_previous_content() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.old", "/wh/old")])).unwrap();
        tree.apply(&image(10, &[("db.new", "/wh/new")])).unwrap();

        assert_eq!(tree.to_map(), map(&[("db.new", &["/wh/new"])]));
        assert_eq!(tree.img_num(), 10);
    }

    #[test]
    fn test_order_matters_for_add_then_delete() {
        let add = |seq| PathsUpdate::delta(seq, 1).add_path("db.t", comps("/wh/t/p=1"));
        let del = |seq| PathsUpdate::delta(seq, 1).del_path("db.t", comps("/wh/t/p=1"));

        let mut forward = tree();
        forward.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();
        forward.apply(&add(2)).unwrap();
        forward.apply(&del(3)).unwrap();
        assert_eq!(forward.paths_of("db.t").unwrap(), vec!["/wh/t"]);

        let mut reversed = tree();
        reversed.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();
        reversed.apply(&del(2)).unwrap();
        reversed.apply(&add(3)).unwrap();
        assert_eq!(
            reversed.paths_of("db.t").unwrap(),
            vec!["/wh/t", "/wh/t/p=1"]
        );
    }

    #[test]
    fn test_out_of_order_delta_rejected_without_mutation() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();

        let skipped = PathsUpdate::delta(3, 1).add_path("db.u", comps("/wh/u"));
        assert!(matches!(
            tree.apply(&skipped),
            Err(UpdateError::OutOfOrder { expected: 2, actual: 3 })
        ));
        assert!(!tree.contains_object("db.u"));
        assert_eq!(tree.seq_num(), 1);
    }

    #[test]
    fn test_delta_from_other_image_rejected() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();

        let foreign = PathsUpdate::delta(2, 2).add_path("db.u", comps("/wh/u"));
        assert!(matches!(
            tree.apply(&foreign),
            Err(UpdateError::ImageMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_delta_on_empty_tree_rejected() {
        let mut tree = tree();
        let delta = PathsUpdate::delta(1, 1).add_path("db.t", comps("/wh/t"));
        assert!(tree.apply(&delta).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_stale_image_of_same_lineage_rejected() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();
        tree.apply(&PathsUpdate::delta(2, 1).add_path("db.u", comps("/wh/u")))
            .unwrap();

        let stale = PathsUpdate::full_image(1, 1).add_path("db.t", comps("/wh/t"));
        assert!(matches!(
            tree.apply(&stale),
            Err(UpdateError::StaleImage { current: 2, .. })
        ));
        assert!(tree.contains_object("db.u"));
    }

    #[test]
    fn test_older_image_of_other_lineage_rejected() {
        let mut tree = tree();
        tree.apply(&image(10, &[("db.t", "/wh/t")])).unwrap();
        tree.apply(&PathsUpdate::delta(11, 10).add_path("db.u", comps("/wh/u")))
            .unwrap();

        let older = image(3, &[("db.old", "/wh/old")]);
        assert!(matches!(
            tree.apply(&older),
            Err(UpdateError::StaleImage {
                current: 11,
                current_img: 10,
                actual: 3,
                actual_img: 3
            })
        ));
        assert_eq!((tree.seq_num(), tree.img_num()), (11, 10));
        assert!(tree.contains_object("db.u"));
        assert!(!tree.contains_object("db.old"));

        // A later sequence number cannot carry an older image either.
        let rewound_image = PathsUpdate::full_image(12, 4).add_path("db.t", comps("/wh/t"));
        assert!(tree.apply(&rewound_image).is_err());

        // Newer images and a re-apply of the current position still go through.
        tree.apply(&PathsUpdate::full_image(11, 10).add_path("db.t", comps("/wh/t")))
            .unwrap();
        tree.apply(&image(20, &[("db.new", "/wh/new")])).unwrap();
        assert_eq!((tree.seq_num(), tree.img_num()), (20, 20));
    }

    #[test]
    fn test_malformed_delta_leaves_tree_untouched() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();

        let bad = PathsUpdate::delta(2, 1)
            .add_path("db.a", comps("/wh/a"))
            .add_path("db.t", comps("/wh/t2"))
            .del_path("db.t", comps("/wh/t2"));
        assert!(tree.apply(&bad).unwrap_err().is_malformed());
        assert_eq!(tree.to_map(), map(&[("db.t", &["/wh/t"])]));
        assert_eq!(tree.seq_num(), 1);
    }

    #[test]
    fn test_emptied_object_is_removed() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t"), ("db.t", "/wh/t2")])).unwrap();
        tree.apply(
            &PathsUpdate::delta(2, 1)
                .del_path("db.t", comps("/wh/t"))
                .del_path("db.t", comps("/wh/t2")),
        )
        .unwrap();

        assert!(tree.is_empty());
        assert_eq!(tree.paths_of("db.t"), None);
        assert!(tree.objects_for_path("/wh/t").is_empty());
        assert_eq!(tree.to_dump().node_count(), 1);
    }

    #[test]
    fn test_drop_all_removes_every_path() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t"), ("db.t", "/wh/t/p=1"), ("db.u", "/wh/u")]))
            .unwrap();
        tree.apply(&PathsUpdate::delta(2, 1).drop_object("db.t")).unwrap();

        assert_eq!(tree.to_map(), map(&[("db.u", &["/wh/u"])]));
    }

    #[test]
    fn test_deleting_unknown_path_is_noop() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();
        tree.apply(
            &PathsUpdate::delta(2, 1)
                .del_path("db.t", comps("/wh/nope"))
                .del_path("db.missing", comps("/wh/t")),
        )
        .unwrap();

        assert_eq!(tree.to_map(), map(&[("db.t", &["/wh/t"])]));
        assert_eq!(tree.seq_num(), 2);
    }

    #[test]
    fn test_deleting_unknown_path_does_not_grow_interner() {
        let interner = Arc::new(Interner::new());
        let mut tree =
            PathTree::with_interner(PathPrefixes::new(["/wh"]).unwrap(), interner.clone());
        tree.apply(&image(1, &[("db.t", "/wh/t")])).unwrap();
        let before = interner.len();

        tree.apply(
            &PathsUpdate::delta(2, 1)
                .del_path("db.t", comps("/wh/never/seen/p=1"))
                .del_path("db.gone", comps("/wh/also/unknown")),
        )
        .unwrap();

        assert_eq!(interner.len(), before);
        assert_eq!(tree.to_map(), map(&[("db.t", &["/wh/t"])]));

        tree.apply(&PathsUpdate::delta(3, 1).del_path("db.t", comps("/wh/t")))
            .unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_paths_outside_prefixes_are_excluded() {
        let mut tree = PathTree::new(PathPrefixes::new(["/warehouse"]).unwrap());
        tree.apply(
            &PathsUpdate::full_image(1, 1)
                .add_path("db.ext", comps("/external/data"))
                .add_path("db.t", comps("/warehouse/db.db/t")),
        )
        .unwrap();
        tree.apply(&PathsUpdate::delta(2, 1).add_path("db.t", comps("/wharf/x")))
            .unwrap();

        assert!(!tree.contains_object("db.ext"));
        assert_eq!(tree.paths_of("db.t").unwrap(), vec!["/warehouse/db.db/t"]);
        assert!(!tree.is_managed("/external/data"));
        assert!(tree.objects_for_path("/external/data").is_empty());
    }

    #[test]
    fn test_objects_for_path_uses_deepest_registered_ancestor() {
        let mut tree = tree();
        tree.apply(&image(
            1,
            &[
                ("db1", "/wh/db1.db"),
                ("db1.t1", "/wh/db1.db/t1"),
                ("db1.t1", "/wh/db1.db/t1/p=2"),
            ],
        ))
        .unwrap();

        assert_eq!(tree.objects_for_path("/wh/db1.db/t1/p=1/file"), vec!["db1.t1"]);
        assert_eq!(tree.objects_for_path("/wh/db1.db/t1/p=2"), vec!["db1.t1"]);
        assert_eq!(tree.objects_for_path("/wh/db1.db/t9"), vec!["db1"]);
        assert!(tree.objects_for_path("/wh/other").is_empty());
        assert!(tree.objects_for_path("relative").is_empty());
    }

    #[test]
    fn test_shared_path_between_objects() {
        let mut tree = tree();
        tree.apply(&image(1, &[("db.t", "/wh/shared"), ("db.v", "/wh/shared")]))
            .unwrap();
        assert_eq!(tree.objects_for_path("/wh/shared"), vec!["db.t", "db.v"]);

        tree.apply(&PathsUpdate::delta(2, 1).del_path("db.t", comps("/wh/shared")))
            .unwrap();
        assert_eq!(tree.objects_for_path("/wh/shared"), vec!["db.v"]);
    }

    #[test]
    fn test_dump_roundtrip_preserves_mapping() {
        let mut tree = tree();
        tree.apply(&image(
            5,
            &[
                ("db1", "/wh/db1.db"),
                ("db1.t1", "/wh/db1.db/t1"),
                ("db1.t1", "/wh/db1.db/t1/p=1"),
                ("db1.t2", "/wh/db1.db/t2"),
                ("db1.v", "/wh/db1.db/t2"),
            ],
        ))
        .unwrap();

        let bytes = tree.to_dump().to_bytes().unwrap();
        let dump = PathsDump::from_bytes(&bytes).unwrap();
        let rebuilt = PathTree::from_dump(
            &dump,
            tree.prefixes().clone(),
            Arc::new(Interner::new()),
        )
        .unwrap();

        assert_eq!(rebuilt.to_map(), tree.to_map());
        assert_eq!(rebuilt.path_count(), 5);
        assert_eq!(rebuilt.objects_for_path("/wh/db1.db/t1/p=1/x"), vec!["db1.t1"]);
    }

    #[test]
    fn test_dump_roundtrip_empty_tree() {
        let tree = tree();
        let dump = tree.to_dump();
        assert_eq!(dump.node_count(), 1);

        let rebuilt =
            PathTree::from_dump(&dump, tree.prefixes().clone(), tree.interner().clone()).unwrap();
        assert!(rebuilt.is_empty());
        assert_eq!(rebuilt.to_map(), tree.to_map());
    }

    #[test]
    fn test_dump_roundtrip_root_prefix_object() {
        let mut tree = PathTree::new(PathPrefixes::new(["/"]).unwrap());
        tree.insert_path::<&str>("everything", &[]);
        tree.insert_path("db.t", &["a", "b"]);

        let rebuilt = PathTree::from_dump(
            &tree.to_dump(),
            tree.prefixes().clone(),
            Arc::new(Interner::new()),
        )
        .unwrap();
        assert_eq!(rebuilt.to_map(), tree.to_map());
        assert_eq!(rebuilt.objects_for_path("/x/y"), vec!["everything"]);
    }

    #[test]
    fn test_components_are_interned() {
        let interner = Arc::new(Interner::new());
        let mut tree = PathTree::with_interner(PathPrefixes::new(["/wh"]).unwrap(), interner.clone());
        for i in 0..10 {
            tree.insert_path(&format!("db.t{}", i), &["wh", "db.db", "p=1"]);
        }
        // "db.t0".."db.t9" plus "wh", "db.db", "p=1"
        assert_eq!(interner.len(), 13);
        assert_eq!(tree.path_count(), 10);
    }
}
