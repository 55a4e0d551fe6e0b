//! Append-only path change log using sled
//!
//! Keyspace (single sled tree, so one `Batch` updates everything atomically):
//! - `d:<seq be>` → encoded delta `PathsUpdate`
//! - `o:<object>` → bincode `BTreeSet<String>` of the object's current paths
//! - `m:last_seq`, `m:image`, `m:purged` → u64 big-endian

use anyhow::{Context, Result};
use parking_lot::RwLock;
use pathfeed_core::{
    decode_update, encode_update, join_components, split_path, DeltaFetch, PathComponents,
    PathsImage, PathsUpdate, VersionedStore,
};
use sled::{Batch, Db};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const DELTA_PREFIX: &[u8] = b"d:";
const OBJECT_PREFIX: &[u8] = b"o:";
const META_LAST_SEQ: &[u8] = b"m:last_seq";
const META_IMAGE: &[u8] = b"m:image";
const META_PURGED: &[u8] = b"m:purged";

fn delta_key(seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(DELTA_PREFIX.len() + 8);
    key.extend_from_slice(DELTA_PREFIX);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn object_key(object: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(OBJECT_PREFIX.len() + object.len());
    key.extend_from_slice(OBJECT_PREFIX);
    key.extend_from_slice(object.as_bytes());
    key
}

fn read_u64(db: &Db, key: &[u8]) -> Result<Option<u64>> {
    match db.get(key)? {
        Some(value) => Ok(Some(u64::from_be_bytes(value.as_ref().try_into()?))),
        None => Ok(None),
    }
}

/// Normalize raw paths into (canonical string, components)
fn split_all(paths: &[&str]) -> Result<Vec<(String, PathComponents)>> {
    paths
        .iter()
        .map(|path| {
            let components = split_path(path)
                .ok_or_else(|| anyhow::anyhow!("Path must be absolute: {}", path))?;
            Ok((
                join_components(&components),
                components.into_iter().map(Arc::from).collect(),
            ))
        })
        .collect()
}

/// Authoritative object→paths store with an ordered delta log
///
/// Every mutation gets the next sequence number and is recorded as a delta
/// stamped with the current image. `persist_image` starts a new image whose
/// number equals its sequence number; it writes no delta, so consumers behind
/// it see a gap and resync.
pub struct PathLog {
    /// Sled database
    db: Db,
    /// Writers take the write side; snapshots and delta reads the read side
    lock: RwLock<()>,
    /// Highest assigned sequence number
    last_seq: AtomicU64,
    /// Current image number
    img_num: AtomicU64,
    /// Deltas up to and including this sequence number have been purged
    purged_through: AtomicU64,
}

impl PathLog {
    /// Open or create a log at the given directory
    ///
    /// A fresh log starts with an empty image at sequence number 1.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path.join("paths.db"))
            .with_context(|| format!("Failed to open path log in {}", path.display()))?;

        let last_seq = read_u64(&db, META_LAST_SEQ)?.unwrap_or(0);
        let img_num = read_u64(&db, META_IMAGE)?.unwrap_or(0);
        let purged_through = read_u64(&db, META_PURGED)?.unwrap_or(0);

        let log = Self {
            db,
            lock: RwLock::new(()),
            last_seq: AtomicU64::new(last_seq),
            img_num: AtomicU64::new(img_num),
            purged_through: AtomicU64::new(purged_through),
        };

        if last_seq == 0 {
            log.persist_image(&BTreeMap::new())?;
        }

        debug!(
            "Opened path log at {} (seq {}, image {})",
            path.display(),
            log.last_seq.load(Ordering::SeqCst),
            log.img_num.load(Ordering::SeqCst)
        );
        Ok(log)
    }

    /// Add paths to an object, creating it if needed
    pub fn add_paths(&self, object: &str, paths: &[&str]) -> Result<u64> {
        self.record(object, paths, &[], false)
    }

    /// Remove paths from an object; the object goes away with its last path
    pub fn delete_paths(&self, object: &str, paths: &[&str]) -> Result<u64> {
        self.record(object, &[], paths, false)
    }

    /// Remove an object and all of its paths
    pub fn drop_object(&self, object: &str) -> Result<u64> {
        self.record(object, &[], &[], true)
    }

    fn record(&self, object: &str, add: &[&str], del: &[&str], drop_all: bool) -> Result<u64> {
        if object.is_empty() {
            anyhow::bail!("Object name must not be empty");
        }
        let add = split_all(add)?;
        let del = split_all(del)?;

        let _guard = self.lock.write();
        let seq = self.last_seq.load(Ordering::SeqCst) + 1;
        let img = self.img_num.load(Ordering::SeqCst);

        let key = object_key(object);
        let mut current: BTreeSet<String> = match self.db.get(&key)? {
            Some(value) => bincode::deserialize(&value)?,
            None => BTreeSet::new(),
        };

        let mut update = PathsUpdate::delta(seq, img);
        let changes = update.changes_mut(object);
        if drop_all {
            current.clear();
            changes.drop_all = true;
        }
        for (raw, components) in add {
            current.insert(raw);
            changes.add_paths.push(components);
        }
        for (raw, components) in del {
            current.remove(&raw);
            changes.del_paths.push(components);
        }
        update.validate()?;

        let mut batch = Batch::default();
        batch.insert(delta_key(seq), encode_update(&update)?);
        if current.is_empty() {
            batch.remove(key);
        } else {
            batch.insert(key, bincode::serialize(&current)?);
        }
        batch.insert(META_LAST_SEQ, &seq.to_be_bytes()[..]);
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        self.last_seq.store(seq, Ordering::SeqCst);
        debug!("Recorded delta {} for {}", seq, object);
        Ok(seq)
    }

    /// Replace the whole mapping and start a new image
    ///
    /// Returns the new image number, which is also its sequence number.
    pub fn persist_image(&self, image: &BTreeMap<String, Vec<String>>) -> Result<u64> {
        let mut normalized: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for (object, paths) in image {
            if object.is_empty() {
                anyhow::bail!("Object name must not be empty");
            }
            let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
            let entry = normalized.entry(object.as_str()).or_default();
            for (raw, _) in split_all(&paths)? {
                entry.insert(raw);
            }
        }

        let _guard = self.lock.write();
        let seq = self.last_seq.load(Ordering::SeqCst) + 1;

        let mut batch = Batch::default();
        for item in self.db.scan_prefix(OBJECT_PREFIX) {
            let (key, _) = item?;
            batch.remove(key);
        }
        let mut objects = 0usize;
        for (object, paths) in &normalized {
            if paths.is_empty() {
                continue;
            }
            batch.insert(object_key(object), bincode::serialize(paths)?);
            objects += 1;
        }
        batch.insert(META_LAST_SEQ, &seq.to_be_bytes()[..]);
        batch.insert(META_IMAGE, &seq.to_be_bytes()[..]);
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        self.last_seq.store(seq, Ordering::SeqCst);
        self.img_num.store(seq, Ordering::SeqCst);
        info!("Persisted full image {} with {} objects", seq, objects);
        Ok(seq)
    }

    /// Delete every delta with a sequence number up to and including `seq_num`
    pub fn purge_through(&self, seq_num: u64) -> Result<usize> {
        let _guard = self.lock.write();

        let mut batch = Batch::default();
        let mut purged = 0usize;
        for item in self.db.range(delta_key(0)..=delta_key(seq_num)) {
            let (key, _) = item?;
            batch.remove(key);
            purged += 1;
        }
        let through = seq_num.max(self.purged_through.load(Ordering::SeqCst));
        batch.insert(META_PURGED, &through.to_be_bytes()[..]);
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        self.purged_through.store(through, Ordering::SeqCst);
        info!("Purged {} deltas through {}", purged, seq_num);
        Ok(purged)
    }

    /// Current paths of an object
    pub fn paths_of(&self, object: &str) -> Result<Option<Vec<String>>> {
        match self.db.get(object_key(object))? {
            Some(value) => {
                let paths: BTreeSet<String> = bincode::deserialize(&value)?;
                Ok(Some(paths.into_iter().collect()))
            }
            None => Ok(None),
        }
    }

    /// Sequence number of the oldest retained delta
    pub fn earliest_delta(&self) -> Result<Option<u64>> {
        match self.db.scan_prefix(DELTA_PREFIX).next() {
            Some(item) => {
                let (key, _) = item?;
                let seq = u64::from_be_bytes(key[DELTA_PREFIX.len()..].try_into()?);
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }

    /// Number of retained deltas
    pub fn delta_count(&self) -> usize {
        self.db.scan_prefix(DELTA_PREFIX).count()
    }

    pub fn purged_through(&self) -> u64 {
        self.purged_through.load(Ordering::SeqCst)
    }
}

impl VersionedStore for PathLog {
    fn retrieve_full_paths_image(&self) -> Result<PathsImage> {
        let _guard = self.lock.read();

        let mut paths = BTreeMap::new();
        for item in self.db.scan_prefix(OBJECT_PREFIX) {
            let (key, value) = item?;
            let object = std::str::from_utf8(&key[OBJECT_PREFIX.len()..])?.to_string();
            let set: BTreeSet<String> = bincode::deserialize(&value)?;
            paths.insert(object, set.into_iter().collect());
        }

        Ok(PathsImage {
            paths,
            seq_num: self.last_seq.load(Ordering::SeqCst),
            img_num: self.img_num.load(Ordering::SeqCst),
        })
    }

    fn retrieve_deltas_since(&self, seq_num: u64, limit: usize) -> Result<DeltaFetch> {
        let _guard = self.lock.read();

        let latest = self.last_seq.load(Ordering::SeqCst);
        if seq_num == latest {
            return Ok(DeltaFetch::Deltas(Vec::new()));
        }
        if seq_num > latest {
            return Ok(DeltaFetch::Gap {
                since: seq_num,
                latest,
            });
        }

        let mut deltas = Vec::new();
        let mut expected = seq_num + 1;
        for item in self
            .db
            .range(delta_key(expected)..=delta_key(u64::MAX))
            .take(limit.max(1))
        {
            let (_, value) = item?;
            let update = decode_update(&value)?;
            if update.seq_num() != expected {
                break;
            }
            expected += 1;
            deltas.push(update);
        }

        if deltas.is_empty() {
            return Ok(DeltaFetch::Gap {
                since: seq_num,
                latest,
            });
        }
        Ok(DeltaFetch::Deltas(deltas))
    }

    fn last_processed_image_id(&self) -> Result<u64> {
        Ok(self.img_num.load(Ordering::SeqCst))
    }

    fn latest_sequence_number(&self) -> Result<u64> {
        Ok(self.last_seq.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, PathLog) {
        let dir = TempDir::new().unwrap();
        let log = PathLog::open(dir.path()).unwrap();
        (dir, log)
    }

    fn deltas(fetch: DeltaFetch) -> Vec<PathsUpdate> {
        match fetch {
            DeltaFetch::Deltas(deltas) => deltas,
            DeltaFetch::Gap { since, latest } => panic!("unexpected gap {}..{}", since, latest),
        }
    }

    #[test]
    fn test_fresh_log_starts_with_empty_image() {
        let (_dir, log) = open();
        assert_eq!(log.latest_sequence_number().unwrap(), 1);
        assert_eq!(log.last_processed_image_id().unwrap(), 1);

        let image = log.retrieve_full_paths_image().unwrap();
        assert!(image.paths.is_empty());
        assert_eq!((image.seq_num, image.img_num), (1, 1));
    }

    #[test]
    fn test_mutations_become_ordered_deltas() {
        let (_dir, log) = open();
        assert_eq!(log.add_paths("db1.t1", &["/wh/db1.db/t1"]).unwrap(), 2);
        assert_eq!(log.add_paths("db1.t2", &["hdfs://nn:8020/wh/db1.db/t2"]).unwrap(), 3);
        assert_eq!(log.delete_paths("db1.t1", &["/wh/db1.db/t1"]).unwrap(), 4);

        let fetched = deltas(log.retrieve_deltas_since(1, 100).unwrap());
        let seqs: Vec<u64> = fetched.iter().map(|u| u.seq_num()).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(fetched.iter().all(|u| u.img_num() == 1 && !u.is_full_image()));
        assert_eq!(fetched[2].changes()["db1.t1"].del_paths.len(), 1);

        let image = log.retrieve_full_paths_image().unwrap();
        assert_eq!(image.seq_num, 4);
        assert_eq!(image.paths.len(), 1);
        assert_eq!(image.paths["db1.t2"], vec!["/wh/db1.db/t2"]);
    }

    #[test]
    fn test_delta_fetch_respects_limit_and_nothing_new() {
        let (_dir, log) = open();
        for i in 0..5 {
            log.add_paths("db.t", &[&format!("/wh/t/p={}", i)]).unwrap();
        }

        let first = deltas(log.retrieve_deltas_since(1, 2).unwrap());
        assert_eq!(first.len(), 2);
        let rest = deltas(log.retrieve_deltas_since(3, 100).unwrap());
        assert_eq!(rest.first().map(|u| u.seq_num()), Some(4));
        assert!(deltas(log.retrieve_deltas_since(6, 100).unwrap()).is_empty());
    }

    #[test]
    fn test_gap_after_purge() {
        let (_dir, log) = open();
        for i in 0..12 {
            log.add_paths("db.t", &[&format!("/wh/t/p={}", i)]).unwrap();
        }
        assert_eq!(log.purge_through(9).unwrap(), 8);
        assert_eq!(log.earliest_delta().unwrap(), Some(10));

        assert_eq!(
            log.retrieve_deltas_since(5, 100).unwrap(),
            DeltaFetch::Gap {
                since: 5,
                latest: 13
            }
        );
        assert_eq!(deltas(log.retrieve_deltas_since(9, 100).unwrap()).len(), 4);
    }

    #[test]
    fn test_sequence_ahead_of_log_is_a_gap() {
        let (_dir, log) = open();
        assert!(matches!(
            log.retrieve_deltas_since(50, 10).unwrap(),
            DeltaFetch::Gap { since: 50, latest: 1 }
        ));
    }

    #[test]
    fn test_persist_image_starts_new_lineage() {
        let (_dir, log) = open();
        log.add_paths("db.old", &["/wh/old"]).unwrap();

        let mut image = BTreeMap::new();
        image.insert("db.new".to_string(), vec!["/wh/new".to_string()]);
        let img = log.persist_image(&image).unwrap();
        assert_eq!(img, 3);
        log.add_paths("db.new", &["/wh/new/p=1"]).unwrap();

        // A consumer on the old image cannot bridge the image boundary.
        let fetched = deltas(log.retrieve_deltas_since(1, 100).unwrap());
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].seq_num(), 2);

        let fetched = deltas(log.retrieve_deltas_since(3, 100).unwrap());
        assert_eq!(fetched[0].img_num(), 3);

        let snapshot = log.retrieve_full_paths_image().unwrap();
        assert_eq!((snapshot.seq_num, snapshot.img_num), (4, 3));
        assert!(!snapshot.paths.contains_key("db.old"));
        assert_eq!(snapshot.paths["db.new"], vec!["/wh/new", "/wh/new/p=1"]);
    }

    #[test]
    fn test_drop_object() {
        let (_dir, log) = open();
        log.add_paths("db.t", &["/wh/t", "/wh/t/p=1"]).unwrap();
        log.drop_object("db.t").unwrap();

        assert_eq!(log.paths_of("db.t").unwrap(), None);
        let fetched = deltas(log.retrieve_deltas_since(2, 10).unwrap());
        assert!(fetched[0].changes()["db.t"].drop_all);
    }

    #[test]
    fn test_invalid_input_rejected() {
        let (_dir, log) = open();
        assert!(log.add_paths("", &["/wh/t"]).is_err());
        assert!(log.add_paths("db.t", &["relative"]).is_err());
        assert_eq!(log.latest_sequence_number().unwrap(), 1);
    }

    #[test]
    fn test_invalid_image_rejected() {
        let (_dir, log) = open();
        log.add_paths("db.t", &["/wh/t"]).unwrap();

        let mut image = BTreeMap::new();
        image.insert(String::new(), vec!["/wh/x".to_string()]);
        assert!(log.persist_image(&image).is_err());

        let mut image = BTreeMap::new();
        image.insert("db.u".to_string(), vec!["relative/x".to_string()]);
        assert!(log.persist_image(&image).is_err());

        // Nothing changed: same position, same image, same content.
        assert_eq!(log.latest_sequence_number().unwrap(), 2);
        assert_eq!(log.last_processed_image_id().unwrap(), 1);
        let snapshot = log.retrieve_full_paths_image().unwrap();
        assert_eq!(snapshot.paths.len(), 1);
        assert_eq!(snapshot.paths["db.t"], vec!["/wh/t"]);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        {
            let log = PathLog::open(dir.path()).unwrap();
            log.add_paths("db.t", &["/wh/t"]).unwrap();
            log.add_paths("db.u", &["/wh/u"]).unwrap();
            log.purge_through(2).unwrap();
        }

        let log = PathLog::open(dir.path()).unwrap();
        assert_eq!(log.latest_sequence_number().unwrap(), 3);
        assert_eq!(log.last_processed_image_id().unwrap(), 1);
        assert_eq!(log.purged_through(), 2);
        assert_eq!(log.paths_of("db.t").unwrap(), Some(vec!["/wh/t".to_string()]));
        assert_eq!(deltas(log.retrieve_deltas_since(2, 10).unwrap()).len(), 1);
    }
}
