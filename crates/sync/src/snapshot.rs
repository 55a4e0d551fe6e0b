//! Local replica snapshots
//!
//! Format (version 1):
//! - magic: "PFS1" (4 bytes)
//! - version: u8
//! - body: bincode of the managed prefixes, the cursor and the tree dump
//!
//! A consumer that restarts from a snapshot only needs the deltas written
//! since, instead of a full image.

use anyhow::{Context, Result};
use pathfeed_core::codec::{decode_framed, encode_framed};
use pathfeed_core::{Cursor, Interner, PathPrefixes, PathsDump, PathsUpdate, Replica};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const SNAPSHOT_MAGIC: [u8; 4] = *b"PFS1";

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    prefixes: Vec<String>,
    cursor: Cursor,
    dump: PathsDump,
}

/// Write the replica's current content and position to `path`
///
/// The file is replaced atomically, so a crash leaves either the old or the
/// new snapshot behind.
pub fn save_snapshot(path: &Path, replica: &Replica) -> Result<Cursor> {
    let (cursor, dump) = replica.dump();
    let file = SnapshotFile {
        prefixes: prefix_set(&replica.prefixes()),
        cursor,
        dump,
    };
    let bytes = encode_framed(SNAPSHOT_MAGIC, &file)?;
    atomic_write(path, &bytes)
        .with_context(|| format!("Failed to write snapshot {}", path.display()))?;

    debug!(
        "Saved snapshot at seq {} (image {}) to {}",
        cursor.seq_num,
        cursor.img_num,
        path.display()
    );
    Ok(cursor)
}

/// Restore a replica from `path`
///
/// Returns `None` if there is no snapshot, or if it was taken with different
/// managed prefixes and would therefore be incomplete.
pub fn load_snapshot(
    path: &Path,
    prefixes: PathPrefixes,
    interner: Arc<Interner>,
) -> Result<Option<Replica>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read snapshot {}", path.display()))
        }
    };

    let file: SnapshotFile = decode_framed(SNAPSHOT_MAGIC, "snapshot", &bytes)
        .with_context(|| format!("Corrupt snapshot {}", path.display()))?;
    if prefix_set_of(file.prefixes.clone()) != prefix_set(&prefixes) {
        warn!(
            "Ignoring snapshot {}: taken for prefixes {:?}",
            path.display(),
            file.prefixes
        );
        return Ok(None);
    }

    let mut update = PathsUpdate::full_image(file.cursor.seq_num, file.cursor.img_num);
    update.attach_dump(file.dump);
    let replica = Replica::with_interner(prefixes, interner);
    replica.apply(&update)?;

    info!(
        "Restored replica from {} at seq {} (image {})",
        path.display(),
        file.cursor.seq_num,
        file.cursor.img_num
    );
    Ok(Some(replica))
}

/// Managed prefixes in a canonical order, so configuration order does not matter
fn prefix_set(prefixes: &PathPrefixes) -> Vec<String> {
    prefix_set_of(prefixes.to_strings())
}

fn prefix_set_of(mut prefixes: Vec<String>) -> Vec<String> {
    prefixes.sort_unstable();
    prefixes.dedup();
    prefixes
}

/// Write to a temp file in the target's directory, fsync, then rename over it
fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target)?;
    Ok(())
}
