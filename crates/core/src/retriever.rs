//! Full image retrieval from the versioned store
//!
//! The retriever is safe to share between threads: it only reads from the
//! store and writes into a private scratch tree per call, so it holds no lock.

use crate::intern::Interner;
use crate::metrics::RetrieverMetrics;
use crate::path::{split_path, PathPrefixes};
use crate::store::VersionedStore;
use crate::tree::PathTree;
use crate::update::PathsUpdate;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Turns store snapshots into full-image updates with an attached dump
pub struct ImageRetriever<S> {
    store: S,
    prefixes: PathPrefixes,
    interner: Arc<Interner>,
    metrics: Option<RetrieverMetrics>,
}

impl<S: VersionedStore> ImageRetriever<S> {
    /// Create a retriever over `store`, managing only `prefixes`
    pub fn new(store: S, prefixes: PathPrefixes, interner: Arc<Interner>) -> Self {
        Self {
            store,
            prefixes,
            interner,
            metrics: None,
        }
    }

    /// Record retrieval latency and image size into `metrics`
    pub fn with_metrics(mut self, metrics: RetrieverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a full-image update from one atomic store snapshot
    ///
    /// Paths outside the managed prefixes are dropped. The returned update
    /// carries a dump of the tree it produces so consumers can skip replaying
    /// the add list. Store errors are returned as-is; nothing is retried.
    pub fn retrieve_full_image(&self) -> Result<PathsUpdate> {
        let started = Instant::now();
        let image = self.store.retrieve_full_paths_image()?;

        let mut update = PathsUpdate::full_image(image.seq_num, image.img_num);
        let mut skipped = 0usize;
        for (object, paths) in &image.paths {
            for path in paths {
                let Some(components) = split_path(path) else {
                    warn!("Skipping non-absolute path {} of {}", path, object);
                    skipped += 1;
                    continue;
                };
                if !self.prefixes.manages(&components) {
                    skipped += 1;
                    continue;
                }
                let interned = components
                    .into_iter()
                    .map(|c| self.interner.intern(c))
                    .collect();
                update.changes_mut(object).add_paths.push(interned);
            }
        }

        let mut scratch = PathTree::with_interner(self.prefixes.clone(), self.interner.clone());
        scratch.apply(&update)?;
        update.attach_dump(scratch.to_dump());

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_image(elapsed.as_secs_f64(), update.path_count());
        }
        debug!(
            "Retrieved full image {} (image {}): {} objects, {} paths, {} skipped in {:?}",
            image.seq_num,
            image.img_num,
            update.changes().len(),
            update.path_count(),
            skipped,
            elapsed
        );
        Ok(update)
    }

    /// The store's last processed image id
    ///
    /// Lets a consumer tell whether its image is still current before asking
    /// for a full image.
    pub fn latest_image_id(&self) -> Result<u64> {
        self.store.last_processed_image_id()
    }
}
