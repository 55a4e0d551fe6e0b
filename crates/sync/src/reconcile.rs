//! Replica reconciliation loop
//!
//! Keeps one replica in line with the versioned store: a full image when the
//! replica is behind, contiguous deltas once it has caught up.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::snapshot::{load_snapshot, save_snapshot};
use anyhow::Result;
use pathfeed_core::{
    Cursor, DeltaFetch, ImageRetriever, Interner, PathsUpdate, Replica, RetrieverMetrics,
    VersionedStore,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound on steps per tick, so an inconsistent store cannot spin the loop
const MAX_STEPS_PER_WAKE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Needs a full image before deltas can be applied
    Behind,
    /// Holds an image and follows it with deltas
    CaughtUp,
}

/// Why the loop decided it needs a full image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehindReason {
    /// The store moved to a new image
    ImageChanged { current: u64, latest: u64 },
    /// Too many deltas to replay
    LagTooLarge { lag: u64 },
    /// The store no longer has the deltas after the cursor
    Gap { since: u64, latest: u64 },
    /// A fetched batch was not a contiguous run on the current image
    BatchInconsistent { seq_num: u64 },
}

/// What one call to [`Reconciler::step`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A full image was applied
    Resynced(Cursor),
    /// `count` deltas were applied
    Applied { count: usize, cursor: Cursor },
    /// Nothing new in the store
    UpToDate,
    /// Switched to `Behind`; the next step pulls a full image
    FellBehind(BehindReason),
}

/// Drives one replica from one store
pub struct Reconciler<S> {
    store: Arc<S>,
    retriever: ImageRetriever<Arc<S>>,
    replica: Arc<Replica>,
    config: SyncConfig,
    state: SyncState,
    wake: Arc<Notify>,
}

impl<S: VersionedStore> Reconciler<S> {
    /// Create a reconciler for an existing replica
    ///
    /// Starts `CaughtUp` if the replica already holds an image.
    pub fn new(store: Arc<S>, replica: Arc<Replica>, config: SyncConfig) -> Self {
        let retriever = ImageRetriever::new(store.clone(), replica.prefixes(), replica.interner());
        let state = if replica.cursor().has_image() {
            SyncState::CaughtUp
        } else {
            SyncState::Behind
        };

        Self {
            store,
            retriever,
            replica,
            config,
            state,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Create a reconciler and its replica from configuration
    ///
    /// Restores the local snapshot when one is configured and usable.
    pub fn open(store: Arc<S>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let prefixes = config.managed_prefixes()?;
        let interner = Arc::new(Interner::new());

        let restored = match &config.snapshot_path {
            Some(path) => load_snapshot(path, prefixes.clone(), interner.clone())?,
            None => None,
        };
        let replica = restored.unwrap_or_else(|| Replica::with_interner(prefixes, interner));

        Ok(Self::new(store, Arc::new(replica), config))
    }

    /// Record full image retrievals into `metrics`
    pub fn with_metrics(mut self, metrics: RetrieverMetrics) -> Self {
        self.retriever = self.retriever.with_metrics(metrics);
        self
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Handle for change notifications; `notify_one` wakes the loop early
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Perform one reconciliation step
    ///
    /// On error the state and the replica position are unchanged.
    pub fn step(&mut self) -> Result<StepOutcome, SyncError> {
        match self.state {
            SyncState::Behind => self.resync(),
            SyncState::CaughtUp => self.catch_up(),
        }
    }

    /// Step until there is nothing new, a step fails, or the step budget runs out
    pub fn sync_to_latest(&mut self) -> Result<Cursor, SyncError> {
        for _ in 0..MAX_STEPS_PER_WAKE {
            match self.step()? {
                StepOutcome::UpToDate => return Ok(self.replica.cursor()),
                outcome => debug!("Reconciliation step: {:?}", outcome),
            }
        }
        warn!(
            "Replica still not up to date after {} steps",
            MAX_STEPS_PER_WAKE
        );
        Ok(self.replica.cursor())
    }

    fn resync(&mut self) -> Result<StepOutcome, SyncError> {
        let started = Instant::now();
        let update = self
            .retriever
            .retrieve_full_image()
            .map_err(SyncError::from_retrieval)?;
        self.replica.apply(&update)?;
        self.state = SyncState::CaughtUp;

        let cursor = self.replica.cursor();
        info!(
            "Resynced to full image at seq {} (image {}) with {} paths in {:?}",
            cursor.seq_num,
            cursor.img_num,
            update.path_count(),
            started.elapsed()
        );
        self.save_snapshot();
        Ok(StepOutcome::Resynced(cursor))
    }

    fn catch_up(&mut self) -> Result<StepOutcome, SyncError> {
        let cursor = self.replica.cursor();

        let latest_img = self
            .store
            .last_processed_image_id()
            .map_err(SyncError::Store)?;
        if latest_img != cursor.img_num {
            return Ok(self.fall_behind(BehindReason::ImageChanged {
                current: cursor.img_num,
                latest: latest_img,
            }));
        }

        let latest_seq = self
            .store
            .latest_sequence_number()
            .map_err(SyncError::Store)?;
        let lag = latest_seq.saturating_sub(cursor.seq_num);
        if lag > self.config.max_delta_lag {
            return Ok(self.fall_behind(BehindReason::LagTooLarge { lag }));
        }

        let deltas = match self
            .store
            .retrieve_deltas_since(cursor.seq_num, self.config.max_delta_batch)
            .map_err(SyncError::Store)?
        {
            DeltaFetch::Gap { since, latest } => {
                return Ok(self.fall_behind(BehindReason::Gap { since, latest }));
            }
            DeltaFetch::Deltas(deltas) => deltas,
        };
        if deltas.is_empty() {
            return Ok(StepOutcome::UpToDate);
        }

        // Check the whole batch before touching the replica.
        if let Some(seq_num) = first_discontinuity(&deltas, cursor) {
            return Ok(self.fall_behind(BehindReason::BatchInconsistent { seq_num }));
        }

        for delta in &deltas {
            self.replica.apply(delta)?;
        }

        let cursor = self.replica.cursor();
        debug!(
            "Applied {} deltas, now at seq {}",
            deltas.len(),
            cursor.seq_num
        );
        Ok(StepOutcome::Applied {
            count: deltas.len(),
            cursor,
        })
    }

    fn fall_behind(&mut self, reason: BehindReason) -> StepOutcome {
        info!("Replica fell behind: {:?}", reason);
        self.state = SyncState::Behind;
        StepOutcome::FellBehind(reason)
    }

    fn save_snapshot(&self) {
        let Some(path) = &self.config.snapshot_path else {
            return;
        };
        if let Err(e) = save_snapshot(path, &self.replica) {
            warn!("Failed to save snapshot: {:#}", e);
        }
    }
}

impl<S: VersionedStore + 'static> Reconciler<S> {
    /// Run the reconciliation loop until `shutdown` turns true or its sender is dropped
    ///
    /// Each tick or wake-up syncs to the latest sequence number. Steps run on
    /// the blocking pool since they do store I/O and build trees. The local
    /// snapshot, if configured, is written once more on the way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval(self.config.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = self.wake.clone();

        info!(
            "Starting reconciliation loop (interval: {:?})",
            self.config.poll_interval()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = timer.tick() => {}
                _ = wake.notified() => debug!("Woken by change notification"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let task = tokio::task::spawn_blocking(move || {
                if let Err(e) = self.sync_to_latest() {
                    warn!("Reconciliation step failed: {}", e);
                }
                self
            });
            self = match task.await {
                Ok(this) => this,
                Err(e) => {
                    warn!("Reconciliation task failed: {}", e);
                    return;
                }
            };
        }

        if self.state == SyncState::CaughtUp {
            self.save_snapshot();
        }
        let cursor = self.replica.cursor();
        info!(
            "Reconciliation loop stopped at seq {} (image {})",
            cursor.seq_num, cursor.img_num
        );
    }
}

/// First delta that does not continue the cursor on its image
fn first_discontinuity(deltas: &[PathsUpdate], cursor: Cursor) -> Option<u64> {
    let mut expected = cursor.seq_num + 1;
    for delta in deltas {
        if delta.is_full_image()
            || delta.seq_num() != expected
            || delta.img_num() != cursor.img_num
        {
            return Some(delta.seq_num());
        }
        expected += 1;
    }
    None
}
