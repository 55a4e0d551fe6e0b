//! Prometheus metrics for full image retrieval
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `pathfeed_image_retrieval_seconds` | Histogram | Time to fetch and build a full image |
//! | `pathfeed_image_path_changes` | Histogram | Paths carried by each retrieved image |

use prometheus::{Histogram, HistogramOpts, Registry};

/// Buckets for retrieval latency, in seconds
pub const RETRIEVAL_SECONDS_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// Buckets for the number of paths in one image
pub const PATH_CHANGES_BUCKETS: &[f64] = &[
    100.0,
    1_000.0,
    10_000.0,
    100_000.0,
    1_000_000.0,
    10_000_000.0,
];

/// Retrieval metrics, registered once and shared by clone
#[derive(Clone)]
pub struct RetrieverMetrics {
    retrieval_seconds: Histogram,
    path_changes: Histogram,
}

impl RetrieverMetrics {
    /// Create the metrics and register them with `registry`
    ///
    /// Fails if the names are already registered there.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let retrieval_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pathfeed_image_retrieval_seconds",
                "Time to fetch and build a full paths image",
            )
            .buckets(RETRIEVAL_SECONDS_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(retrieval_seconds.clone()))?;

        let path_changes = Histogram::with_opts(
            HistogramOpts::new(
                "pathfeed_image_path_changes",
                "Number of paths in each retrieved full image",
            )
            .buckets(PATH_CHANGES_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(path_changes.clone()))?;

        Ok(Self {
            retrieval_seconds,
            path_changes,
        })
    }

    pub fn retrieval_seconds(&self) -> &Histogram {
        &self.retrieval_seconds
    }

    pub fn path_changes(&self) -> &Histogram {
        &self.path_changes
    }

    pub(crate) fn observe_image(&self, seconds: f64, paths: usize) {
        self.retrieval_seconds.observe(seconds);
        self.path_changes.observe(paths as f64);
    }
}
