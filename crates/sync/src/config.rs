//! Consumer configuration

use anyhow::{Context, Result};
use pathfeed_core::PathPrefixes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_POLL_INTERVAL_MS: u64 = 10;
const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;
const MAX_DELTA_BATCH: usize = 1_000_000;

/// Settings for one replica's reconciliation loop
///
/// ```toml
/// prefixes = ["/warehouse"]
/// poll_interval_ms = 500
/// max_delta_batch = 1000
/// max_delta_lag = 50000
/// snapshot_path = "/var/lib/pathfeed/replica.snap"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Managed path prefixes; paths outside them are ignored
    pub prefixes: Vec<String>,
    /// How often to poll the store when no change notification arrives
    pub poll_interval_ms: u64,
    /// Maximum deltas fetched per request
    pub max_delta_batch: usize,
    /// Sequence lag beyond which a full image is pulled instead of deltas
    pub max_delta_lag: u64,
    /// Where to keep the local snapshot, if anywhere
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prefixes: vec!["/".to_string()],
            poll_interval_ms: 1000,
            max_delta_batch: 1000,
            max_delta_lag: 100_000,
            snapshot_path: None,
        }
    }
}

impl SyncConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse sync config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check ranges and parse the prefixes
    pub fn validate(&self) -> Result<()> {
        if self.prefixes.is_empty() {
            anyhow::bail!("At least one managed prefix is required");
        }
        self.managed_prefixes()?;

        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            anyhow::bail!(
                "poll_interval_ms must be between {} and {}, got {}",
                MIN_POLL_INTERVAL_MS,
                MAX_POLL_INTERVAL_MS,
                self.poll_interval_ms
            );
        }
        if !(1..=MAX_DELTA_BATCH).contains(&self.max_delta_batch) {
            anyhow::bail!(
                "max_delta_batch must be between 1 and {}, got {}",
                MAX_DELTA_BATCH,
                self.max_delta_batch
            );
        }
        if self.max_delta_lag < self.max_delta_batch as u64 {
            anyhow::bail!(
                "max_delta_lag ({}) must not be smaller than max_delta_batch ({})",
                self.max_delta_lag,
                self.max_delta_batch
            );
        }
        Ok(())
    }

    pub fn managed_prefixes(&self) -> Result<PathPrefixes> {
        PathPrefixes::new(&self.prefixes)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
