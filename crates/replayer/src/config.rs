//! File configuration for the replayer.

use crate::workload::WorkloadConfig;
use serde::{Deserialize, Serialize};
use shardrun_emitter::EmitterConfig;
use shardrun_migration::MigrationConfig;
use shardrun_simulation::SimulationConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the replayer needs, one TOML table per concern.
///
/// ```toml
/// [emitter]
/// num_partitions = 4
/// window = 16
/// policy = "occupants"
///
/// [migration]
/// header_timeout = "30s"
///
/// [ledger]
/// block_capacity = 128
/// block_interval = "100ms"
///
/// [workload]
/// operations = 10000
/// cross_shard_ratio = 0.1
/// create_ratio = 0.05
/// selection = "zipf:1.2"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayerConfig {
    pub emitter: EmitterConfig,
    pub migration: MigrationConfig,
    pub ledger: LedgerSection,
    pub workload: WorkloadConfig,
}

/// Shape of the simulated ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Maximum transactions executed per block.
    pub block_capacity: usize,

    /// Interval between blocks on each partition.
    #[serde(with = "shardrun_types::humantime_duration")]
    pub block_interval: Duration,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            block_capacity: 64,
            block_interval: Duration::from_millis(50),
        }
    }
}

impl LedgerSection {
    /// Simulated ledger settings for `num_partitions` partitions.
    pub fn simulation(&self, num_partitions: u64) -> SimulationConfig {
        SimulationConfig::new(num_partitions)
            .with_block_capacity(self.block_capacity)
            .with_block_interval(self.block_interval)
    }
}

impl ReplayerConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ReplayerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.emitter
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.ledger.block_capacity == 0 {
            return Err(ConfigError::Invalid("ledger.block_capacity must be at least 1".into()));
        }
        if self.ledger.block_interval.is_zero() {
            return Err(ConfigError::Invalid("ledger.block_interval must be non-zero".into()));
        }
        self.workload
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
