//! Configuration for migration retries and timeouts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budgets and timeouts for cross-partition migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Attempts at fetching a proof before the migration is abandoned.
    ///
    /// Only transient ledger errors are retried.
    pub proof_retries: u32,

    /// Delay before the first proof retry. Doubles per retry.
    #[serde(with = "shardrun_types::humantime_duration")]
    pub proof_backoff: Duration,

    /// Upper bound on the proof retry delay.
    #[serde(with = "shardrun_types::humantime_duration")]
    pub max_proof_backoff: Duration,

    /// How long to wait for a signed header before re-registering the wait.
    #[serde(with = "shardrun_types::humantime_duration")]
    pub header_timeout: Duration,

    /// Header waits (including the first) before the migration is abandoned.
    pub max_header_waits: u32,

    /// Accept-step attempts per migration. A failed accept re-enters the
    /// finality wait with a fresh proof until this is exhausted.
    pub max_move2_attempts: u32,

    /// Signed headers retained per partition for waits registered late.
    pub header_cache: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            proof_retries: 5,
            proof_backoff: Duration::from_millis(100),
            max_proof_backoff: Duration::from_secs(5),
            header_timeout: Duration::from_secs(180),
            max_header_waits: 5,
            max_move2_attempts: 3,
            header_cache: 256,
        }
    }
}

impl MigrationConfig {
    /// Set the header wait timeout.
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Set the number of header waits before giving up.
    pub fn with_max_header_waits(mut self, waits: u32) -> Self {
        self.max_header_waits = waits.max(1);
        self
    }

    /// Set the proof retry budget and initial backoff.
    pub fn with_proof_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.proof_retries = retries.max(1);
        self.proof_backoff = backoff;
        self
    }

    /// Set the accept-step attempt budget.
    pub fn with_max_move2_attempts(mut self, attempts: u32) -> Self {
        self.max_move2_attempts = attempts.max(1);
        self
    }

    /// Set the per-partition header cache size.
    pub fn with_header_cache(mut self, heights: usize) -> Self {
        self.header_cache = heights;
        self
    }

    /// Backoff before proof retry number `retry` (1-based).
    pub fn proof_backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.proof_backoff
            .saturating_mul(factor)
            .min(self.max_proof_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = MigrationConfig::default();
        assert_eq!(config.proof_backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.proof_backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.proof_backoff_for(4), Duration::from_millis(800));
        assert_eq!(config.proof_backoff_for(12), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_from_toml_with_defaults() {
        let config: MigrationConfig = toml::from_str(
            r#"
            header_timeout = "30s"
            max_header_waits = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.header_timeout, Duration::from_secs(30));
        assert_eq!(config.max_header_waits, 2);
        assert_eq!(config.proof_retries, MigrationConfig::default().proof_retries);
    }

    #[test]
    fn test_builders_clamp_to_one() {
        let config = MigrationConfig::default()
            .with_max_header_waits(0)
            .with_max_move2_attempts(0);
        assert_eq!(config.max_header_waits, 1);
        assert_eq!(config.max_move2_attempts, 1);
    }
}
