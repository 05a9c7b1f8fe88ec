//! Emitter configuration.

use crate::SchedulerError;
use serde::{Deserialize, Serialize};
use shardrun_partitioning::PlacementPolicy;
use std::time::Duration;

/// Configuration for the admission-controlled emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Number of partitions, numbered `1..=num_partitions`.
    pub num_partitions: u64,

    /// Initial outstanding window per partition.
    pub window: usize,

    /// Ceiling the window may grow to.
    pub max_window: usize,

    /// Floor the window may shrink to.
    pub min_window: usize,

    /// Growth per saturated block.
    pub window_step: usize,

    /// Destination policy for operations spanning partitions.
    pub policy: PlacementPolicy,

    /// End the run on the first ledger-reported execution failure.
    ///
    /// When false, failures are logged and counted and the operation's
    /// objects are released as if it had completed.
    pub fail_on_exception: bool,

    /// Operations buffered between the input stream and the emitter.
    pub input_buffer: usize,

    /// Attempts per broadcast before the transaction is given up on.
    pub submit_retries: u32,

    /// Delay between broadcast attempts, multiplied by the attempt number.
    #[serde(with = "shardrun_types::humantime_duration")]
    pub submit_backoff: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

impl EmitterConfig {
    /// Create a config for `num_partitions` partitions with default limits.
    pub fn new(num_partitions: u64) -> Self {
        Self {
            num_partitions,
            window: 10,
            max_window: 64,
            min_window: 1,
            window_step: 1,
            policy: PlacementPolicy::default(),
            fail_on_exception: true,
            input_buffer: 1024,
            submit_retries: 3,
            submit_backoff: Duration::from_millis(100),
        }
    }

    /// Set the initial window.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set the window bounds and growth step.
    pub fn with_window_bounds(mut self, min: usize, max: usize, step: usize) -> Self {
        self.min_window = min;
        self.max_window = max;
        self.window_step = step;
        self
    }

    /// Set the destination policy.
    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set whether execution failures end the run.
    pub fn with_fail_on_exception(mut self, fail: bool) -> Self {
        self.fail_on_exception = fail;
        self
    }

    /// Set the broadcast retry budget.
    pub fn with_submit_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.submit_retries = retries;
        self.submit_backoff = backoff;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.num_partitions == 0 {
            return Err(SchedulerError::Config(
                "num_partitions must be at least 1".into(),
            ));
        }
        if self.min_window == 0 || self.window == 0 {
            return Err(SchedulerError::Config("window sizes must be at least 1".into()));
        }
        if self.min_window > self.window || self.window > self.max_window {
            return Err(SchedulerError::Config(format!(
                "window bounds out of order: min {} <= initial {} <= max {} required",
                self.min_window, self.window, self.max_window
            )));
        }
        if self.input_buffer == 0 {
            return Err(SchedulerError::Config("input_buffer must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EmitterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert!(EmitterConfig::new(0).validate().is_err());
        assert!(EmitterConfig::new(2)
            .with_window(100)
            .with_window_bounds(1, 64, 1)
            .validate()
            .is_err());
        assert!(EmitterConfig::new(2)
            .with_window(4)
            .with_window_bounds(8, 64, 1)
            .validate()
            .is_err());
    }
}
