//! Configuration for the simulated ledger.

use shardrun_types::Method;
use std::collections::HashMap;
use std::time::Duration;

/// Shape and fault injection for a [`crate::SimulatedLedger`].
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of partitions, numbered `1..=num_partitions`.
    pub num_partitions: u64,

    /// Maximum transactions executed per block.
    pub block_capacity: usize,

    /// Block interval used by [`crate::SimulatedLedger::spawn_producers`].
    pub block_interval: Duration,

    /// First ledger id handed out to created objects.
    ///
    /// Kept far above workload ids so that logical and ledger keys of
    /// created objects never collide.
    pub first_created_id: u64,

    /// Buffer of each broadcast stream. Slow subscribers lagging further
    /// than this lose items.
    pub stream_capacity: usize,

    /// Injected faults.
    pub faults: Faults,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

impl SimulationConfig {
    /// Create a config with `num_partitions` partitions and no faults.
    pub fn new(num_partitions: u64) -> Self {
        Self {
            num_partitions,
            block_capacity: 64,
            block_interval: Duration::from_millis(50),
            first_created_id: 1 << 40,
            stream_capacity: 4096,
            faults: Faults::default(),
        }
    }

    /// Set the block capacity.
    pub fn with_block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity.max(1);
        self
    }

    /// Set the block interval.
    pub fn with_block_interval(mut self, interval: Duration) -> Self {
        self.block_interval = interval;
        self
    }

    /// Set the injected faults.
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }
}

/// Faults the simulated ledger injects.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Proof fetches that fail transiently before the first success.
    pub proof_failures: u32,

    /// Submissions that fail transiently before the first success.
    pub submit_failures: u32,

    /// Never publish signed headers.
    pub suppress_headers: bool,

    /// Per method, how many executions fail with an exception before the
    /// method starts succeeding again.
    pub failing_methods: HashMap<Method, u32>,
}

impl Faults {
    /// Fail the first `n` proof fetches.
    pub fn with_proof_failures(mut self, n: u32) -> Self {
        self.proof_failures = n;
        self
    }

    /// Fail the first `n` submissions.
    pub fn with_submit_failures(mut self, n: u32) -> Self {
        self.submit_failures = n;
        self
    }

    /// Never publish signed headers.
    pub fn without_headers(mut self) -> Self {
        self.suppress_headers = true;
        self
    }

    /// Fail the first `times` executions of `method`.
    pub fn failing(mut self, method: Method, times: u32) -> Self {
        self.failing_methods.insert(method, times);
        self
    }
}
