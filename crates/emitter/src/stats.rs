//! Run counters and the final report.

use hdrhistogram::Histogram;
use shardrun_types::PartitionId;
use std::time::Duration;

/// Counters updated while the emitter runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Transactions signed and handed to a submitter.
    pub sent: u64,
    /// Our transactions observed in blocks, per partition index.
    pub executed: Vec<u64>,
    /// Transactions the ledger reported failed, or that could not be broadcast.
    pub failed: u64,
    /// Operations dropped unsent because an object they touch was abandoned.
    pub abandoned: u64,
    /// Migrations begun.
    pub migrations_started: u64,
    /// Migrations committed.
    pub moved: u64,
    /// Accept steps retried after failing.
    pub move2_retries: u64,
}

impl SchedulerStats {
    /// Zeroed counters for `num_partitions` partitions.
    pub fn new(num_partitions: u64) -> Self {
        Self {
            executed: vec![0; num_partitions as usize],
            ..Default::default()
        }
    }

    /// Executed count on one partition.
    pub fn executed_on(&self, partition: PartitionId) -> u64 {
        self.executed.get(partition.index()).copied().unwrap_or(0)
    }

    /// Executed count across partitions.
    pub fn total_executed(&self) -> u64 {
        self.executed.iter().sum()
    }
}

/// Summary returned when a run finishes.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final counters.
    pub stats: SchedulerStats,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Send-to-observed latency in microseconds.
    latency: Histogram<u64>,
}

impl RunReport {
    pub(crate) fn new(stats: SchedulerStats, elapsed: Duration, latency: Histogram<u64>) -> Self {
        Self {
            stats,
            elapsed,
            latency,
        }
    }

    /// Executed transactions per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.stats.total_executed() as f64 / secs
        } else {
            0.0
        }
    }

    /// Median send-to-observed latency.
    pub fn p50_latency(&self) -> Duration {
        Duration::from_micros(self.latency.value_at_quantile(0.50))
    }

    /// 99th percentile send-to-observed latency.
    pub fn p99_latency(&self) -> Duration {
        Duration::from_micros(self.latency.value_at_quantile(0.99))
    }

    /// Slowest send-to-observed latency.
    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.latency.max())
    }

    /// Number of latency samples.
    pub fn samples(&self) -> u64 {
        self.latency.len()
    }

    /// Print a human-readable summary to stdout.
    pub fn print(&self) {
        println!("\n=== Run Report ===");
        println!("Duration:        {:.2}s", self.elapsed.as_secs_f64());
        println!("Sent:            {}", self.stats.sent);
        println!("Executed:        {}", self.stats.total_executed());
        for (i, count) in self.stats.executed.iter().enumerate() {
            println!("  {:<14} {}", PartitionId::from_index(i), count);
        }
        println!("Failed:          {}", self.stats.failed);
        println!("Abandoned:       {}", self.stats.abandoned);
        println!(
            "Migrations:      {} started, {} moved, {} accept retries",
            self.stats.migrations_started, self.stats.moved, self.stats.move2_retries
        );
        println!("Throughput:      {:.2} tx/s", self.throughput());
        if self.samples() > 0 {
            println!(
                "Latency:         p50={:?} p99={:?} max={:?}",
                self.p50_latency(),
                self.p99_latency(),
                self.max_latency()
            );
        }
    }
}
