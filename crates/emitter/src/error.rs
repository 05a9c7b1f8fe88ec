//! Scheduler errors.

use shardrun_core::LedgerError;
use shardrun_dependencies::DependencyError;
use shardrun_migration::MigrationError;
use shardrun_partitioning::PartitionError;
use shardrun_types::{Method, PartitionId, TxHash};
use thiserror::Error;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Scheduler bookkeeping diverged from what the ledger reported.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The ledger reported an execution failure and failures are fatal.
    #[error("{method} transaction {tx_hash} failed on {partition}: {reason}")]
    TransactionFailed {
        /// Partition that executed the transaction.
        partition: PartitionId,
        /// Hash of the transaction.
        tx_hash: TxHash,
        /// Method invoked.
        method: Method,
        /// Exception reported by the ledger.
        reason: String,
    },

    /// A partition stopped reporting blocks while work was pending.
    #[error("block stream for {partition} closed with work pending")]
    ListenerClosed {
        /// Partition whose stream closed.
        partition: PartitionId,
    },

    /// A ledger call the scheduler cannot continue without failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl SchedulerError {
    /// Whether the error means the scheduler's own state is inconsistent.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, SchedulerError::Invariant(_))
    }
}

impl From<DependencyError> for SchedulerError {
    fn from(e: DependencyError) -> Self {
        SchedulerError::Invariant(e.to_string())
    }
}

impl From<PartitionError> for SchedulerError {
    fn from(e: PartitionError) -> Self {
        match e {
            PartitionError::ZeroPartitions => SchedulerError::Config(e.to_string()),
            other => SchedulerError::Invariant(other.to_string()),
        }
    }
}

impl From<MigrationError> for SchedulerError {
    fn from(e: MigrationError) -> Self {
        SchedulerError::Invariant(e.to_string())
    }
}
