//! Ledger collaborator errors.

use shardrun_types::PartitionId;
use thiserror::Error;

/// Errors reported by a [`crate::Ledger`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The endpoint could not be reached or refused service temporarily.
    #[error("ledger endpoint for {partition} unavailable: {reason}")]
    Unavailable {
        /// Partition whose endpoint failed.
        partition: PartitionId,
        /// Transport-level description.
        reason: String,
    },

    /// The call did not complete in time.
    #[error("ledger call to {partition} timed out")]
    Timeout {
        /// Partition whose endpoint timed out.
        partition: PartitionId,
    },

    /// The request was rejected and will not succeed on retry.
    #[error("ledger rejected request on {partition}: {reason}")]
    Rejected {
        /// Partition that rejected the request.
        partition: PartitionId,
        /// Rejection reason.
        reason: String,
    },

    /// A subscription stream ended.
    #[error("stream for {partition} closed")]
    StreamClosed {
        /// Partition whose stream closed.
        partition: PartitionId,
    },
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Unavailable { .. } | LedgerError::Timeout { .. }
        )
    }
}
