//! Events delivered to the emitter's single ordered event queue.

use shardrun_types::{
    BlockHeight, BlockResult, ObjectKey, PartitionId, Proof, SignedHeader, TxHash,
};

/// Inbound scheduler events.
///
/// Every concurrent task (per-partition block listeners, migration drivers,
/// submitters) reports through this enum. The emitter consumes them one at a
/// time, which keeps all outstanding-set and lane bookkeeping single-threaded.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    // ═══════════════════════════════════════════════════════════════════════
    // Ledger observations
    // ═══════════════════════════════════════════════════════════════════════
    /// A partition produced a block.
    BlockCommitted(BlockResult),

    /// A partition's block-result stream ended.
    ListenerClosed {
        /// Partition whose listener stopped.
        partition: PartitionId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Migration progress
    // ═══════════════════════════════════════════════════════════════════════
    /// A proof was fetched; the migration now waits for the signed header at
    /// `height`.
    FinalityPending {
        /// Logical key of the migrating object.
        key: ObjectKey,
        /// Attempt the proof was fetched for.
        attempt: u32,
        /// Height whose signed header is awaited.
        height: BlockHeight,
    },

    /// Proof and signed header are in hand; the accept step can be sent.
    Move2Ready {
        /// Logical key of the migrating object.
        key: ObjectKey,
        /// Attempt number the proof and header were gathered for.
        attempt: u32,
        /// Proof of the released state.
        proof: Proof,
        /// Signed header at the proof height.
        header: SignedHeader,
    },

    /// The finality driver exhausted its retry budget.
    MigrationAbandoned {
        /// Logical key of the migrating object.
        key: ObjectKey,
        /// Attempt that failed.
        attempt: u32,
        /// Description of the last failure.
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Submission
    // ═══════════════════════════════════════════════════════════════════════
    /// A broadcast failed after exhausting retries.
    SubmissionFailed {
        /// Partition the transaction was destined for.
        partition: PartitionId,
        /// Hash of the transaction.
        tx_hash: TxHash,
        /// Description of the last failure.
        reason: String,
    },
}

impl SchedulerEvent {
    /// Get a human-readable name for this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            SchedulerEvent::BlockCommitted(_) => "BlockCommitted",
            SchedulerEvent::ListenerClosed { .. } => "ListenerClosed",
            SchedulerEvent::FinalityPending { .. } => "FinalityPending",
            SchedulerEvent::Move2Ready { .. } => "Move2Ready",
            SchedulerEvent::MigrationAbandoned { .. } => "MigrationAbandoned",
            SchedulerEvent::SubmissionFailed { .. } => "SubmissionFailed",
        }
    }

    /// Check if this event came from a ledger subscription.
    pub fn is_ledger_observation(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::BlockCommitted(_) | SchedulerEvent::ListenerClosed { .. }
        )
    }
}
