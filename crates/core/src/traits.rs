//! The ledger collaborator contract.

use crate::LedgerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shardrun_types::{
    BlockResult, ExecutionEvent, ObjectKey, PartitionId, Proof, SignedHeader, SignedTx, TxRequest,
};

/// Client for a horizontally-sharded ledger.
///
/// This is everything the scheduler needs from the outside world. The
/// implementation owns transaction encoding, signing, RPC transport and
/// proof construction; the scheduler only sequences calls.
///
/// # Streams
///
/// `block_results` and `signed_headers` return infinite, non-restartable
/// streams. Each call opens a fresh subscription; the scheduler opens exactly
/// one of each per partition for the lifetime of a run.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Encode and sign a request for broadcast on `partition`.
    fn sign(&self, partition: PartitionId, request: &TxRequest) -> Result<SignedTx, LedgerError>;

    /// Broadcast a signed transaction. Fire-and-forget: the outcome is only
    /// observable through `block_results`.
    async fn submit(&self, tx: SignedTx) -> Result<(), LedgerError>;

    /// Subscribe to per-block execution results of `partition`.
    async fn block_results(
        &self,
        partition: PartitionId,
    ) -> Result<BoxStream<'static, BlockResult>, LedgerError>;

    /// Subscribe to signed (finalized) headers of `partition`.
    async fn signed_headers(
        &self,
        partition: PartitionId,
    ) -> Result<BoxStream<'static, SignedHeader>, LedgerError>;

    /// Fetch an account/storage proof of `key` as seen by `partition`.
    async fn fetch_proof(&self, partition: PartitionId, key: ObjectKey)
        -> Result<Proof, LedgerError>;

    /// Learn the ledger key of an object created by an executed transaction.
    fn resolve_new_object_id(&self, events: &[ExecutionEvent]) -> Option<ObjectKey>;
}
