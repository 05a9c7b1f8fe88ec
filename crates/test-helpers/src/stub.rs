use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use shardrun_core::{Ledger, LedgerError};
use shardrun_types::{
    BlockHeight, BlockResult, ExecutionEvent, ObjectKey, PartitionId, Proof, SignedHeader,
    SignedTx, TxHash, TxRequest,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Ledger stub for unit tests.
///
/// Signing is deterministic and local, submissions are recorded, streams
/// never yield, and `fetch_proof` fails transiently a configured number of
/// times before answering.
#[derive(Debug, Default)]
pub struct StubLedger {
    proof_height: AtomicU64,
    proof_failures: AtomicU32,
    reject_proofs: AtomicBool,
    proof_calls: AtomicU32,
    nonce: AtomicU64,
    signed: Mutex<Vec<(PartitionId, TxRequest)>>,
    submitted: Mutex<Vec<SignedTx>>,
}

impl StubLedger {
    /// Create a stub whose proofs are at height 1.
    pub fn new() -> Self {
        let stub = Self::default();
        stub.proof_height.store(1, Ordering::SeqCst);
        stub
    }

    /// Height reported in proofs.
    pub fn with_proof_height(self, height: u64) -> Self {
        self.proof_height.store(height, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` proof fetches with a transient error.
    pub fn with_proof_failures(self, n: u32) -> Self {
        self.proof_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Reject every proof fetch permanently.
    pub fn rejecting_proofs(self) -> Self {
        self.reject_proofs.store(true, Ordering::SeqCst);
        self
    }

    /// Number of `fetch_proof` calls so far.
    pub fn proof_calls(&self) -> u32 {
        self.proof_calls.load(Ordering::SeqCst)
    }

    /// Every request signed so far, in order.
    pub fn signed(&self) -> Vec<(PartitionId, TxRequest)> {
        self.signed.lock().clone()
    }

    /// Every transaction submitted so far, in order.
    pub fn submitted(&self) -> Vec<SignedTx> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl Ledger for StubLedger {
    fn sign(&self, partition: PartitionId, request: &TxRequest) -> Result<SignedTx, LedgerError> {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        self.signed.lock().push((partition, request.clone()));
        Ok(SignedTx {
            hash: TxHash::from_parts(&[&partition.0.to_le_bytes(), &nonce.to_le_bytes()]),
            partition,
            payload: format!("{:?}", request).into_bytes(),
        })
    }

    async fn submit(&self, tx: SignedTx) -> Result<(), LedgerError> {
        self.submitted.lock().push(tx);
        Ok(())
    }

    async fn block_results(
        &self,
        _partition: PartitionId,
    ) -> Result<BoxStream<'static, BlockResult>, LedgerError> {
        Ok(stream::pending().boxed())
    }

    async fn signed_headers(
        &self,
        _partition: PartitionId,
    ) -> Result<BoxStream<'static, SignedHeader>, LedgerError> {
        Ok(stream::pending().boxed())
    }

    async fn fetch_proof(
        &self,
        partition: PartitionId,
        key: ObjectKey,
    ) -> Result<Proof, LedgerError> {
        self.proof_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_proofs.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected {
                partition,
                reason: "unknown object".into(),
            });
        }
        let remaining = self.proof_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.proof_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Unavailable {
                partition,
                reason: "connection reset".into(),
            });
        }
        Ok(Proof {
            partition,
            key,
            height: BlockHeight(self.proof_height.load(Ordering::SeqCst)),
            blob: b"proof".to_vec(),
        })
    }

    fn resolve_new_object_id(&self, events: &[ExecutionEvent]) -> Option<ObjectKey> {
        events.iter().find_map(ExecutionEvent::created_object)
    }
}
