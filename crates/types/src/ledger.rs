//! Types exchanged with the ledger collaborator.
//!
//! The scheduler never interprets proof or header blobs; it threads them from
//! the collaborator that produced them to the transaction that consumes them.

use crate::{BlockHeight, Method, ObjectKey, Operation, PartitionId, TxHash};

/// An event emitted while executing a transaction (e.g. a contract log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    /// Raw event data.
    pub data: Vec<u8>,
}

impl ExecutionEvent {
    /// Event announcing a newly created object.
    ///
    /// Integer ids are encoded as 8 big-endian bytes, addresses as their 20
    /// raw bytes.
    pub fn object_created(key: ObjectKey) -> Self {
        let data = match key {
            ObjectKey::Id(id) => id.to_be_bytes().to_vec(),
            ObjectKey::Address(bytes) => bytes.to_vec(),
        };
        Self { data }
    }

    /// Decode the object announced by [`ExecutionEvent::object_created`].
    pub fn created_object(&self) -> Option<ObjectKey> {
        match self.data.len() {
            8 => {
                let mut id = [0u8; 8];
                id.copy_from_slice(&self.data);
                Some(ObjectKey::Id(u64::from_be_bytes(id)))
            }
            20 => Some(ObjectKey::address_from_bytes(&self.data)),
            _ => None,
        }
    }
}

/// Execution outcome of one transaction inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxExecution {
    /// Hash of the executed transaction.
    pub tx_hash: TxHash,

    /// Whether execution succeeded.
    pub success: bool,

    /// Reason reported by the ledger when execution failed.
    pub exception: Option<String>,

    /// Events extracted from execution.
    pub events: Vec<ExecutionEvent>,
}

impl TxExecution {
    /// Successful execution with no events.
    pub fn ok(tx_hash: TxHash) -> Self {
        Self {
            tx_hash,
            success: true,
            exception: None,
            events: Vec::new(),
        }
    }

    /// Failed execution.
    pub fn failed(tx_hash: TxHash, exception: impl Into<String>) -> Self {
        Self {
            tx_hash,
            success: false,
            exception: Some(exception.into()),
            events: Vec::new(),
        }
    }
}

/// Per-block execution results for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    /// Partition that produced the block.
    pub partition: PartitionId,

    /// Block height.
    pub height: BlockHeight,

    /// Executions in block order.
    pub executions: Vec<TxExecution>,
}

/// A block header carrying a finality signature set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    /// Partition the header belongs to.
    pub partition: PartitionId,

    /// Height of the finalized block.
    pub height: BlockHeight,

    /// Opaque encoded header and signatures.
    pub blob: Vec<u8>,
}

/// Account/storage proof of an object's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Partition whose state the proof is against.
    pub partition: PartitionId,

    /// Object (ledger key) the proof covers.
    pub key: ObjectKey,

    /// Height whose signed header corroborates the proof.
    pub height: BlockHeight,

    /// Opaque proof bytes.
    pub blob: Vec<u8>,
}

/// What the scheduler asks the collaborator to sign and broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRequest {
    /// A workload operation, with its keys rewritten to ledger keys.
    Operation {
        /// The operation as produced by the source.
        operation: Operation,
        /// `operation.keys` mapped through the key-resolution table.
        resolved_keys: Vec<ObjectKey>,
    },

    /// Release an object on its current partition towards `destination`.
    MoveTo {
        /// Ledger key of the object.
        key: ObjectKey,
        /// Partition that will accept the object.
        destination: PartitionId,
    },

    /// Accept an object on the destination partition.
    Move2 {
        /// Ledger key of the object.
        key: ObjectKey,
        /// Partition that released the object.
        source: PartitionId,
        /// Proof of the released state.
        proof: Proof,
        /// Signed header at `proof.height`.
        header: SignedHeader,
    },
}

impl TxRequest {
    /// Method this request invokes.
    pub fn method(&self) -> Method {
        match self {
            TxRequest::Operation { operation, .. } => operation.method,
            TxRequest::MoveTo { .. } => Method::MoveTo,
            TxRequest::Move2 { .. } => Method::Move2,
        }
    }
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    /// Ledger hash; block results report executions by this value.
    pub hash: TxHash,

    /// Partition the transaction must be broadcast to.
    pub partition: PartitionId,

    /// Encoded envelope.
    pub payload: Vec<u8>,
}
