//! Core types for the cross-shard scheduler.
//!
//! Identifiers for objects, partitions and heights, the operation model,
//! and the wire types exchanged with the ledger collaborator.

pub mod humantime_duration;

mod hash;
mod identifiers;
mod ledger;
mod operation;

pub use hash::TxHash;
pub use identifiers::{BlockHeight, ObjectKey, OperationId, PartitionId};
pub use ledger::{
    BlockResult, ExecutionEvent, Proof, SignedHeader, SignedTx, TxExecution, TxRequest,
};
pub use operation::{Method, Operation};
