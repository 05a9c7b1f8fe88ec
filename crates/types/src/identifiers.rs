//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a migratable, single-owner object (an account or a token).
///
/// Keys are opaque to the scheduler: they are compared, hashed for placement,
/// and threaded through to the ledger. Objects never merge or split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKey {
    /// Integer identifier (e.g. a token id from a recorded trace).
    Id(u64),
    /// 20-byte ledger address.
    Address([u8; 20]),
}

impl ObjectKey {
    /// Fixed-width value used for deterministic placement.
    ///
    /// Integer keys place by their own value; addresses by the big-endian
    /// `u64` formed from their last 8 bytes.
    pub fn placement_hash(&self) -> u64 {
        match self {
            ObjectKey::Id(id) => *id,
            ObjectKey::Address(bytes) => {
                let mut tail = [0u8; 8];
                tail.copy_from_slice(&bytes[12..]);
                u64::from_be_bytes(tail)
            }
        }
    }

    /// Build an address key from a byte slice.
    ///
    /// # Panics
    ///
    /// Panics if bytes length is not exactly 20.
    pub fn address_from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), 20, "Address must be exactly 20 bytes");
        let mut arr = [0u8; 20];
        arr.copy_from_slice(bytes);
        ObjectKey::Address(arr)
    }
}

impl From<u64> for ObjectKey {
    fn from(id: u64) -> Self {
        ObjectKey::Id(id)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Id(id) => write!(f, "Object({})", id),
            ObjectKey::Address(bytes) => write!(f, "Object(0x{}..)", hex::encode(&bytes[..4])),
        }
    }
}

/// Partition (shard) identifier.
///
/// Partitions are numbered `1..=N`; zero is never a valid partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u64);

impl PartitionId {
    /// Zero-based index for per-partition vectors.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Partition for a zero-based index.
    pub fn from_index(index: usize) -> Self {
        PartitionId(index as u64 + 1)
    }

    /// Iterate over all partitions `1..=num_partitions`.
    pub fn all(num_partitions: u64) -> impl Iterator<Item = PartitionId> {
        (1..=num_partitions).map(PartitionId)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition({})", self.0)
    }
}

/// Block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHeight(pub u64);

impl BlockHeight {
    /// Genesis block height.
    pub const GENESIS: Self = BlockHeight(0);

    /// Get the next block height.
    pub fn next(self) -> Self {
        BlockHeight(self.0 + 1)
    }

    /// Get the previous block height (returns None if at genesis).
    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(BlockHeight(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({})", self.0)
    }
}

/// Scheduler-assigned operation identifier, unique for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_height_next_prev() {
        let height = BlockHeight(10);
        assert_eq!(height.next(), BlockHeight(11));
        assert_eq!(height.prev(), Some(BlockHeight(9)));

        assert_eq!(BlockHeight::GENESIS.prev(), None);
        assert_eq!(BlockHeight::GENESIS.next(), BlockHeight(1));
    }

    #[test]
    fn test_placement_hash_of_address_uses_tail() {
        let mut bytes = [0xAAu8; 20];
        bytes[12..].copy_from_slice(&7u64.to_be_bytes());
        assert_eq!(ObjectKey::Address(bytes).placement_hash(), 7);
        assert_eq!(ObjectKey::Id(7).placement_hash(), 7);
    }

    #[test]
    fn test_partition_index_is_one_based() {
        assert_eq!(PartitionId(1).index(), 0);
        assert_eq!(PartitionId::from_index(3), PartitionId(4));
        let all: Vec<_> = PartitionId::all(3).collect();
        assert_eq!(all, vec![PartitionId(1), PartitionId(2), PartitionId(3)]);
    }
}
