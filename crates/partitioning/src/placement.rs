//! Residency map and per-partition load.

use crate::PlacementPolicy;
use parking_lot::RwLock;
use shardrun_types::{ObjectKey, PartitionId};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors from placement operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// A partitioning needs at least one partition.
    #[error("number of partitions must be at least 1")]
    ZeroPartitions,

    /// `assign` was called for a key that already has a partition.
    #[error("{key} already assigned to {partition}")]
    AlreadyAssigned {
        /// The key.
        key: ObjectKey,
        /// Its current partition.
        partition: PartitionId,
    },

    /// A key was queried before being assigned.
    #[error("{key} has no partition assignment")]
    Unassigned {
        /// The key.
        key: ObjectKey,
    },

    /// A partition id outside `1..=num_partitions`.
    #[error("{partition} out of range (num_partitions = {num_partitions})")]
    OutOfRange {
        /// The offending partition.
        partition: PartitionId,
        /// Configured partition count.
        num_partitions: u64,
    },

    /// A destination was requested for an empty key set.
    #[error("destination requested for an empty key set")]
    NoKeys,
}

/// Deterministic initial partition of a key: `hash % num_partitions + 1`.
pub fn home_partition(key: &ObjectKey, num_partitions: u64) -> PartitionId {
    PartitionId(key.placement_hash() % num_partitions + 1)
}

#[derive(Debug)]
struct PartitionMap {
    residency: HashMap<ObjectKey, PartitionId>,
    /// Indexed by `PartitionId::index()`.
    loads: Vec<u64>,
}

impl PartitionMap {
    fn partition_of(&self, key: &ObjectKey) -> Result<PartitionId, PartitionError> {
        self.residency
            .get(key)
            .copied()
            .ok_or(PartitionError::Unassigned { key: *key })
    }

    /// Least-loaded partition among `candidates`, lowest id on ties.
    fn least_loaded(&self, candidates: impl Iterator<Item = PartitionId>) -> Option<PartitionId> {
        candidates.min_by_key(|p| (self.loads[p.index()], p.0))
    }
}

/// Object key to partition assignment with per-partition load counters.
///
/// The map and the counters live behind one reader/writer lock and are
/// always updated together, so the loads sum to the number of assigned
/// keys at every point another thread can observe. The lock is never held
/// across an await point.
#[derive(Debug)]
pub struct Partitioning {
    num_partitions: u64,
    policy: PlacementPolicy,
    inner: RwLock<PartitionMap>,
}

impl Partitioning {
    /// Create an empty partitioning over `1..=num_partitions`.
    pub fn new(num_partitions: u64) -> Result<Self, PartitionError> {
        if num_partitions == 0 {
            return Err(PartitionError::ZeroPartitions);
        }
        Ok(Self {
            num_partitions,
            policy: PlacementPolicy::default(),
            inner: RwLock::new(PartitionMap {
                residency: HashMap::new(),
                loads: vec![0; num_partitions as usize],
            }),
        })
    }

    /// Set the destination policy.
    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> u64 {
        self.num_partitions
    }

    /// Active destination policy.
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// Partition `key` would be assigned to.
    pub fn home_partition(&self, key: &ObjectKey) -> PartitionId {
        home_partition(key, self.num_partitions)
    }

    /// Place a key for the first time at its home partition.
    ///
    /// Placement happens once per key; later changes go through
    /// [`Partitioning::move_object`].
    pub fn assign(&self, key: ObjectKey) -> Result<PartitionId, PartitionError> {
        let home = self.home_partition(&key);
        let mut inner = self.inner.write();
        if let Some(&partition) = inner.residency.get(&key) {
            return Err(PartitionError::AlreadyAssigned { key, partition });
        }
        inner.residency.insert(key, home);
        inner.loads[home.index()] += 1;
        trace!(%key, partition = home.0, "Assigned object");
        Ok(home)
    }

    /// Current partition of `key`, if assigned.
    pub fn current_partition(&self, key: &ObjectKey) -> Option<PartitionId> {
        self.inner.read().residency.get(key).copied()
    }

    /// Whether every key currently resolves to the same partition.
    ///
    /// Every key must already be assigned.
    pub fn same_shard(&self, keys: &[ObjectKey]) -> Result<bool, PartitionError> {
        let inner = self.inner.read();
        let mut first = None;
        let mut same = true;
        for key in keys {
            let partition = inner.partition_of(key)?;
            match first {
                None => first = Some(partition),
                Some(p) if p != partition => same = false,
                Some(_) => {}
            }
        }
        Ok(same)
    }

    /// Reassign `key` to `destination`, returning its previous partition.
    ///
    /// Works for both assigned and never-seen keys. The source counter is
    /// decremented and the destination counter incremented under the same
    /// write lock as the map update.
    pub fn move_object(
        &self,
        key: ObjectKey,
        destination: PartitionId,
    ) -> Result<Option<PartitionId>, PartitionError> {
        self.check_range(destination)?;
        let mut inner = self.inner.write();
        let previous = inner.residency.insert(key, destination);
        if previous == Some(destination) {
            return Ok(previous);
        }
        if let Some(source) = previous {
            inner.loads[source.index()] -= 1;
        }
        inner.loads[destination.index()] += 1;
        debug!(
            %key,
            from = previous.map(|p| p.0),
            to = destination.0,
            "Moved object"
        );
        Ok(previous)
    }

    /// Convergence partition for an operation over `keys` under the active
    /// policy. Every key must already be assigned.
    pub fn choose_destination(&self, keys: &[ObjectKey]) -> Result<PartitionId, PartitionError> {
        let first = keys.first().ok_or(PartitionError::NoKeys)?;
        let inner = self.inner.read();

        match self.policy {
            PlacementPolicy::Occupants => {
                let occupied = keys
                    .iter()
                    .map(|key| inner.partition_of(key))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(inner
                    .least_loaded(occupied.into_iter())
                    .unwrap_or(PartitionId(1)))
            }
            PlacementPolicy::GlobalExcludingSource => {
                let source = inner.partition_of(first)?;
                for key in &keys[1..] {
                    inner.partition_of(key)?;
                }
                Ok(inner
                    .least_loaded(PartitionId::all(self.num_partitions).filter(|p| *p != source))
                    .unwrap_or(source))
            }
        }
    }

    /// Number of objects currently assigned to `partition`.
    pub fn load(&self, partition: PartitionId) -> u64 {
        self.inner
            .read()
            .loads
            .get(partition.index())
            .copied()
            .unwrap_or(0)
    }

    /// Loads of all partitions, indexed by `PartitionId::index()`.
    pub fn loads(&self) -> Vec<u64> {
        self.inner.read().loads.clone()
    }

    /// Number of assigned objects.
    pub fn assigned_count(&self) -> usize {
        self.inner.read().residency.len()
    }

    fn check_range(&self, partition: PartitionId) -> Result<(), PartitionError> {
        if partition.0 == 0 || partition.0 > self.num_partitions {
            return Err(PartitionError::OutOfRange {
                partition,
                num_partitions: self.num_partitions,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;

    fn key(id: u64) -> ObjectKey {
        ObjectKey::Id(id)
    }

    fn assert_loads_consistent(p: &Partitioning) {
        let total: u64 = p.loads().iter().sum();
        assert_eq!(total, p.assigned_count() as u64);
    }

    #[test]
    fn test_assign_uses_hash_home() {
        let p = Partitioning::new(4).unwrap();

        assert_eq!(p.assign(key(7)).unwrap(), PartitionId(4));
        assert_eq!(p.load(PartitionId(4)), 1);
        assert_eq!(p.current_partition(&key(7)), Some(PartitionId(4)));

        assert_eq!(p.assign(key(8)).unwrap(), PartitionId(1));
        assert_eq!(p.load(PartitionId(1)), 1);
    }

    #[test]
    fn test_address_key_places_by_trailing_bytes() {
        let mut bytes = [0xffu8; 20];
        bytes[12..].copy_from_slice(&10u64.to_be_bytes());
        let addr = ObjectKey::Address(bytes);

        assert_eq!(home_partition(&addr, 4), PartitionId(3));
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert_eq!(
            Partitioning::new(0).unwrap_err(),
            PartitionError::ZeroPartitions
        );
    }

    #[test]
    fn test_reassign_is_an_error() {
        let p = Partitioning::new(4).unwrap();
        p.assign(key(7)).unwrap();

        let err = p.assign(key(7)).unwrap_err();
        assert_eq!(
            err,
            PartitionError::AlreadyAssigned {
                key: key(7),
                partition: PartitionId(4)
            }
        );
        assert_eq!(p.load(PartitionId(4)), 1);
    }

    #[test]
    fn test_same_shard() {
        let p = Partitioning::new(4).unwrap();
        for id in [1, 5, 2] {
            p.assign(key(id)).unwrap();
        }

        assert!(p.same_shard(&[key(1), key(5)]).unwrap());
        assert!(!p.same_shard(&[key(1), key(2)]).unwrap());
        assert!(p.same_shard(&[]).unwrap());
        assert_eq!(
            p.same_shard(&[key(1), key(99)]).unwrap_err(),
            PartitionError::Unassigned { key: key(99) }
        );
    }

    #[test]
    fn test_move_updates_loads() {
        let p = Partitioning::new(4).unwrap();
        p.assign(key(7)).unwrap();

        let previous = p.move_object(key(7), PartitionId(2)).unwrap();
        assert_eq!(previous, Some(PartitionId(4)));
        assert_eq!(p.load(PartitionId(4)), 0);
        assert_eq!(p.load(PartitionId(2)), 1);
        assert_eq!(p.current_partition(&key(7)), Some(PartitionId(2)));
        assert_loads_consistent(&p);
    }

    #[test]
    fn test_move_unseen_key_assigns_it() {
        let p = Partitioning::new(4).unwrap();

        assert_eq!(p.move_object(key(3), PartitionId(1)).unwrap(), None);
        assert_eq!(p.load(PartitionId(1)), 1);
        assert_eq!(p.assigned_count(), 1);
    }

    #[test]
    fn test_move_to_same_partition_is_noop() {
        let p = Partitioning::new(4).unwrap();
        p.assign(key(7)).unwrap();

        p.move_object(key(7), PartitionId(4)).unwrap();
        assert_eq!(p.load(PartitionId(4)), 1);
        assert_loads_consistent(&p);
    }

    #[test]
    fn test_move_out_of_range_rejected() {
        let p = Partitioning::new(4).unwrap();
        assert!(matches!(
            p.move_object(key(1), PartitionId(5)),
            Err(PartitionError::OutOfRange { .. })
        ));
        assert!(matches!(
            p.move_object(key(1), PartitionId(0)),
            Err(PartitionError::OutOfRange { .. })
        ));
        assert_eq!(p.assigned_count(), 0);
    }

    #[test]
    fn test_occupants_policy_picks_least_loaded_occupant() {
        let p = Partitioning::new(4).unwrap();
        // Partition 2: keys 1, 5, 9. Partition 3: key 2.
        for id in [1, 5, 9, 2] {
            p.assign(key(id)).unwrap();
        }

        assert_eq!(
            p.choose_destination(&[key(1), key(2)]).unwrap(),
            PartitionId(3)
        );
    }

    #[test]
    fn test_occupants_policy_ties_break_low() {
        let p = Partitioning::new(4).unwrap();
        p.assign(key(3)).unwrap(); // partition 4
        p.assign(key(1)).unwrap(); // partition 2

        assert_eq!(
            p.choose_destination(&[key(3), key(1)]).unwrap(),
            PartitionId(2)
        );
    }

    #[test]
    fn test_global_policy_excludes_source() {
        let p = Partitioning::new(4)
            .unwrap()
            .with_policy(PlacementPolicy::GlobalExcludingSource);
        // Partition 1 empty but the source; partitions 2..4 loaded 2, 1, 1.
        p.move_object(key(100), PartitionId(1)).unwrap();
        p.move_object(key(101), PartitionId(2)).unwrap();
        p.move_object(key(102), PartitionId(2)).unwrap();
        p.move_object(key(103), PartitionId(3)).unwrap();
        p.move_object(key(104), PartitionId(4)).unwrap();

        assert_eq!(p.choose_destination(&[key(100)]).unwrap(), PartitionId(3));
    }

    #[test]
    fn test_global_policy_single_partition() {
        let p = Partitioning::new(1)
            .unwrap()
            .with_policy(PlacementPolicy::GlobalExcludingSource);
        p.assign(key(9)).unwrap();

        assert_eq!(p.choose_destination(&[key(9)]).unwrap(), PartitionId(1));
    }

    #[test]
    fn test_global_policy_may_pick_unoccupied_partition() {
        let p = Partitioning::new(3)
            .unwrap()
            .with_policy(PlacementPolicy::GlobalExcludingSource);
        // Source on 1, second key on 3; partition 2 holds nothing of this operation.
        p.move_object(key(100), PartitionId(1)).unwrap();
        p.move_object(key(101), PartitionId(3)).unwrap();
        p.move_object(key(102), PartitionId(3)).unwrap();

        assert_eq!(
            p.choose_destination(&[key(100), key(101)]).unwrap(),
            PartitionId(2)
        );
    }

    #[test]
    fn test_choose_destination_requires_assignment() {
        let p = Partitioning::new(4).unwrap();
        p.assign(key(1)).unwrap();

        assert_eq!(p.choose_destination(&[]).unwrap_err(), PartitionError::NoKeys);
        assert_eq!(
            p.choose_destination(&[key(1), key(2)]).unwrap_err(),
            PartitionError::Unassigned { key: key(2) }
        );
    }

    #[test]
    fn test_loads_sum_to_assigned_under_random_moves() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let p = Partitioning::new(5).unwrap();

        for _ in 0..2_000 {
            let k = key(rng.gen_range(0..200));
            if rng.gen_bool(0.5) {
                let _ = p.assign(k);
            } else {
                let dest = PartitionId(rng.gen_range(1..=5));
                p.move_object(k, dest).unwrap();
            }
            assert_loads_consistent(&p);
        }
    }

    #[test]
    fn test_concurrent_moves_keep_loads_consistent() {
        let p = Arc::new(Partitioning::new(3).unwrap());
        for id in 0..30 {
            p.assign(key(id)).unwrap();
        }

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let p = Arc::clone(&p);
                s.spawn(move || {
                    for i in 0..500u64 {
                        let dest = PartitionId((t + i) % 3 + 1);
                        p.move_object(key(i % 30), dest).unwrap();
                        let _ = p.same_shard(&[key(0), key(1)]);
                    }
                });
            }
        });

        assert_eq!(p.assigned_count(), 30);
        assert_loads_consistent(&p);
    }
}
