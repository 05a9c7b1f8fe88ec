//! Seeded synthetic workload.
//!
//! Two-object transfers over a universe of objects, a configurable share of
//! which pair objects homed on different partitions. Another share creates
//! fresh objects, which later transfers may then touch. The same seed always
//! yields the same operation sequence.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use shardrun_partitioning::home_partition;
use shardrun_types::{Method, ObjectKey, Operation, OperationId};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors building a synthetic workload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkloadError {
    #[error("{name} {value} is outside 0.0..=1.0")]
    InvalidRatio { name: &'static str, value: f64 },

    #[error("objects_per_partition must be at least 2, got {0}")]
    TooFewObjects(usize),

    #[error("workload needs at least one partition")]
    ZeroPartitions,

    #[error("{0}")]
    InvalidSelection(String),
}

/// How objects are picked within a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionMode {
    /// Uniform.
    #[default]
    Random,

    /// Skewed toward low indices. Higher exponents concentrate traffic on
    /// fewer hot objects.
    Zipf { exponent: f64 },
}

impl FromStr for SelectionMode {
    type Err = WorkloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(SelectionMode::Random),
            "zipf" => Ok(SelectionMode::Zipf { exponent: 1.5 }),
            s if s.starts_with("zipf:") => {
                let exponent: f64 = s[5..].parse().map_err(|_| {
                    WorkloadError::InvalidSelection(format!("invalid zipf exponent: {}", &s[5..]))
                })?;
                let mode = SelectionMode::Zipf { exponent };
                mode.validate()?;
                Ok(mode)
            }
            _ => Err(WorkloadError::InvalidSelection(format!(
                "unknown selection mode '{s}': expected 'random', 'zipf' or 'zipf:<exponent>'"
            ))),
        }
    }
}

impl SelectionMode {
    /// Zipf exponents below 1 are rejected; the sampler is only defined from 1 up.
    pub fn validate(&self) -> Result<(), WorkloadError> {
        match *self {
            SelectionMode::Zipf { exponent } if !exponent.is_finite() || exponent < 1.0 => {
                Err(WorkloadError::InvalidSelection(format!(
                    "zipf exponent must be at least 1, got {exponent}"
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::Random => f.write_str("random"),
            SelectionMode::Zipf { exponent } => write!(f, "zipf:{exponent}"),
        }
    }
}

impl TryFrom<String> for SelectionMode {
    type Error = WorkloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SelectionMode> for String {
    fn from(mode: SelectionMode) -> Self {
        mode.to_string()
    }
}

/// Shape of a synthetic workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Objects homed on each partition.
    pub objects_per_partition: usize,

    /// Operations to generate.
    pub operations: u64,

    /// Share of operations pairing objects homed on different partitions.
    pub cross_shard_ratio: f64,

    /// Share of operations creating a new object instead of transferring.
    pub create_ratio: f64,

    /// Object selection within a partition.
    pub selection: SelectionMode,

    /// RNG seed.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            objects_per_partition: 100,
            operations: 1000,
            cross_shard_ratio: 0.3,
            create_ratio: 0.0,
            selection: SelectionMode::Random,
            seed: 42,
        }
    }
}

impl WorkloadConfig {
    pub fn with_operations(mut self, operations: u64) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_objects_per_partition(mut self, objects: usize) -> Self {
        self.objects_per_partition = objects;
        self
    }

    pub fn with_cross_shard_ratio(mut self, ratio: f64) -> Self {
        self.cross_shard_ratio = ratio;
        self
    }

    pub fn with_create_ratio(mut self, ratio: f64) -> Self {
        self.create_ratio = ratio;
        self
    }

    pub fn with_selection(mut self, selection: SelectionMode) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), WorkloadError> {
        for (name, value) in [
            ("cross_shard_ratio", self.cross_shard_ratio),
            ("create_ratio", self.create_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(WorkloadError::InvalidRatio { name, value });
            }
        }
        if self.objects_per_partition < 2 {
            return Err(WorkloadError::TooFewObjects(self.objects_per_partition));
        }
        self.selection.validate()
    }
}

/// Iterator over a seeded synthetic workload.
pub struct SyntheticWorkload {
    config: WorkloadConfig,
    /// Objects grouped by home partition, indexed by `PartitionId::index()`.
    universe: Vec<Vec<ObjectKey>>,
    rng: ChaCha8Rng,
    generated: u64,
    /// Id handed to the next created object; above every id in the universe.
    next_id: u64,
}

impl SyntheticWorkload {
    pub fn new(config: WorkloadConfig, num_partitions: u64) -> Result<Self, WorkloadError> {
        config.validate()?;
        if num_partitions == 0 {
            return Err(WorkloadError::ZeroPartitions);
        }

        let per_partition = config.objects_per_partition;
        let mut universe = vec![Vec::with_capacity(per_partition); num_partitions as usize];
        let mut filled = 0;
        let mut next = 1u64;
        while filled < universe.len() {
            let key = ObjectKey::Id(next);
            next += 1;
            let bucket = &mut universe[home_partition(&key, num_partitions).index()];
            if bucket.len() < per_partition {
                bucket.push(key);
                if bucket.len() == per_partition {
                    filled += 1;
                }
            }
        }

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            universe,
            generated: 0,
            next_id: next,
        })
    }

    /// Objects homed on each partition.
    pub fn universe(&self) -> &[Vec<ObjectKey>] {
        &self.universe
    }

    fn pick_partition(&mut self) -> usize {
        self.rng.gen_range(0..self.universe.len())
    }

    fn pick_index(&mut self, n: usize) -> usize {
        match self.config.selection {
            SelectionMode::Random => self.rng.gen_range(0..n),
            SelectionMode::Zipf { exponent } => self.zipf_index(n, exponent),
        }
    }

    /// Zipf-distributed index in `0..n`.
    fn zipf_index(&mut self, n: usize, exponent: f64) -> usize {
        let u: f64 = self.rng.gen();
        let rank = ((n as f64).powf(1.0 - u)).powf(1.0 / exponent) as usize;
        rank.saturating_sub(1).min(n - 1)
    }

    fn same_partition_pair(&mut self) -> (ObjectKey, ObjectKey) {
        let partition = self.pick_partition();
        let n = self.universe[partition].len();
        let first = self.pick_index(n);
        let mut second = self.pick_index(n);
        if second == first {
            second = (first + 1) % n;
        }
        (self.universe[partition][first], self.universe[partition][second])
    }

    /// A fresh object, joined to its home partition's pool once generated.
    fn create(&mut self) -> Operation {
        let key = ObjectKey::Id(self.next_id);
        self.next_id += 1;
        let home = home_partition(&key, self.universe.len() as u64);
        self.universe[home.index()].push(key);
        Operation::creating(OperationId(self.generated), Method::Create, Vec::new(), key)
    }

    fn cross_partition_pair(&mut self) -> (ObjectKey, ObjectKey) {
        let partitions = self.universe.len();
        let from_partition = self.pick_partition();
        let offset = self.rng.gen_range(1..partitions);
        let to_partition = (from_partition + offset) % partitions;

        let from = self.pick_index(self.universe[from_partition].len());
        let to = self.pick_index(self.universe[to_partition].len());
        (self.universe[from_partition][from], self.universe[to_partition][to])
    }
}

impl Iterator for SyntheticWorkload {
    type Item = Operation;

    fn next(&mut self) -> Option<Operation> {
        if self.generated >= self.config.operations {
            return None;
        }
        self.generated += 1;

        if self.config.create_ratio > 0.0 && self.rng.gen_bool(self.config.create_ratio) {
            return Some(self.create());
        }

        let cross = self.universe.len() > 1 && self.rng.gen_bool(self.config.cross_shard_ratio);
        let (from, to) = if cross {
            self.cross_partition_pair()
        } else {
            self.same_partition_pair()
        };
        Some(Operation::new(
            OperationId(self.generated),
            Method::Transfer,
            vec![from, to],
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.config.operations - self.generated) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn homes(operation: &Operation, num_partitions: u64) -> (u64, u64) {
        (
            home_partition(&operation.keys[0], num_partitions).0,
            home_partition(&operation.keys[1], num_partitions).0,
        )
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let config = WorkloadConfig::default().with_operations(200).with_seed(7);
        let first: Vec<_> = SyntheticWorkload::new(config.clone(), 3).unwrap().collect();
        let second: Vec<_> = SyntheticWorkload::new(config, 3).unwrap().collect();

        assert_eq!(first.len(), 200);
        assert_eq!(first, second);
    }

    #[test]
    fn test_universe_is_grouped_by_home() {
        let config = WorkloadConfig::default().with_objects_per_partition(5);
        let workload = SyntheticWorkload::new(config, 4).unwrap();

        for (index, objects) in workload.universe().iter().enumerate() {
            assert_eq!(objects.len(), 5);
            for key in objects {
                assert_eq!(home_partition(key, 4).index(), index);
            }
        }
    }

    #[test]
    fn test_zero_ratio_stays_on_one_partition() {
        let config = WorkloadConfig::default()
            .with_operations(300)
            .with_cross_shard_ratio(0.0);
        for operation in SyntheticWorkload::new(config, 4).unwrap() {
            let (from, to) = homes(&operation, 4);
            assert_eq!(from, to);
            assert_ne!(operation.keys[0], operation.keys[1]);
        }
    }

    #[test]
    fn test_full_ratio_always_crosses() {
        let config = WorkloadConfig::default()
            .with_operations(300)
            .with_cross_shard_ratio(1.0);
        for operation in SyntheticWorkload::new(config, 3).unwrap() {
            let (from, to) = homes(&operation, 3);
            assert_ne!(from, to);
        }
    }

    #[test]
    fn test_single_partition_never_crosses() {
        let config = WorkloadConfig::default().with_cross_shard_ratio(1.0);
        let operations: Vec<_> = SyntheticWorkload::new(config, 1).unwrap().collect();
        assert_eq!(operations.len(), 1000);
        assert!(operations.iter().all(|op| op.keys[0] != op.keys[1]));
    }

    #[test]
    fn test_zipf_concentrates_on_hot_objects() {
        let config = WorkloadConfig::default()
            .with_operations(2000)
            .with_cross_shard_ratio(0.0)
            .with_selection(SelectionMode::Zipf { exponent: 2.0 });
        let workload = SyntheticWorkload::new(config, 1).unwrap();
        let hottest = workload.universe()[0][0];

        let hits = workload
            .filter(|op| op.keys.contains(&hottest))
            .count();
        // Uniform selection would touch the first of 100 objects in ~2% of pairs.
        assert!(hits > 200, "hottest object touched only {hits} times");
    }

    #[test]
    fn test_full_create_ratio_only_creates_fresh_objects() {
        let config = WorkloadConfig::default()
            .with_operations(50)
            .with_objects_per_partition(5)
            .with_create_ratio(1.0);
        let workload = SyntheticWorkload::new(config, 3).unwrap();
        let existing: Vec<ObjectKey> = workload.universe().concat();
        let operations: Vec<_> = workload.collect();

        let mut created = Vec::new();
        for operation in &operations {
            assert_eq!(operation.method, Method::Create);
            let key = operation.creates.unwrap();
            assert_eq!(operation.keys, vec![key]);
            assert!(!existing.contains(&key));
            assert!(!created.contains(&key));
            created.push(key);
        }
        assert_eq!(created.len(), 50);
    }

    #[test]
    fn test_created_objects_join_later_transfers() {
        let config = WorkloadConfig::default()
            .with_operations(400)
            .with_objects_per_partition(2)
            .with_cross_shard_ratio(0.0)
            .with_create_ratio(0.5)
            .with_seed(3);
        let operations: Vec<_> = SyntheticWorkload::new(config, 2).unwrap().collect();

        let created: Vec<ObjectKey> = operations.iter().filter_map(|op| op.creates).collect();
        assert!(!created.is_empty());
        assert!(created.len() < operations.len());

        let touched_fresh = operations
            .iter()
            .filter(|op| op.method == Method::Transfer)
            .any(|op| op.keys.iter().any(|key| created.contains(key)));
        assert!(touched_fresh);

        // Every transfer of a created object comes after its creation.
        for (index, op) in operations.iter().enumerate() {
            for key in op.keys.iter().filter(|key| created.contains(key)) {
                let born = operations
                    .iter()
                    .position(|other| other.creates == Some(*key))
                    .unwrap();
                assert!(born <= index);
            }
        }
    }

    #[test]
    fn test_parse_selection_mode() {
        assert_eq!("random".parse::<SelectionMode>(), Ok(SelectionMode::Random));
        assert_eq!(
            "zipf".parse::<SelectionMode>(),
            Ok(SelectionMode::Zipf { exponent: 1.5 })
        );
        assert_eq!(
            "ZIPF:2.5".parse::<SelectionMode>(),
            Ok(SelectionMode::Zipf { exponent: 2.5 })
        );
        assert!("zipf:hot".parse::<SelectionMode>().is_err());
        assert!("zipf:-1".parse::<SelectionMode>().is_err());
        assert!("zipf:0.5".parse::<SelectionMode>().is_err());
        assert_eq!(
            "zipf:1".parse::<SelectionMode>(),
            Ok(SelectionMode::Zipf { exponent: 1.0 })
        );
        assert!("round-robin".parse::<SelectionMode>().is_err());
        assert_eq!(SelectionMode::Zipf { exponent: 1.5 }.to_string(), "zipf:1.5");
    }

    #[test]
    fn test_invalid_config() {
        let config = WorkloadConfig::default().with_cross_shard_ratio(1.5);
        assert!(matches!(
            SyntheticWorkload::new(config, 2),
            Err(WorkloadError::InvalidRatio { name: "cross_shard_ratio", .. })
        ));

        let config = WorkloadConfig::default().with_create_ratio(-0.1);
        assert!(matches!(
            SyntheticWorkload::new(config, 2),
            Err(WorkloadError::InvalidRatio { name: "create_ratio", .. })
        ));

        // Built directly rather than parsed, the sub-1 exponent is still caught.
        let config =
            WorkloadConfig::default().with_selection(SelectionMode::Zipf { exponent: 0.5 });
        assert!(matches!(
            SyntheticWorkload::new(config, 2),
            Err(WorkloadError::InvalidSelection(_))
        ));

        let config = WorkloadConfig::default().with_objects_per_partition(1);
        assert!(matches!(
            SyntheticWorkload::new(config, 2),
            Err(WorkloadError::TooFewObjects(1))
        ));

        assert!(matches!(
            SyntheticWorkload::new(WorkloadConfig::default(), 0),
            Err(WorkloadError::ZeroPartitions)
        ));
    }
}
