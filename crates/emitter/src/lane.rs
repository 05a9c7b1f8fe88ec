//! Per-partition send lane: work queues, outstanding set and window.

use crate::AdmissionWindow;
use indexmap::IndexMap;
use shardrun_types::{ObjectKey, Operation, PartitionId, TxHash};
use std::collections::VecDeque;
use std::time::Instant;

/// Queue an operation waits in before being sent, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Priority {
    /// Released by the dependency graph after a predecessor completed.
    Freed,
    /// All of its objects finished migrating here.
    Migrated,
    /// Taken from the operation stream.
    Fresh,
}

/// What a sent transaction was for.
#[derive(Debug, Clone)]
pub(crate) enum InFlight {
    Operation(Operation),
    MoveTo(ObjectKey),
    Move2(ObjectKey),
}

#[derive(Debug)]
pub(crate) struct Outstanding {
    pub what: InFlight,
    pub sent_at: Instant,
}

#[derive(Debug)]
pub(crate) struct Lane {
    pub partition: PartitionId,
    pub window: AdmissionWindow,
    freed: VecDeque<Operation>,
    migrated: VecDeque<Operation>,
    fresh: VecDeque<Operation>,
    outstanding: IndexMap<TxHash, Outstanding>,
}

impl Lane {
    pub fn new(partition: PartitionId, window: AdmissionWindow) -> Self {
        Self {
            partition,
            window,
            freed: VecDeque::new(),
            migrated: VecDeque::new(),
            fresh: VecDeque::new(),
            outstanding: IndexMap::new(),
        }
    }

    pub fn push(&mut self, priority: Priority, operation: Operation) {
        match priority {
            Priority::Freed => self.freed.push_back(operation),
            Priority::Migrated => self.migrated.push_back(operation),
            Priority::Fresh => self.fresh.push_back(operation),
        }
    }

    /// Next queued operation, freed before migrated before fresh.
    pub fn pop_next(&mut self) -> Option<Operation> {
        self.freed
            .pop_front()
            .or_else(|| self.migrated.pop_front())
            .or_else(|| self.fresh.pop_front())
    }

    pub fn track(&mut self, hash: TxHash, what: InFlight) {
        self.outstanding.insert(
            hash,
            Outstanding {
                what,
                sent_at: Instant::now(),
            },
        );
    }

    pub fn complete(&mut self, hash: &TxHash) -> Option<Outstanding> {
        self.outstanding.shift_remove(hash)
    }

    pub fn budget(&self) -> usize {
        self.window.budget(self.outstanding.len())
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Depths of the freed, migrated and fresh queues.
    pub fn depths(&self) -> (usize, usize, usize) {
        (self.freed.len(), self.migrated.len(), self.fresh.len())
    }

    pub fn queued(&self) -> usize {
        self.freed.len() + self.migrated.len() + self.fresh.len()
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty() && self.queued() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardrun_test_helpers::ops;

    #[test]
    fn test_priority_order() {
        let mut lane = Lane::new(PartitionId(1), AdmissionWindow::new(4, 1, 4, 1));
        lane.push(Priority::Fresh, ops::transfer(1, 1));
        lane.push(Priority::Migrated, ops::transfer(2, 2));
        lane.push(Priority::Freed, ops::transfer(3, 3));
        lane.push(Priority::Fresh, ops::transfer(4, 4));

        let order: Vec<u64> = std::iter::from_fn(|| lane.pop_next())
            .map(|op| op.id.0)
            .collect();
        assert_eq!(order, vec![3, 2, 1, 4]);
    }

    #[test]
    fn test_outstanding_counts_against_budget() {
        let mut lane = Lane::new(PartitionId(1), AdmissionWindow::new(2, 1, 2, 1));
        let hash = TxHash::from_bytes(b"a");
        lane.track(hash, InFlight::MoveTo(ObjectKey::Id(1)));

        assert_eq!(lane.budget(), 1);
        assert!(!lane.is_idle());
        assert!(lane.complete(&hash).is_some());
        assert!(lane.complete(&hash).is_none());
        assert!(lane.is_idle());
    }
}
