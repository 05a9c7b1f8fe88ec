//! Per-object serialization of operations.
//!
//! Every object key owns a FIFO chain of the operations that reference it.
//! The head of a chain is the one operation allowed to be in flight for that
//! key. A multi-key operation is sendable only once it heads the chain of
//! every key it depends on.
//!
//! Chains are singly linked through per-key successor pointers, and a
//! key -> tail index makes admission O(1) regardless of chain length.

use shardrun_types::{ObjectKey, Operation, OperationId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised by the dependency graph.
///
/// All of these mean the caller's bookkeeping has diverged from the graph
/// and cannot be continued safely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// Release was requested for a key with no operation at its head.
    #[error("release of {key} with no head operation")]
    NoHead {
        /// The key being released.
        key: ObjectKey,
    },

    /// The keys passed to a single release are headed by different operations.
    #[error("release of {key}: head is {found}, expected {expected}")]
    HeadMismatch {
        /// The key whose head disagreed.
        key: ObjectKey,
        /// Head of the first key in the release.
        expected: OperationId,
        /// Head actually found for `key`.
        found: OperationId,
    },

    /// Release named only part of the head operation's keys.
    #[error("release of {id} omitted key {key}")]
    PartialRelease {
        /// The operation being released.
        id: OperationId,
        /// A key of the operation not included in the release.
        key: ObjectKey,
    },

    /// An operation id was admitted twice.
    #[error("operation {0} already admitted")]
    DuplicateOperation(OperationId),

    /// A head or tail index names an operation that is no longer live.
    #[error("index refers to released operation {0}")]
    StaleIndex(OperationId),
}

/// One admitted operation plus its per-key successor pointers.
#[derive(Debug)]
struct Node {
    /// The admitted operation.
    operation: Operation,
    /// Distinct keys of the operation, in declaration order.
    keys: Vec<ObjectKey>,
    /// key -> next operation waiting on that same key.
    successors: HashMap<ObjectKey, OperationId>,
}

/// Dependency graph serializing operations per object key.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// All live operations (admitted, not yet released).
    nodes: HashMap<OperationId, Node>,
    /// key -> operation currently allowed to act on the key.
    heads: HashMap<ObjectKey, OperationId>,
    /// key -> last operation queued on the key.
    tails: HashMap<ObjectKey, OperationId>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an operation.
    ///
    /// Returns `true` when the operation was queued behind an existing head on
    /// at least one key and must wait, `false` when it heads every key and can
    /// be sent immediately.
    pub fn admit(&mut self, operation: Operation) -> Result<bool, DependencyError> {
        let id = operation.id;
        if self.nodes.contains_key(&id) {
            return Err(DependencyError::DuplicateOperation(id));
        }

        let keys = distinct_keys(&operation.keys);
        let mut should_wait = false;

        for &key in &keys {
            match self.tails.insert(key, id) {
                None => {
                    self.heads.insert(key, id);
                }
                Some(tail) => {
                    should_wait = true;
                    self.nodes
                        .get_mut(&tail)
                        .ok_or(DependencyError::StaleIndex(tail))?
                        .successors
                        .insert(key, id);
                }
            }
        }

        self.nodes.insert(
            id,
            Node {
                operation,
                keys,
                successors: HashMap::new(),
            },
        );

        Ok(should_wait)
    }

    /// Release the operation heading `keys` once it has completed.
    ///
    /// `keys` must be exactly the keys of one head operation (duplicates are
    /// ignored). Each key's successor, if any, is promoted to head. Returns the
    /// promoted operations that now head every one of their own keys, in the
    /// order they were promoted.
    pub fn release(&mut self, keys: &[ObjectKey]) -> Result<Vec<Operation>, DependencyError> {
        let keys = distinct_keys(keys);
        let Some(&first) = keys.first() else {
            return Ok(Vec::new());
        };

        let head = *self
            .heads
            .get(&first)
            .ok_or(DependencyError::NoHead { key: first })?;

        for &key in &keys {
            let found = *self.heads.get(&key).ok_or(DependencyError::NoHead { key })?;
            if found != head {
                return Err(DependencyError::HeadMismatch {
                    key,
                    expected: head,
                    found,
                });
            }
        }

        let node = self
            .nodes
            .get(&head)
            .ok_or(DependencyError::StaleIndex(head))?;
        if let Some(&missing) = node.keys.iter().find(|k| !keys.contains(k)) {
            return Err(DependencyError::PartialRelease {
                id: head,
                key: missing,
            });
        }

        let Some(node) = self.nodes.remove(&head) else {
            return Err(DependencyError::StaleIndex(head));
        };
        let mut promoted = Vec::new();

        for key in node.keys {
            match node.successors.get(&key) {
                Some(&next) => {
                    self.heads.insert(key, next);
                    if !promoted.contains(&next) {
                        promoted.push(next);
                    }
                }
                None => {
                    self.heads.remove(&key);
                    self.tails.remove(&key);
                }
            }
        }

        Ok(promoted
            .into_iter()
            .filter(|id| self.heads_all_keys(*id))
            .map(|id| self.nodes[&id].operation.clone())
            .collect())
    }

    /// Whether `id` is currently head on every key it depends on.
    pub fn heads_all_keys(&self, id: OperationId) -> bool {
        self.nodes.get(&id).is_some_and(|node| {
            node.keys
                .iter()
                .all(|key| self.heads.get(key) == Some(&id))
        })
    }

    /// Operation currently at the head of `key`'s chain.
    pub fn head_of(&self, key: &ObjectKey) -> Option<OperationId> {
        self.heads.get(key).copied()
    }

    /// Number of live operations (admitted and not yet released).
    pub fn live(&self) -> usize {
        self.nodes.len()
    }

    /// Check if no operation is live.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of keys with at least one live operation.
    pub fn tracked_keys(&self) -> usize {
        self.heads.len()
    }
}

fn distinct_keys(keys: &[ObjectKey]) -> Vec<ObjectKey> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().copied().filter(|k| seen.insert(*k)).collect()
}
