//! Operations: the unit of work the scheduler admits, routes and sends.

use crate::{ObjectKey, OperationId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger method an operation invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Create a fresh object with no parents.
    Create,
    /// Create an object from two parents (matron, sire).
    Birth,
    /// Pair two existing objects.
    Breed,
    /// Transfer an object to a new owner.
    Transfer,
    /// Transfer on behalf of an approved owner.
    TransferFrom,
    /// Approve another owner to transfer an object.
    Approve,
    /// Approve another owner to breed with an object.
    ApproveSiring,
    /// First cross-shard migration step, submitted on the source partition.
    MoveTo,
    /// Second cross-shard migration step, submitted on the destination partition.
    Move2,
}

impl Method {
    /// Whether executing this method brings a new object into existence.
    pub fn creates_object(self) -> bool {
        matches!(self, Method::Create | Method::Birth)
    }

    /// Whether this is one of the two migration steps.
    pub fn is_move_step(self) -> bool {
        matches!(self, Method::MoveTo | Method::Move2)
    }

    /// Get a human-readable name for this method.
    pub fn name(self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Birth => "birth",
            Method::Breed => "breed",
            Method::Transfer => "transfer",
            Method::TransferFrom => "transferFrom",
            Method::Approve => "approve",
            Method::ApproveSiring => "approveSiring",
            Method::MoveTo => "moveTo",
            Method::Move2 => "move2",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of work produced by an operation source.
///
/// `keys` lists the objects the operation depends on, in order (1 to 3).
/// For creating methods, `creates` names the logical key of the object that
/// will exist once the operation executes; that key is also the last entry of
/// `keys` so that later operations on the new object queue behind its creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Identifier assigned by the source.
    pub id: OperationId,

    /// Method to invoke.
    pub method: Method,

    /// Objects this operation depends on.
    pub keys: Vec<ObjectKey>,

    /// Logical key of the object created by this operation, if any.
    pub creates: Option<ObjectKey>,

    /// Method-specific arguments, opaque to the scheduler.
    pub args: Vec<u8>,
}

impl Operation {
    /// Create an operation that does not create an object.
    pub fn new(id: OperationId, method: Method, keys: Vec<ObjectKey>) -> Self {
        debug_assert!(!keys.is_empty(), "operation must depend on at least one key");
        Self {
            id,
            method,
            keys,
            creates: None,
            args: Vec::new(),
        }
    }

    /// Create an operation that brings `created` into existence.
    ///
    /// `parents` are the existing objects it depends on; `created` is
    /// appended as the final dependency key.
    pub fn creating(
        id: OperationId,
        method: Method,
        parents: Vec<ObjectKey>,
        created: ObjectKey,
    ) -> Self {
        let mut keys = parents;
        keys.push(created);
        Self {
            id,
            method,
            keys,
            creates: Some(created),
            args: Vec::new(),
        }
    }

    /// Attach method-specific arguments.
    pub fn with_args(mut self, args: Vec<u8>) -> Self {
        self.args = args;
        self
    }

    /// Keys that refer to objects that already exist (everything except `creates`).
    pub fn existing_keys(&self) -> impl Iterator<Item = &ObjectKey> + '_ {
        self.keys
            .iter()
            .filter(move |key| Some(**key) != self.creates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creating_appends_new_key_last() {
        let op = Operation::creating(
            OperationId(1),
            Method::Birth,
            vec![ObjectKey::Id(3), ObjectKey::Id(4)],
            ObjectKey::Id(9),
        );
        assert_eq!(op.keys.last(), Some(&ObjectKey::Id(9)));
        let existing: Vec<_> = op.existing_keys().copied().collect();
        assert_eq!(existing, vec![ObjectKey::Id(3), ObjectKey::Id(4)]);
    }

    #[test]
    fn test_method_classification() {
        assert!(Method::Birth.creates_object());
        assert!(!Method::Breed.creates_object());
        assert!(Method::Move2.is_move_step());
        assert!(!Method::Transfer.is_move_step());
    }
}
