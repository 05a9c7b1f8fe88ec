//! Operation builders keyed by plain integers.

use shardrun_types::{Method, ObjectKey, Operation, OperationId};

/// Integer object key.
pub fn key(id: u64) -> ObjectKey {
    ObjectKey::Id(id)
}

/// An operation of `method` over integer `keys`.
pub fn op(id: u64, method: Method, keys: &[u64]) -> Operation {
    Operation::new(
        OperationId(id),
        method,
        keys.iter().copied().map(ObjectKey::Id).collect(),
    )
}

/// Single-object transfer.
pub fn transfer(id: u64, token: u64) -> Operation {
    op(id, Method::Transfer, &[token])
}

/// Two-object breed.
pub fn breed(id: u64, matron: u64, sire: u64) -> Operation {
    op(id, Method::Breed, &[matron, sire])
}

/// Creation of `kitty` with no parents.
pub fn create(id: u64, kitty: u64) -> Operation {
    Operation::creating(OperationId(id), Method::Create, Vec::new(), key(kitty))
}

/// Birth of `kitty` from `matron` and `sire`.
pub fn birth(id: u64, matron: u64, sire: u64, kitty: u64) -> Operation {
    Operation::creating(
        OperationId(id),
        Method::Birth,
        vec![key(matron), key(sire)],
        key(kitty),
    )
}
