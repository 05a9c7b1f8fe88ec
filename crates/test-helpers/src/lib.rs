//! Shared test fixtures.
//!
//! - [`ops`]: terse builders for workload operations
//! - [`StubLedger`]: a [`shardrun_core::Ledger`] that records what it is asked
//!   to do and answers proof requests from a script

pub mod ops;
mod stub;

pub use stub::StubLedger;
