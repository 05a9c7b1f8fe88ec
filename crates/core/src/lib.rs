//! Core contracts for the cross-shard scheduler.
//!
//! - [`Ledger`]: the external collaborator that signs, broadcasts and reports
//! - [`LedgerError`]: its error taxonomy (transient vs. permanent)
//! - [`SchedulerEvent`]: everything concurrent tasks report to the emitter

mod error;
mod message;
mod traits;

pub use error::LedgerError;
pub use message::SchedulerEvent;
pub use traits::Ledger;
