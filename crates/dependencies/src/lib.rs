//! Dependency tracking for the scheduler.
//!
//! [`DependencyGraph`] keeps one FIFO chain per object key. An operation is
//! released for sending only when it heads the chain of every key it touches;
//! completing it promotes its successors.

mod graph;

pub use graph::{DependencyError, DependencyGraph};
