//! Simulated sharded ledger.
//!
//! An in-process implementation of [`shardrun_core::Ledger`] used by the
//! end-to-end tests and by the harness binary when no real endpoints are
//! configured.
//!
//! ```text
//! sign ──► signed txs ──► submit ──► mempool[p] ──► produce_block(p)
//!                                                      │
//!                               ┌──────────────────────┼────────────────┐
//!                               ▼                      ▼                ▼
//!                        ownership map          block results    header H-1
//!                     (resident / in transit)    broadcast[p]    broadcast[p]
//! ```

mod config;
mod ledger;

pub use config::{Faults, SimulationConfig};
pub use ledger::{Residency, SimulatedLedger};
