//! Cross-partition migration.
//!
//! An object moves between partitions in two ledger-visible steps: a release
//! (`MoveTo`) on the source and an accept (`Move2`) on the destination. In
//! between, a proof of the released state is fetched and the signed header at
//! the proof height awaited.
//!
//! - [`Migrations`]: synchronous per-object state machine owned by the emitter
//! - [`HeaderRegistry`]: `(partition, height)` wait-registry fed by header listeners
//! - [`FinalityDriver`]: async task per attempt that gathers proof and header

mod config;
mod driver;
mod registry;
mod state;

pub use config::MigrationConfig;
pub use driver::FinalityDriver;
pub use registry::HeaderRegistry;
pub use state::{
    MigrationError, MigrationRecord, MigrationState, Migrations, Move2Outcome, MoveToOutcome,
};
