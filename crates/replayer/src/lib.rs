//! Harness around the cross-shard emitter.
//!
//! Supplies operation sources and file configuration for the
//! `shardrun-replayer` binary:
//!
//! - [`trace`]: reader for recorded token-contract event traces
//! - [`workload`]: seeded synthetic pair workload with a cross-partition ratio
//! - [`config`]: TOML configuration covering emitter, migration, ledger and workload

pub mod config;
pub mod trace;
pub mod workload;

pub use config::{ConfigError, LedgerSection, ReplayerConfig};
pub use trace::{TraceError, TraceReader};
pub use workload::{SelectionMode, SyntheticWorkload, WorkloadConfig, WorkloadError};
