//! Admission-controlled emitter.
//!
//! Drives a stream of [`Operation`](shardrun_types::Operation)s onto a
//! sharded ledger while keeping per-object order and single ownership:
//!
//! ```text
//!   operations ──► DependencyGraph ──► route ──► lane[p] ──► sign/submit
//!                        ▲               │                       │
//!                        │           migrate (MoveTo ► proof     │
//!                        │           ► header ► Move2)           │
//!                        └──── release ◄── block results ◄───────┘
//! ```
//!
//! Each partition has a lane with three queues (freed, migrated, fresh) and
//! an [`AdmissionWindow`] bounding its outstanding transactions. Every
//! observed block adjusts the window and refills the lane in that priority
//! order.

mod config;
mod emitter;
mod error;
mod lane;
mod scheduler;
mod stats;
mod window;

pub use config::EmitterConfig;
pub use emitter::Emitter;
pub use error::SchedulerError;
pub use stats::{RunReport, SchedulerStats};
pub use window::AdmissionWindow;
