//! Object placement for the scheduler.
//!
//! - [`Partitioning`]: residency map plus per-partition load, behind one lock
//! - [`PlacementPolicy`]: how a convergence partition is picked for a
//!   multi-partition operation

mod placement;
mod policy;

pub use placement::{home_partition, PartitionError, Partitioning};
pub use policy::PlacementPolicy;
