//! Background Tasks Module
//!
//! Contains the process-wide cache registry and the sweeper it runs.
//!
//! # Tasks
//! - Expiry sweep: reconciles expired items across all caches, sleeping until
//!   the nearest cache deadline

mod registry;
mod sweeper;

pub(crate) use registry::{Reconcile, Reconciled};
pub use registry::Registry;
pub use sweeper::SweeperStats;
