//! Cache Module
//!
//! Provides the concurrent TTL cache, its per-item expiry state machine and
//! the integer counter specialization.

mod counter;
mod item;
mod stats;
mod store;


// Re-export public types
pub use counter::{CellKind, CounterCache, Delta, IntCell};
pub use stats::CacheStats;
pub use store::{Cache, CacheBuilder, EvictionCallback};

pub(crate) use item::deadline;
