//! Memory Cache - An embeddable in-process TTL cache
//!
//! Provides a generic concurrent key/value cache with per-key TTL, lazy
//! expiration that evicts each item exactly once, optional eviction
//! callbacks, and atomic integer counters. One background sweeper per
//! registry reclaims expired items across every cache.
//!
//! ```no_run
//! use std::time::Duration;
//! use memory_cache::Cache;
//!
//! let cache = Cache::with_eviction(Duration::from_secs(60), |key: String, value: u64| {
//!     println!("evicted {key} = {value}");
//! })?;
//! cache.set("answer".to_string(), 42);
//! assert_eq!(cache.get("answer"), Some(42));
//! # Ok::<(), memory_cache::CacheError>(())
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{Cache, CacheBuilder, CacheStats, CellKind, CounterCache, Delta, IntCell};
pub use config::Config;
pub use error::{CacheError, Result};
pub use tasks::{Registry, SweeperStats};
