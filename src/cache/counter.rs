//! Counter Cache Module
//!
//! A cache whose values are shared atomic integer cells, supporting
//! increments that never lose or double-apply a delta under contention.

use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cache::store::Cache;
use crate::error::{CacheError, Result};

// == Cell Kind ==
/// Integer width a counter cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    I32,
    I64,
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::I32 => write!(f, "i32"),
            CellKind::I64 => write!(f, "i64"),
        }
    }
}

// == Delta ==
/// Amount to add to a counter, tagged with its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    I32(i32),
    I64(i64),
}

impl Delta {
    pub fn kind(&self) -> CellKind {
        match self {
            Delta::I32(_) => CellKind::I32,
            Delta::I64(_) => CellKind::I64,
        }
    }

    /// Negates with wrapping, matching the overflow behaviour of the atomics.
    pub fn wrapping_neg(self) -> Self {
        match self {
            Delta::I32(n) => Delta::I32(n.wrapping_neg()),
            Delta::I64(n) => Delta::I64(n.wrapping_neg()),
        }
    }
}

impl From<i32> for Delta {
    fn from(n: i32) -> Self {
        Delta::I32(n)
    }
}

impl From<i64> for Delta {
    fn from(n: i64) -> Self {
        Delta::I64(n)
    }
}

// == Int Cell ==
/// Shared mutable integer. Clones point at the same cell.
#[derive(Debug, Clone)]
pub enum IntCell {
    I32(Arc<AtomicI32>),
    I64(Arc<AtomicI64>),
}

impl IntCell {
    /// Creates a cell holding `initial`.
    pub fn new(initial: Delta) -> Self {
        match initial {
            Delta::I32(n) => IntCell::I32(Arc::new(AtomicI32::new(n))),
            Delta::I64(n) => IntCell::I64(Arc::new(AtomicI64::new(n))),
        }
    }

    pub fn kind(&self) -> CellKind {
        match self {
            IntCell::I32(_) => CellKind::I32,
            IntCell::I64(_) => CellKind::I64,
        }
    }

    /// Current value, widened to `i64`.
    pub fn get(&self) -> i64 {
        match self {
            IntCell::I32(cell) => i64::from(cell.load(Ordering::SeqCst)),
            IntCell::I64(cell) => cell.load(Ordering::SeqCst),
        }
    }

    /// Atomically adds `delta` and returns the new value.
    ///
    /// Fails with [`CacheError::KindMismatch`] if the widths differ.
    pub fn fetch_add(&self, delta: Delta) -> Result<i64> {
        match (self, delta) {
            (IntCell::I32(cell), Delta::I32(n)) => {
                Ok(i64::from(cell.fetch_add(n, Ordering::SeqCst).wrapping_add(n)))
            }
            (IntCell::I64(cell), Delta::I64(n)) => {
                Ok(cell.fetch_add(n, Ordering::SeqCst).wrapping_add(n))
            }
            _ => Err(CacheError::KindMismatch {
                expected: self.kind(),
                found: delta.kind(),
            }),
        }
    }

    /// Returns true if both handles point at the same cell.
    pub fn ptr_eq(&self, other: &IntCell) -> bool {
        match (self, other) {
            (IntCell::I32(a), IntCell::I32(b)) => Arc::ptr_eq(a, b),
            (IntCell::I64(a), IntCell::I64(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// == Counter Cache ==
/// Cache of integer cells of a single width.
///
/// Dereferences to the underlying [`Cache`] for `get`, `delete`, `clear`
/// and the other ordinary operations.
pub struct CounterCache<K> {
    cache: Cache<K, IntCell>,
    kind: CellKind,
}

impl<K> Clone for CounterCache<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            kind: self.kind,
        }
    }
}

impl<K> CounterCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates a counter cache on the global registry.
    pub fn new(kind: CellKind, default_ttl: Duration) -> Result<Self> {
        Ok(Self::from_cache(Cache::new(default_ttl)?, kind))
    }

    /// Wraps an existing cache, e.g. one built on a dedicated registry.
    pub fn from_cache(cache: Cache<K, IntCell>, kind: CellKind) -> Self {
        Self { cache, kind }
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    // == Increment ==
    /// Adds `delta` to the cell under `key`, creating it if absent.
    ///
    /// Returns the shared cell. The first writer's cell starts at its own
    /// delta; every later writer adds onto that same cell, so concurrent
    /// deltas sum exactly.
    ///
    /// # Arguments
    /// * `key` - Counter key
    /// * `delta` - `i32` or `i64` amount, which must match the cache width
    pub fn incr(&self, key: K, delta: impl Into<Delta>) -> Result<IntCell> {
        self.apply(key, delta.into())
    }

    // == Decrement ==
    /// Subtracts `delta`; equivalent to `incr` with the negated amount.
    pub fn decr(&self, key: K, delta: impl Into<Delta>) -> Result<IntCell> {
        self.apply(key, delta.into().wrapping_neg())
    }

    fn apply(&self, key: K, delta: Delta) -> Result<IntCell> {
        if delta.kind() != self.kind {
            return Err(CacheError::KindMismatch {
                expected: self.kind,
                found: delta.kind(),
            });
        }

        let (cell, present) = self.cache.load_or_store(key, IntCell::new(delta));
        if !present {
            return Ok(cell);
        }

        if cell.kind() != self.kind {
            // A foreign cell was stored through the plain cache API
            return Err(CacheError::KindMismatch {
                expected: self.kind,
                found: cell.kind(),
            });
        }

        cell.fetch_add(delta)?;
        Ok(cell)
    }
}

impl<K> Deref for CounterCache<K> {
    type Target = Cache<K, IntCell>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}
