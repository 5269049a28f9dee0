//! Cache Item Module
//!
//! A single cached value with its deadline and the deletion status used to
//! pick exactly one remover when several threads notice the same expiry.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Busy-spin iterations before a waiting reader starts yielding its thread.
const SPIN_LIMIT: u32 = 64;

/// Deadline used when `now + ttl` does not fit in an `Instant` (~30 years).
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

// == Item Status ==
/// Deletion status of an item. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemStatus {
    Live = 0,
    Deleting = 1,
    Deleted = 2,
}

impl ItemStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ItemStatus::Live,
            1 => ItemStatus::Deleting,
            _ => ItemStatus::Deleted,
        }
    }
}

// == Item ==
/// Represents a single cache entry with value and expiration.
#[derive(Debug)]
pub struct Item<V> {
    /// The stored value
    value: V,
    /// Absolute expiry instant
    expires_at: Instant,
    status: AtomicU8,
}

impl<V> Item<V> {
    // == Constructor ==
    /// Creates a live item expiring `ttl` from now.
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: deadline(Instant::now(), ttl),
            status: AtomicU8::new(ItemStatus::Live as u8),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    // == Is Expired ==
    /// Checks whether the item is expired at `now`.
    ///
    /// An item is live only while its expiration is strictly in the future,
    /// so it is expired at the exact deadline instant.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn status(&self) -> ItemStatus {
        ItemStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    // == State Transitions ==
    /// Attempts the Live -> Deleting transition.
    ///
    /// Returns `true` for exactly one caller; that caller must remove the
    /// item and then call [`Item::finish_delete`].
    pub fn try_begin_delete(&self) -> bool {
        self.status
            .compare_exchange(
                ItemStatus::Live as u8,
                ItemStatus::Deleting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the item as fully removed, releasing any waiting readers.
    pub fn finish_delete(&self) {
        self.status.store(ItemStatus::Deleted as u8, Ordering::Release);
    }

    /// Blocks until the item reaches `Deleted`.
    ///
    /// The window is a map removal plus one atomic store, so this spins
    /// briefly and then yields rather than parking.
    pub fn wait_deleted(&self) {
        let mut spins = 0;
        while self.status() != ItemStatus::Deleted {
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

// == Utility Functions ==
/// Returns `now + ttl`, saturating to a far-future instant on overflow.
pub fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
