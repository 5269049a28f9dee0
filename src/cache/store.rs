//! Cache Store Module
//!
//! Main cache engine: a concurrent map of items with lazy expiration,
//! optional eviction callbacks, and registration with the shared sweeper.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::item::{deadline, Item, ItemStatus};
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::error::{CacheError, Result};
use crate::tasks::{Reconcile, Reconciled, Registry};

/// Callback invoked with the key and value of an expired or deleted item.
pub type EvictionCallback<K, V> = Arc<dyn Fn(K, V) + Send + Sync + 'static>;

type ItemMap<K, V> = DashMap<K, Arc<Item<V>>>;

/// Shortest delay between two sweeps of the same cache.
const MIN_RESCAN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
enum Removal {
    Expired,
    Deleted,
}

// == Cache ==
/// Concurrent key/value cache with per-item TTL.
///
/// Expired items are removed lazily by whichever reader first notices them,
/// or by the shared sweeper. Cloning a `Cache` yields another handle to the
/// same items.
pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<K, V> {
    id: u64,
    /// Swapped wholesale by `clear`
    items: ArcSwap<ItemMap<K, V>>,
    default_ttl: Duration,
    /// Only touched by the sweeper through `reconcile`
    next_scan: Mutex<Instant>,
    eviction: RwLock<Option<EvictionCallback<K, V>>>,
    stats: StatsRecorder,
    registry: Arc<Registry>,
}

// == Cache Builder ==
/// Configures a [`Cache`] before registering it with a registry.
pub struct CacheBuilder<K, V> {
    default_ttl: Duration,
    eviction: Option<EvictionCallback<K, V>>,
    registry: Option<Arc<Registry>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Sets the callback fired when an item expires or is deleted.
    pub fn eviction<F>(mut self, callback: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.eviction = Some(Arc::new(callback));
        self
    }

    /// Registers the cache with `registry` instead of the global one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Creates the cache and registers it with the sweeper.
    ///
    /// Fails if the default TTL is zero, if the registry has been shut
    /// down, or if the sweeper could not be started.
    pub fn build(self) -> Result<Cache<K, V>> {
        if self.default_ttl.is_zero() {
            return Err(CacheError::InvalidTtl(
                "default TTL must be greater than zero".to_string(),
            ));
        }

        let registry = self.registry.unwrap_or_else(Registry::global);
        let id = registry.next_cache_id();
        let inner = Arc::new(CacheInner {
            id,
            items: ArcSwap::from_pointee(DashMap::new()),
            default_ttl: self.default_ttl,
            next_scan: Mutex::new(rescan_at(Instant::now(), self.default_ttl)),
            eviction: RwLock::new(self.eviction),
            stats: StatsRecorder::default(),
            registry: Arc::clone(&registry),
        });

        let weak: Weak<dyn Reconcile> = Arc::downgrade(&inner) as Weak<dyn Reconcile>;
        registry.register(id, weak)?;

        Ok(Cache { inner })
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructors ==
    /// Creates a cache on the global registry with no eviction callback.
    ///
    /// # Arguments
    /// * `default_ttl` - TTL for `set` and `load_or_store`, and the interval
    ///   at which the sweeper rescans this cache
    pub fn new(default_ttl: Duration) -> Result<Self> {
        Self::builder(default_ttl).build()
    }

    /// Creates a cache on the global registry with an eviction callback.
    pub fn with_eviction<F>(default_ttl: Duration, callback: F) -> Result<Self>
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        Self::builder(default_ttl).eviction(callback).build()
    }

    pub fn builder(default_ttl: Duration) -> CacheBuilder<K, V> {
        CacheBuilder {
            default_ttl,
            eviction: None,
            registry: None,
        }
    }

    // == Get ==
    /// Returns the value for `key` if present and not expired.
    ///
    /// The first caller to observe an expired item removes it and fires the
    /// eviction callback; concurrent callers wait for that removal and then
    /// report a miss. No caller gets the value once its removal has begun.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self.inner.get(key);
        match value {
            Some(_) => self.inner.stats.record_hit(),
            None => self.inner.stats.record_miss(),
        }
        value
    }

    // == Set ==
    /// Stores `value` under `key` with the default TTL.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.inner.default_ttl);
    }

    /// Stores `value` under `key` with an explicit TTL.
    ///
    /// An expired item already under `key` is evicted first (firing the
    /// callback). A live item is overwritten silently.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.inner.get(&key);
        self.inner
            .items
            .load()
            .insert(key, Arc::new(Item::new(value, ttl)));
    }

    // == Load Or Store ==
    /// Returns the live value for `key`, or stores `value` with the default
    /// TTL if there is none.
    ///
    /// The flag is `true` when the value was already present. When many
    /// callers race on the same key exactly one insert wins and every caller
    /// gets the winning value.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        self.inner.load_or_store(key, value)
    }

    // == Delete ==
    /// Removes `key` if it holds a live item, firing the eviction callback.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.delete(key);
    }

    // == Clear ==
    /// Drops every item. No eviction callbacks fire.
    ///
    /// The whole store is replaced at once: a reader that sees one key gone
    /// sees every key stored before the clear gone.
    pub fn clear(&self) {
        self.inner.items.store(Arc::new(DashMap::new()));
        debug!("Cleared cache {}", self.inner.id);
    }

    // == Size ==
    /// Counts live items.
    ///
    /// Every stored key goes through the `get` path, so expired items found
    /// along the way are evicted and their callbacks fire.
    pub fn size(&self) -> usize {
        self.inner
            .keys()
            .into_iter()
            .filter(|key| self.inner.get(key).is_some())
            .count()
    }

    // == Time To Live ==
    /// Returns the time left before `key` expires, or `None` if it is absent
    /// or already expired. Does not evict.
    pub fn ttl_remaining<Q>(&self, key: &Q) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let item = self.inner.load(key)?;
        if item.status() != ItemStatus::Live || item.is_expired_at(Instant::now()) {
            return None;
        }
        Some(item.remaining())
    }

    // == Eviction Callback ==
    /// Replaces the eviction callback.
    pub fn set_eviction_callback<F>(&self, callback: F)
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        *self.inner.eviction.write() = Some(Arc::new(callback));
    }

    /// Removes the eviction callback.
    pub fn remove_eviction_callback(&self) {
        *self.inner.eviction.write() = None;
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn load<Q>(&self, key: &Q) -> Option<Arc<Item<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        // Clone the Arc out so no shard guard is held while removing
        self.items
            .load()
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn keys(&self) -> Vec<K> {
        self.items
            .load()
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let item = self.load(key)?;

        if item.status() == ItemStatus::Live {
            if !item.is_expired_at(Instant::now()) {
                return Some(item.value().clone());
            }
            if item.try_begin_delete() {
                self.remove(key, &item, Removal::Expired);
                return None;
            }
        }

        item.wait_deleted();
        None
    }

    fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        loop {
            if let Some(existing) = self.get(&key) {
                return (existing, true);
            }

            let items = self.items.load();
            let occupied = match items.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Item::new(value.clone(), self.default_ttl)));
                    return (value, false);
                }
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            };

            // Another caller stored first. If its item is already expired or
            // being removed, go round again so `get` settles it.
            if occupied.status() == ItemStatus::Live && !occupied.is_expired_at(Instant::now()) {
                return (occupied.value().clone(), true);
            }
        }
    }

    fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(item) = self.load(key) else {
            return;
        };

        if item.is_expired_at(Instant::now()) {
            // Settled as an expiry, not a delete
            self.get(key);
            return;
        }

        if item.try_begin_delete() {
            self.remove(key, &item, Removal::Deleted);
        } else {
            item.wait_deleted();
        }
    }

    // == Remove ==
    /// Finishes a removal after this caller won `try_begin_delete`.
    ///
    /// The key is only removed if it still maps to `item`; an item already
    /// replaced by `set` or dropped by `clear` is not reported as evicted.
    fn remove<Q>(&self, key: &Q, item: &Arc<Item<V>>, reason: Removal)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self
            .items
            .load()
            .remove_if(key, |_, current| Arc::ptr_eq(current, item));
        item.finish_delete();

        let Some((key, _)) = removed else {
            return;
        };

        match reason {
            Removal::Expired => self.stats.record_expiration(),
            Removal::Deleted => self.stats.record_deletion(),
        }

        let callback = self.eviction.read().clone();
        if let Some(callback) = callback {
            let value = item.value().clone();
            self.registry.dispatch(move || callback(key, value));
        }
    }
}

impl<K, V> Reconcile for CacheInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn reconcile(&self, now: Instant) -> Reconciled {
        let mut next_scan = self.next_scan.lock();
        if *next_scan > now {
            return Reconciled {
                next_scan: *next_scan,
                scanned: false,
            };
        }

        let keys = self.keys();
        let total = keys.len();
        let reclaimed = keys
            .into_iter()
            .filter(|key| self.get(key).is_none())
            .count();
        if reclaimed > 0 {
            debug!(
                "Sweep of cache {}: reclaimed {} of {} entries",
                self.id, reclaimed, total
            );
        }

        *next_scan = rescan_at(Instant::now(), self.default_ttl);
        Reconciled {
            next_scan: *next_scan,
            scanned: true,
        }
    }
}

/// Next sweep deadline for a cache, never sooner than [`MIN_RESCAN_DELAY`].
fn rescan_at(now: Instant, default_ttl: Duration) -> Instant {
    deadline(now, default_ttl.max(MIN_RESCAN_DELAY))
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread::sleep;

    fn test_cache<V>(ttl: Duration) -> (Arc<Registry>, Cache<String, V>)
    where
        V: Clone + Send + Sync + 'static,
    {
        let registry = Registry::new(Config::default());
        let cache = Cache::builder(ttl)
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();
        (registry, cache)
    }

    #[test]
    fn test_store_set_and_get() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));

        cache.set("key1".to_string(), "value1".to_string());

        assert_eq!(cache.get("key1"), Some("value1".to_string()));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_store_get_nonexistent() {
        let (_registry, cache) = test_cache::<u32>(Duration::from_secs(300));
        assert_eq!(cache.get("nonexistent"), None);
    }

    #[test]
    fn test_zero_default_ttl_rejected() {
        let registry = Registry::new(Config::default());
        let result = Cache::<String, u32>::builder(Duration::ZERO)
            .registry(registry)
            .build();
        assert!(matches!(result, Err(CacheError::InvalidTtl(_))));
    }

    #[test]
    fn test_store_overwrite_is_silent() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let (tx, rx) = mpsc::channel();
        cache.set_eviction_callback(move |key: String, value: u32| {
            let _ = tx.send((key, value));
        });

        cache.set("key1".to_string(), 1);
        cache.set("key1".to_string(), 2);

        assert_eq!(cache.get("key1"), Some(2));
        assert_eq!(cache.size(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_store_ttl_expiration() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));

        cache.set_with_ttl("key1".to_string(), 1, Duration::from_millis(100));
        assert_eq!(cache.get("key1"), Some(1));

        sleep(Duration::from_millis(150));

        assert_eq!(cache.get("key1"), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_set_evicts_expired_item_first() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let (tx, rx) = mpsc::channel();
        cache.set_eviction_callback(move |key: String, value: u32| {
            let _ = tx.send((key, value));
        });

        cache.set_with_ttl("key1".to_string(), 1, Duration::from_millis(50));
        sleep(Duration::from_millis(80));
        cache.set("key1".to_string(), 2);

        let evicted = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(evicted, ("key1".to_string(), 1));
        assert_eq!(cache.get("key1"), Some(2));
    }

    #[test]
    fn test_load_or_store() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));

        assert_eq!(cache.load_or_store("key".to_string(), 11), (11, false));
        assert_eq!(cache.load_or_store("key".to_string(), 22), (11, true));
        assert_eq!(cache.get("key"), Some(11));
    }

    #[test]
    fn test_load_or_store_replaces_expired() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));

        cache.set_with_ttl("key".to_string(), 1, Duration::from_millis(50));
        sleep(Duration::from_millis(80));

        assert_eq!(cache.load_or_store("key".to_string(), 2), (2, false));
    }

    #[test]
    fn test_delete_fires_callback_once() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let (tx, rx) = mpsc::channel();
        cache.set_eviction_callback(move |key: String, value: u32| {
            let _ = tx.send((key, value));
        });

        cache.set("key1".to_string(), 7);
        cache.delete("key1");
        cache.delete("key1");

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            ("key1".to_string(), 7)
        );
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(cache.get("key1"), None);
        assert_eq!(cache.stats().deletions, 1);
    }

    #[test]
    fn test_delete_nonexistent_is_noop() {
        let (_registry, cache) = test_cache::<u32>(Duration::from_secs(300));
        cache.delete("nonexistent");
        assert_eq!(cache.stats().deletions, 0);
    }

    #[test]
    fn test_delete_expired_counts_as_expiry() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cache.set_eviction_callback(move |_: String, _: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set_with_ttl("key1".to_string(), 1, Duration::from_millis(50));
        sleep(Duration::from_millis(80));
        cache.delete("key1");

        sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.deletions, 0);
    }

    #[test]
    fn test_clear_does_not_fire_callback() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let (tx, rx) = mpsc::channel();
        cache.set_eviction_callback(move |key: String, value: u32| {
            let _ = tx.send((key, value));
        });

        cache.set("key1".to_string(), 1);
        cache.set("key2".to_string(), 2);
        cache.clear();

        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get("key1"), None);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_clear_is_observed_all_at_once() {
        let (_registry, cache) = test_cache::<u32>(Duration::from_secs(300));
        let keys: Vec<String> = (0..2000).map(|i| format!("key{}", i)).collect();

        for _ in 0..20 {
            for (i, key) in keys.iter().enumerate() {
                cache.set(key.clone(), i as u32);
            }

            std::thread::scope(|scope| {
                let clearer = cache.clone();
                scope.spawn(move || clearer.clear());

                // Once the last key is gone, every earlier key must be gone too
                let last = &keys[keys.len() - 1];
                while cache.inner.get(last.as_str()).is_some() {
                    std::hint::spin_loop();
                }
                for key in &keys {
                    assert_eq!(cache.inner.get(key.as_str()), None, "{} survived clear", key);
                }
            });
        }
    }

    #[test]
    fn test_get_waits_while_item_is_deleting() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        cache.set("key1".to_string(), 9u32);

        let item = cache.inner.load("key1").unwrap();
        assert!(item.try_begin_delete());

        let reader = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.get("key1"))
        };

        sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());

        item.finish_delete();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn test_reconcile_never_rescans_immediately() {
        let (_registry, cache) = test_cache::<u32>(Duration::from_nanos(1));

        let start = Instant::now();
        let reconciled = cache.inner.reconcile(start + Duration::from_millis(5));

        assert!(reconciled.scanned);
        assert!(reconciled.next_scan >= start + MIN_RESCAN_DELAY);
    }

    #[test]
    fn test_size_evicts_expired_entries() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let (tx, rx) = mpsc::channel();
        cache.set_eviction_callback(move |key: String, _: u32| {
            let _ = tx.send(key);
        });

        cache.set_with_ttl("short".to_string(), 1, Duration::from_millis(50));
        cache.set("long".to_string(), 2);
        sleep(Duration::from_millis(80));

        assert_eq!(cache.size(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "short");
        assert_eq!(cache.inner.items.load().len(), 1);
    }

    #[test]
    fn test_replace_and_remove_callback() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        cache.set_eviction_callback(move |_: String, _: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&second);
        cache.set_eviction_callback(move |_: String, _: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set("a".to_string(), 1);
        cache.delete("a");
        sleep(Duration::from_millis(100));

        cache.remove_eviction_callback();
        cache.set("b".to_string(), 2);
        cache.delete("b");
        sleep(Duration::from_millis(100));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_hits_and_misses() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));

        cache.set("key1".to_string(), "value1".to_string());
        cache.get("key1");
        cache.get("nonexistent");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_reconcile_waits_for_next_scan() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        cache.set_with_ttl("key1".to_string(), 1, Duration::from_millis(10));
        sleep(Duration::from_millis(30));

        let before = cache.inner.reconcile(Instant::now());
        assert!(!before.scanned);
        assert_eq!(cache.inner.items.load().len(), 1);

        let later = Instant::now() + Duration::from_secs(301);
        let after = cache.inner.reconcile(later);
        assert!(after.scanned);
        assert!(after.next_scan > Instant::now());
        assert_eq!(cache.inner.items.load().len(), 0);
    }

    #[test]
    fn test_ttl_remaining() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        cache.set_with_ttl("key1".to_string(), 1, Duration::from_secs(10));

        let remaining = cache.ttl_remaining("key1").unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining >= Duration::from_secs(9));
        assert_eq!(cache.ttl_remaining("missing"), None);
    }

    #[test]
    fn test_clones_share_items() {
        let (_registry, cache) = test_cache(Duration::from_secs(300));
        let other = cache.clone();

        cache.set("shared".to_string(), 5);
        assert_eq!(other.get("shared"), Some(5));
    }
}
