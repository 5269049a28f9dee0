//! Cache Registry
//!
//! Process-wide service object that tracks every live cache, owns the single
//! background sweeper, and dispatches eviction callbacks off the caller's
//! thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::deadline;
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::tasks::sweeper::{Sweeper, SweeperCounters, SweeperStats};

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

// == Reconcile ==
/// Result of asking one cache to reconcile its expired items.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reconciled {
    /// When this cache next wants to be scanned
    pub next_scan: Instant,
    /// Whether a full scan ran during this call
    pub scanned: bool,
}

/// Implemented by caches so the sweeper can drive their expiry scans
/// without knowing their key or value types.
pub(crate) trait Reconcile: Send + Sync {
    fn reconcile(&self, now: Instant) -> Reconciled;
}

#[derive(Clone)]
struct Member {
    id: u64,
    cache: Weak<dyn Reconcile>,
}

// == Members ==
/// State shared between the registry and its sweeper task.
pub(crate) struct Members {
    caches: Mutex<Vec<Member>>,
    wake: Notify,
    counters: SweeperCounters,
    config: Config,
}

impl Members {
    fn new(config: Config) -> Self {
        Self {
            caches: Mutex::new(Vec::new()),
            wake: Notify::new(),
            counters: SweeperCounters::default(),
            config,
        }
    }

    pub fn wake(&self) -> &Notify {
        &self.wake
    }

    pub fn counters(&self) -> &SweeperCounters {
        &self.counters
    }

    fn add(&self, id: u64, cache: Weak<dyn Reconcile>) {
        self.caches.lock().push(Member { id, cache });
    }

    fn len(&self) -> usize {
        self.caches.lock().len()
    }

    // == Sweep ==
    /// Reconciles every registered cache and returns the earliest instant
    /// any of them wants to be scanned again, capped by the max interval.
    ///
    /// A panic while reconciling one cache is logged and skipped; the
    /// remaining caches are still reconciled. The member list is not locked
    /// while reconciling, so registrations never wait on a sweep.
    pub fn sweep(&self, now: Instant) -> Instant {
        let snapshot = {
            let mut caches = self.caches.lock();
            let before = caches.len();
            caches.retain(|member| member.cache.strong_count() > 0);
            if caches.len() < before {
                debug!("Sweeper pruned {} dropped caches", before - caches.len());
            }
            caches.clone()
        };

        let mut nearest = deadline(now, self.config.max_sweep_interval);
        for member in &snapshot {
            let Some(cache) = member.cache.upgrade() else {
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| cache.reconcile(now))) {
                Ok(reconciled) => {
                    if reconciled.scanned {
                        self.counters.record_scan();
                    }
                    nearest = nearest.min(reconciled.next_scan);
                }
                Err(_) => {
                    self.counters.record_failure();
                    error!(
                        "Reconcile of cache {} panicked; continuing with remaining caches",
                        member.id
                    );
                }
            }
        }

        self.counters.record_cycle();
        nearest
    }
}

enum SweeperSlot {
    Idle,
    Running(Sweeper),
    Stopped,
}

// == Registry ==
/// Tracks caches and runs the shared sweeper that expires their items.
///
/// Most callers use [`Registry::global`] implicitly through
/// [`Cache::new`](crate::Cache::new). Separate registries are useful when a
/// component wants its own sweeper that it can shut down independently.
pub struct Registry {
    members: Arc<Members>,
    sweeper: Mutex<SweeperSlot>,
    shut_down: AtomicBool,
    next_id: AtomicU64,
}

impl Registry {
    // == Constructor ==
    /// Creates an empty registry. The sweeper starts with the first cache.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            members: Arc::new(Members::new(config)),
            sweeper: Mutex::new(SweeperSlot::Idle),
            shut_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    /// Returns the process-wide registry, configured from the environment
    /// on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Registry::new(Config::from_env())))
    }

    pub fn config(&self) -> &Config {
        &self.members.config
    }

    pub(crate) fn next_cache_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // == Register ==
    /// Adds a cache to the sweep set, starting the sweeper if this is the
    /// first cache, and wakes the sweeper so it can reschedule.
    pub(crate) fn register(&self, id: u64, cache: Weak<dyn Reconcile>) -> Result<()> {
        let mut slot = self.sweeper.lock();
        if matches!(*slot, SweeperSlot::Stopped) {
            return Err(CacheError::RegistryShutdown);
        }
        if matches!(*slot, SweeperSlot::Idle) {
            let sweeper = Sweeper::start(self.config(), Arc::clone(&self.members))?;
            *slot = SweeperSlot::Running(sweeper);
        }

        self.members.add(id, cache);
        // Stores at most one permit, so repeated raises coalesce
        self.members.wake.notify_one();
        debug!("Registered cache {}", id);
        Ok(())
    }

    // == Dispatch ==
    /// Runs an eviction callback without blocking the caller.
    ///
    /// Jobs go to the sweeper's blocking pool while it runs. The slot lock is
    /// held across the spawn, so `shutdown` cannot stop the runtime between
    /// the check and the spawn.
    pub(crate) fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self.sweeper.lock();
        let handle: Option<Handle> = match &*slot {
            SweeperSlot::Running(sweeper) => sweeper.handle(),
            _ => None,
        };
        if let Some(handle) = handle {
            handle.spawn_blocking(job);
            return;
        }
        drop(slot);

        debug!("Sweeper runtime unavailable, running eviction callback on a new thread");
        if let Err(err) = std::thread::Builder::new()
            .name("memory-cache-eviction".to_string())
            .spawn(job)
        {
            error!("Failed to spawn eviction callback thread: {}", err);
        }
    }

    // == Shutdown ==
    /// Stops the sweeper. Registered caches keep working with lazy
    /// expiration only; new caches can no longer be registered.
    ///
    /// Outside an async context this waits up to `Config::shutdown_timeout`
    /// for the sweeper and running callbacks to finish.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.sweeper.lock(), SweeperSlot::Stopped);
        self.shut_down.store(true, Ordering::Release);

        match previous {
            SweeperSlot::Running(sweeper) => {
                info!("Shutting down cache sweeper");
                sweeper.stop(self.config().shutdown_timeout);
            }
            SweeperSlot::Idle => debug!("Registry shut down before any cache was registered"),
            SweeperSlot::Stopped => warn!("Registry already shut down"),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Returns a snapshot of sweeper activity.
    pub fn stats(&self) -> SweeperStats {
        self.members.counters.snapshot(self.members.len())
    }
}
