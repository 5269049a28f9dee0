//! Expiry Sweeper
//!
//! Background task that periodically reconciles expired items across every
//! registered cache. It sleeps until the earliest cache deadline and is woken
//! early whenever a new cache registers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::tasks::registry::Members;

// == Sweeper Stats ==
/// Snapshot of sweeper activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweeperStats {
    /// Completed passes over all registered caches
    pub cycles: u64,
    /// Sleeps that ended because the deadline elapsed
    pub timer_wakes: u64,
    /// Sleeps cut short by a registration signal
    pub signal_wakes: u64,
    /// Full scans performed across all caches
    pub caches_scanned: u64,
    /// Reconcile calls that panicked and were skipped
    pub reconcile_failures: u64,
    /// Caches currently registered
    pub registered: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SweeperCounters {
    cycles: AtomicU64,
    timer_wakes: AtomicU64,
    signal_wakes: AtomicU64,
    caches_scanned: AtomicU64,
    reconcile_failures: AtomicU64,
}

impl SweeperCounters {
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_wake(&self) {
        self.timer_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_wake(&self) {
        self.signal_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.caches_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, registered: usize) -> SweeperStats {
        SweeperStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            timer_wakes: self.timer_wakes.load(Ordering::Relaxed),
            signal_wakes: self.signal_wakes.load(Ordering::Relaxed),
            caches_scanned: self.caches_scanned.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
            registered,
        }
    }
}

// == Sweeper ==
/// Owns the runtime the sweep loop and eviction callbacks run on.
///
/// Dropping the sweeper signals the loop to stop and shuts the runtime down
/// in the background.
pub(crate) struct Sweeper {
    runtime: Option<Runtime>,
    stop: watch::Sender<bool>,
}

impl Sweeper {
    /// Builds a dedicated runtime and spawns the sweep loop on it.
    ///
    /// # Arguments
    /// * `config` - Sweep interval cap and callback pool size
    /// * `members` - Caches to reconcile, shared with the registry
    pub fn start(config: &Config, members: Arc<Members>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.callback_threads.max(1))
            .thread_name("memory-cache-sweeper")
            .enable_time()
            .build()?;

        let (stop, stop_rx) = watch::channel(false);
        runtime.spawn(run(members, stop_rx));

        info!(
            "Started cache sweeper with max interval of {} seconds",
            config.max_sweep_interval.as_secs()
        );

        Ok(Self {
            runtime: Some(runtime),
            stop,
        })
    }

    pub fn handle(&self) -> Option<Handle> {
        self.runtime.as_ref().map(|runtime| runtime.handle().clone())
    }

    /// Stops the loop and shuts the runtime down.
    ///
    /// Blocking shutdown is not allowed inside an async context, so there
    /// the runtime is released in the background instead.
    pub fn stop(mut self, timeout: Duration) {
        let _ = self.stop.send(true);
        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(timeout);
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// == Sweep Loop ==
async fn run(members: Arc<Members>, mut stop: watch::Receiver<bool>) {
    debug!("Cache sweeper loop running");

    loop {
        let nearest = members.sweep(Instant::now());
        if *stop.borrow() {
            break;
        }

        // Some cache is already due; rescan without consuming a wake permit
        if nearest <= Instant::now() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(nearest)) => {
                members.counters().record_timer_wake();
            }
            _ = members.wake().notified() => {
                members.counters().record_signal_wake();
            }
            _ = stop.changed() => break,
        }
    }

    info!("Cache sweeper stopped");
}
