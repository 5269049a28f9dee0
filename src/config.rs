//! Configuration Module
//!
//! Tuning for the background sweeper and the eviction callback pool, loaded
//! from environment variables.

use std::env;
use std::time::Duration;

/// Sweeper and dispatcher configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on how long the sweeper sleeps between cycles
    pub max_sweep_interval: Duration,
    /// Maximum number of threads running eviction callbacks at once
    pub callback_threads: usize,
    /// How long `Registry::shutdown` waits for in-flight work
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MEMORY_CACHE_MAX_SWEEP_INTERVAL_SECS` - Max sweeper sleep (default: 3600)
    /// - `MEMORY_CACHE_CALLBACK_THREADS` - Eviction callback threads (default: 16)
    /// - `MEMORY_CACHE_SHUTDOWN_TIMEOUT_MS` - Shutdown wait (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_sweep_interval: env::var("MEMORY_CACHE_MAX_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_sweep_interval),
            callback_threads: env::var("MEMORY_CACHE_CALLBACK_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|threads: &usize| *threads > 0)
                .unwrap_or(defaults.callback_threads),
            shutdown_timeout: env::var("MEMORY_CACHE_SHUTDOWN_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sweep_interval: Duration::from_secs(3600),
            callback_threads: 16,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
