//! Per-proxy performance counters with time decay.
//!
//! Every completed attempt is fed back through [`StatsStore::record_result`].
//! Each call bumps a monotonic version that the ranker uses to invalidate its
//! cached ordering. State is persisted through the [`KvStore`] contract after
//! every update; persistence failures are logged and otherwise ignored.

use crate::config::StatsConfig;
use crate::storage::KvStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Key under which the stats map is persisted.
pub const STATS_KEY: &str = "proxy_stats";

/// Counters for one proxy. Serialized with camelCase keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyStats {
    pub success: u64,
    pub fail: u64,
    /// Epoch milliseconds of the last success, 0 if never.
    pub last_success_time: i64,
    /// Sum of successful response times in milliseconds.
    pub total_response_time: u64,
    /// `total_response_time / success`, milliseconds.
    pub avg_response_time: f64,
}

impl ProxyStats {
    pub fn samples(&self) -> u64 {
        self.success + self.fail
    }

    /// Applies one outcome, then decays if the sample cap is exceeded.
    fn record(&mut self, success: bool, response_time_ms: u64, now_ms: i64, config: &StatsConfig) {
        if success {
            self.success += 1;
            self.last_success_time = now_ms;
            self.total_response_time += response_time_ms;
            self.avg_response_time = self.total_response_time as f64 / self.success as f64;
        } else {
            self.fail += 1;
        }

        if self.samples() > config.decay_cap {
            let scale = |value: u64| (value as f64 * config.decay_factor).floor() as u64;
            self.success = scale(self.success);
            self.fail = scale(self.fail);
            self.total_response_time = scale(self.total_response_time);
        }
    }
}

#[derive(Debug, Default)]
struct StatsState {
    stats: HashMap<String, ProxyStats>,
    version: u64,
}

/// Shared, durable stats for every proxy.
pub struct StatsStore {
    state: Mutex<StatsState>,
    store: Arc<dyn KvStore>,
    config: RwLock<StatsConfig>,
}

impl StatsStore {
    /// Loads persisted stats. Missing or corrupt records start empty.
    pub fn load(store: Arc<dyn KvStore>, config: StatsConfig) -> Self {
        let stats = match store.get(STATS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, ProxyStats>>(&raw) {
                Ok(stats) => {
                    debug!(proxies = stats.len(), "Loaded proxy stats");
                    stats
                }
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable proxy stats");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load proxy stats");
                HashMap::new()
            }
        };

        Self {
            state: Mutex::new(StatsState { stats, version: 0 }),
            store,
            config: RwLock::new(config),
        }
    }

    /// Replaces the decay parameters (config reload).
    pub fn set_config(&self, config: StatsConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Records the outcome of one attempt against `name`.
    pub fn record_result(&self, name: &str, success: bool, response_time_ms: u64) {
        let config = *self.config.read().unwrap_or_else(|p| p.into_inner());
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let entry = state.stats.entry(name.to_string()).or_default();
        entry.record(success, response_time_ms, now_ms, &config);
        trace!(
            proxy = %name,
            success = success,
            response_time_ms = response_time_ms,
            successes = entry.success,
            failures = entry.fail,
            "Recorded proxy result"
        );
        state.version += 1;

        self.persist(&state.stats);
    }

    /// Stats for one proxy, if any were recorded.
    pub fn get(&self, name: &str) -> Option<ProxyStats> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.stats.get(name).cloned()
    }

    /// Copy of all stats together with the version they belong to.
    pub fn snapshot(&self) -> (u64, HashMap<String, ProxyStats>) {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        (state.version, state.stats.clone())
    }

    /// Monotonic counter bumped by every update.
    pub fn version(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).version
    }

    /// Forgets every recorded outcome.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.stats.clear();
        state.version += 1;
        self.persist(&state.stats);
    }

    fn persist(&self, stats: &HashMap<String, ProxyStats>) {
        let serialized = match serde_json::to_string(stats) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize proxy stats");
                return;
            }
        };
        if let Err(e) = self.store.set(STATS_KEY, &serialized) {
            warn!(error = %e, "Failed to persist proxy stats, keeping in memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, Result};
    use crate::storage::MemoryStore;

    struct FailingStore;

    impl KvStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(FetchError::storage("unavailable"))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(FetchError::storage("unavailable"))
        }
    }

    fn store() -> StatsStore {
        StatsStore::load(Arc::new(MemoryStore::new()), StatsConfig::default())
    }

    #[test]
    fn test_average_response_time() {
        let stats = store();
        stats.record_result("a", true, 100);
        stats.record_result("a", true, 300);

        let a = stats.get("a").unwrap();
        assert_eq!(a.success, 2);
        assert_eq!(a.total_response_time, 400);
        assert_eq!(a.avg_response_time, 200.0);
        assert!(a.last_success_time > 0);
    }

    #[test]
    fn test_failures_do_not_touch_average() {
        let stats = store();
        stats.record_result("a", true, 100);
        stats.record_result("a", false, 9000);

        let a = stats.get("a").unwrap();
        assert_eq!(a.fail, 1);
        assert_eq!(a.avg_response_time, 100.0);
        assert_eq!(a.total_response_time, 100);
    }

    #[test]
    fn test_decay_after_cap() {
        let stats = store();
        for _ in 0..60 {
            stats.record_result("a", true, 100);
        }
        for _ in 0..40 {
            stats.record_result("a", false, 0);
        }

        let before = stats.get("a").unwrap();
        assert_eq!(before.samples(), 100);

        stats.record_result("a", false, 0);
        let after = stats.get("a").unwrap();
        assert_eq!(after.success, 48);
        assert_eq!(after.fail, 32);
        assert_eq!(after.total_response_time, 4800);
    }

    #[test]
    fn test_version_increments() {
        let stats = store();
        assert_eq!(stats.version(), 0);
        stats.record_result("a", true, 10);
        stats.record_result("b", false, 10);
        assert_eq!(stats.version(), 2);
    }

    #[test]
    fn test_persist_and_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let stats = StatsStore::load(kv.clone(), StatsConfig::default());
        stats.record_result("a", true, 120);

        let raw = kv.get(STATS_KEY).unwrap().unwrap();
        assert!(raw.contains("lastSuccessTime"));
        assert!(raw.contains("avgResponseTime"));

        let reloaded = StatsStore::load(kv, StatsConfig::default());
        assert_eq!(reloaded.get("a").unwrap().success, 1);
    }

    #[test]
    fn test_persistence_failure_is_silent() {
        let stats = StatsStore::load(Arc::new(FailingStore), StatsConfig::default());
        stats.record_result("a", true, 50);
        assert_eq!(stats.get("a").unwrap().success, 1);
    }

    #[test]
    fn test_reset() {
        let stats = store();
        stats.record_result("a", true, 50);
        stats.reset();
        assert!(stats.get("a").is_none());
        assert_eq!(stats.version(), 2);
    }
}
