//! Top-level fetch orchestration.
//!
//! [`RelayFetcher`] owns every piece of shared state (stats, ranking cache,
//! admission pool) and drives one logical fetch through:
//!
//! ```text
//! INIT -> DIRECT_PROBE? -> HEDGE_RACE -> FAILOVER_SCAN -> SUCCESS | EXHAUSTED
//! ```
//!
//! There is no retry beyond one scan of the ranking per call. Pollers simply
//! call again on their next cycle, which picks up the updated stats.

use crate::catalog::{ProxyCatalog, ProxyDescriptor};
use crate::config::AppConfig;
use crate::error::{FetchError, Result};
use crate::executor::{FetchExecutor, FetchMode, Payload, ReqwestTransport, Transport};
use crate::hedge::{AttemptReport, HedgeController, HedgeOutcome};
use crate::pool::ConcurrencyPool;
use crate::ranker::{RankContext, Ranker};
use crate::stats::StatsStore;
use crate::storage::{self, FileStore, KvStore, MemoryStore};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub mode: FetchMode,
    /// Per-attempt timeout. Defaults to `fetch.default_timeout_ms`.
    pub timeout: Option<Duration>,
    /// External cancellation of the whole logical fetch.
    pub cancel: Option<CancellationToken>,
    /// Only try the top-ranked candidate, without hedging.
    pub quick: bool,
}

impl FetchOptions {
    pub fn json() -> Self {
        Self::default()
    }

    pub fn text() -> Self {
        Self {
            mode: FetchMode::Text,
            ..Default::default()
        }
    }

    pub fn binary() -> Self {
        Self {
            mode: FetchMode::Binary,
            ..Default::default()
        }
    }

    pub fn quick(mut self) -> Self {
        self.quick = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Resilient multi-relay fetcher.
pub struct RelayFetcher {
    config: Arc<RwLock<AppConfig>>,
    catalog: Arc<ProxyCatalog>,
    stats: Arc<StatsStore>,
    ranker: Ranker,
    pool: ConcurrencyPool,
    executor: FetchExecutor,
    mainland_user: AtomicBool,
}

impl RelayFetcher {
    /// Creates a fetcher with the storage backend from config and a reqwest
    /// transport.
    pub fn new(config: Arc<RwLock<AppConfig>>) -> Result<Self> {
        let (storage_path, user_agent) = {
            let cfg = config.read().unwrap_or_else(|p| p.into_inner());
            (cfg.storage.path.clone(), cfg.fetch.user_agent.clone())
        };

        let store: Arc<dyn KvStore> = match storage_path {
            Some(path) => {
                let store = FileStore::open(path);
                info!(path = %store.path().display(), "Using file-backed proxy stats");
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let transport = Arc::new(ReqwestTransport::new(&user_agent)?);

        Self::with_parts(config, store, transport)
    }

    /// Creates a fetcher from explicit storage and transport.
    pub fn with_parts(
        config: Arc<RwLock<AppConfig>>,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let cfg = config.read().unwrap_or_else(|p| p.into_inner()).clone();

        let catalog = Arc::new(cfg.catalog()?);
        if catalog.is_empty() {
            return Err(FetchError::config_validation("No proxies configured"));
        }

        let stats = Arc::new(StatsStore::load(store.clone(), cfg.stats));
        let ranker = Ranker::new(catalog.clone(), stats.clone(), cfg.scoring.clone());
        let pool = ConcurrencyPool::new(
            cfg.fetch.max_concurrent_per_proxy,
            cfg.fetch.queue_timeout(),
        );
        let device_id = storage::device_id(store.as_ref());
        let executor = FetchExecutor::new(catalog.clone(), stats.clone(), transport, device_id);
        let mainland_user = cfg.region.is_mainland_user();

        debug!(
            proxies = catalog.len(),
            mainland_user = mainland_user,
            "Relay fetcher ready"
        );

        Ok(Self {
            config,
            catalog,
            stats,
            ranker,
            pool,
            executor,
            mainland_user: AtomicBool::new(mainland_user),
        })
    }

    /// Applies the current configuration (called on config reload).
    pub fn refresh(&self) {
        let cfg = self.settings();
        self.stats.set_config(cfg.stats);
        self.ranker.set_config(cfg.scoring.clone());
        self.pool
            .set_limits(cfg.fetch.max_concurrent_per_proxy, cfg.fetch.queue_timeout());
        self.mainland_user
            .store(cfg.region.is_mainland_user(), Ordering::Relaxed);
        debug!("Relay fetcher refreshed from configuration");
    }

    pub fn catalog(&self) -> &ProxyCatalog {
        &self.catalog
    }

    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    pub fn ranker(&self) -> &Ranker {
        &self.ranker
    }

    pub fn pool(&self) -> &ConcurrencyPool {
        &self.pool
    }

    pub fn device_id(&self) -> &str {
        self.executor.device_id()
    }

    fn settings(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Ranking context for a target URL.
    pub fn rank_context(&self, target: &str) -> RankContext {
        let cfg = self.config.read().unwrap_or_else(|p| p.into_inner());
        RankContext {
            is_mainland_user: self.mainland_user.load(Ordering::Relaxed),
            is_domestic_target: cfg.direct.is_domestic_target(target),
        }
    }

    /// JSON fetch with hedging and full failover.
    pub async fn fetch_with_proxy(&self, target: &str) -> Option<Value> {
        self.fetch(target, FetchOptions::json())
            .await
            .and_then(Payload::into_json)
    }

    /// Text fetch with hedging and full failover.
    pub async fn fetch_text_with_proxy(&self, target: &str) -> Option<String> {
        self.fetch(target, FetchOptions::text())
            .await
            .and_then(Payload::into_text)
    }

    /// Single attempt against the top-ranked relay.
    pub async fn fetch_quick(&self, target: &str, mode: FetchMode) -> Option<Payload> {
        self.fetch(
            target,
            FetchOptions {
                mode,
                ..Default::default()
            }
            .quick(),
        )
        .await
    }

    /// Fetches `target`, collapsing every failure into `None`.
    pub async fn fetch(&self, target: &str, options: FetchOptions) -> Option<Payload> {
        match self.try_fetch(target, options).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(target = %target, error = %e, "Fetch gave up");
                None
            }
        }
    }

    /// Fetches `target`, reporting why it failed.
    pub async fn try_fetch(&self, target: &str, options: FetchOptions) -> Result<Payload> {
        let cfg = self.settings();
        let cancel = options.cancel.unwrap_or_default();
        let timeout = options
            .timeout
            .unwrap_or_else(|| cfg.fetch.default_timeout());
        let mode = options.mode;
        let context = self.rank_context(target);

        if cfg.direct.enabled && context.is_domestic_target {
            match self
                .executor
                .fetch_direct(target, mode, cfg.direct.timeout(), &cancel)
                .await
            {
                Ok(payload) => {
                    debug!(target = %target, "Direct probe succeeded");
                    return Ok(payload);
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => debug!(target = %target, error = %e, "Direct probe failed, using relays"),
            }
        }

        let ranking = self.ranker.order(&context);
        if ranking.is_empty() {
            return Err(FetchError::Exhausted { tried: 0 });
        }

        if options.quick {
            let claimed = Mutex::new(Vec::new());
            let report = self
                .run_attempt(&ranking[0], &ranking, &claimed, target, mode, timeout, cancel)
                .await;
            return report.result.map_err(|e| {
                debug!(proxy = %report.proxy, error = %e, "Quick fetch failed");
                match e {
                    FetchError::Cancelled => FetchError::Cancelled,
                    _ => FetchError::Exhausted { tried: 1 },
                }
            });
        }

        // Proxies already claimed by this fetch. Legs add the proxy they were
        // admitted to, so redirects never double up on one relay.
        let tried = Mutex::new(Vec::new());
        let mut start = 0;

        if cfg.fetch.hedge_enabled && ranking.len() >= 2 {
            let (first, second) = (&ranking[0], &ranking[1]);
            remember(&tried, &first.name);
            remember(&tried, &second.name);
            let hedge = HedgeController::new(cfg.fetch.hedge_delay());

            let outcome = hedge
                .race(
                    &cancel,
                    |token| self.run_attempt(first, &ranking, &tried, target, mode, timeout, token),
                    |token| self.run_attempt(second, &ranking, &tried, target, mode, timeout, token),
                )
                .await;

            match outcome {
                HedgeOutcome::Won { proxy, payload } => {
                    debug!(proxy = %proxy, target = %target, "Hedge race won");
                    return Ok(payload);
                }
                HedgeOutcome::BothFailed { failures } => {
                    for (proxy, e) in failures {
                        debug!(proxy = %proxy, error = %e, "Hedge leg failed");
                    }
                    start = 2;
                }
            }
        }

        for proxy in ranking.iter().skip(start) {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if !remember(&tried, &proxy.name) {
                continue;
            }

            let report = self
                .run_attempt(proxy, &ranking, &tried, target, mode, timeout, cancel.child_token())
                .await;

            match report.result {
                Ok(payload) => {
                    debug!(proxy = %report.proxy, target = %target, "Failover succeeded");
                    return Ok(payload);
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => debug!(proxy = %report.proxy, error = %e, "Failover candidate failed"),
            }
        }

        let tried = tried.lock().unwrap_or_else(|p| p.into_inner()).len();
        Err(FetchError::Exhausted { tried })
    }

    /// Admission plus one attempt.
    ///
    /// Redirects never land on a proxy in `claimed`; the admitted proxy is
    /// added to it before the request goes out.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        proxy: &Arc<ProxyDescriptor>,
        ranking: &[Arc<ProxyDescriptor>],
        claimed: &Mutex<Vec<String>>,
        target: &str,
        mode: FetchMode,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> AttemptReport {
        let candidates: Vec<Arc<ProxyDescriptor>> = {
            let claimed = claimed.lock().unwrap_or_else(|p| p.into_inner());
            ranking
                .iter()
                .filter(|p| !claimed.contains(&p.name))
                .cloned()
                .collect()
        };

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            slot = self.pool.acquire(&proxy.name, &candidates) => slot,
        };

        match slot {
            Ok(slot) => {
                let served = slot.name().to_string();
                remember(claimed, &served);
                let result = self
                    .executor
                    .attempt(slot, target, mode, timeout, &cancel)
                    .await;
                AttemptReport {
                    proxy: served,
                    result,
                }
            }
            Err(e) => AttemptReport {
                proxy: proxy.name.clone(),
                result: Err(e),
            },
        }
    }
}

/// Adds `name` to the claimed set. Returns false if it was already there.
fn remember(claimed: &Mutex<Vec<String>>, name: &str) -> bool {
    let mut claimed = claimed.lock().unwrap_or_else(|p| p.into_inner());
    if claimed.iter().any(|c| c == name) {
        return false;
    }
    claimed.push(name.to_string());
    true
}
