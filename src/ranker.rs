//! Proxy ranking by tier and historical performance.
//!
//! ```text
//! quality    = successRate * W_success + recency * W_recency + speed * W_speed
//! geoWeight  = weight * (3 if mainland user and mainland proxy else 1)
//! finalScore = tierPriority[tier] + quality * geoWeight * qualityMultiplier
//! ```
//!
//! Orderings are cached per [`RankContext`] until the stats version changes
//! or the TTL elapses.

use crate::catalog::{ProxyCatalog, ProxyDescriptor, Region};
use crate::config::ScoringConfig;
use crate::stats::{ProxyStats, StatsStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const MAINLAND_BOOST: f64 = 3.0;

/// Caller context that influences the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RankContext {
    pub is_mainland_user: bool,
    pub is_domestic_target: bool,
}

/// A proxy together with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredProxy {
    pub proxy: Arc<ProxyDescriptor>,
    pub score: f64,
}

/// Shared ordering, cheap to clone.
pub type Ranking = Arc<[Arc<ProxyDescriptor>]>;

struct CachedRanking {
    version: u64,
    computed_at: Instant,
    order: Ranking,
}

/// Orders the catalog for a given context.
pub struct Ranker {
    catalog: Arc<ProxyCatalog>,
    stats: Arc<StatsStore>,
    config: RwLock<ScoringConfig>,
    cache: Mutex<HashMap<RankContext, CachedRanking>>,
    evaluations: AtomicU64,
}

impl Ranker {
    pub fn new(catalog: Arc<ProxyCatalog>, stats: Arc<StatsStore>, config: ScoringConfig) -> Self {
        Self {
            catalog,
            stats,
            config: RwLock::new(config),
            cache: Mutex::new(HashMap::new()),
            evaluations: AtomicU64::new(0),
        }
    }

    /// Replaces the scoring parameters and drops cached orderings.
    pub fn set_config(&self, config: ScoringConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
        self.invalidate();
    }

    /// Drops every cached ordering.
    pub fn invalidate(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Number of per-proxy score computations performed so far.
    pub fn score_evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Full catalog ordering, best first.
    pub fn order(&self, context: &RankContext) -> Ranking {
        let ttl = {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            Duration::from_millis(config.ranking_cache_ttl_ms)
        };

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let version = self.stats.version();
        if let Some(cached) = cache.get(context) {
            if cached.version == version && cached.computed_at.elapsed() < ttl {
                return cached.order.clone();
            }
        }

        let (version, scored) = self.compute(context);
        let order: Ranking = scored.into_iter().map(|s| s.proxy).collect();
        cache.insert(
            *context,
            CachedRanking {
                version,
                computed_at: Instant::now(),
                order: order.clone(),
            },
        );
        order
    }

    /// Ordering with scores, bypassing the cache.
    pub fn scored(&self, context: &RankContext) -> Vec<ScoredProxy> {
        self.compute(context).1
    }

    fn compute(&self, context: &RankContext) -> (u64, Vec<ScoredProxy>) {
        let config = self.config.read().unwrap_or_else(|p| p.into_inner()).clone();
        let (version, stats) = self.stats.snapshot();
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut scored: Vec<ScoredProxy> = self
            .catalog
            .iter()
            .map(|proxy| {
                self.evaluations.fetch_add(1, Ordering::Relaxed);
                ScoredProxy {
                    proxy: proxy.clone(),
                    score: score(proxy, stats.get(&proxy.name), context, &config, now_ms),
                }
            })
            .collect();

        // Stable: equal scores keep catalog order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        trace!(
            version = version,
            mainland_user = context.is_mainland_user,
            domestic_target = context.is_domestic_target,
            top = scored.first().map(|s| s.proxy.name.as_str()).unwrap_or(""),
            "Computed proxy ranking"
        );
        (version, scored)
    }
}

/// Weighted quality term in `[0, 1]`.
pub fn quality(stats: Option<&ProxyStats>, config: &ScoringConfig, now_ms: i64) -> f64 {
    let (success_rate, recency, speed) = match stats {
        None => (0.5, 0.0, 0.5),
        Some(s) => {
            let success_rate = if s.samples() > 0 {
                s.success as f64 / s.samples() as f64
            } else {
                0.5
            };
            let recency = if s.last_success_time > 0 {
                let age = (now_ms - s.last_success_time) as f64;
                (1.0 - age / config.decay_window_ms()).max(0.0)
            } else {
                0.0
            };
            let speed = if s.avg_response_time > 0.0 {
                (1.0 - s.avg_response_time / config.speed_threshold_ms).max(0.0)
            } else {
                0.5
            };
            (success_rate, recency, speed)
        }
    };

    let w = &config.weights;
    success_rate * w.success + recency * w.recency + speed * w.speed
}

/// Final ranking score of one proxy.
pub fn score(
    proxy: &ProxyDescriptor,
    stats: Option<&ProxyStats>,
    context: &RankContext,
    config: &ScoringConfig,
    now_ms: i64,
) -> f64 {
    let boosted = context.is_mainland_user
        && proxy.region == Region::Mainland
        && (context.is_domestic_target || !config.geo_boost_requires_domestic_target);
    let geo_weight = proxy.weight as f64 * if boosted { MAINLAND_BOOST } else { 1.0 };

    config.tier_priority.for_tier(proxy.tier)
        + quality(stats, config, now_ms) * geo_weight * config.quality_multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Tier, UrlTemplate};
    use crate::config::StatsConfig;
    use crate::storage::MemoryStore;

    fn descriptor(name: &str, tier: Tier, region: Region, weight: u32) -> ProxyDescriptor {
        ProxyDescriptor {
            name: name.to_string(),
            url: UrlTemplate::parse("https://relay.example/?u={url}").unwrap(),
            wrap: false,
            weight,
            region,
            tier,
        }
    }

    fn ranker(descriptors: Vec<ProxyDescriptor>) -> (Ranker, Arc<StatsStore>) {
        let catalog = Arc::new(ProxyCatalog::new(descriptors).unwrap());
        let stats = Arc::new(StatsStore::load(
            Arc::new(MemoryStore::new()),
            StatsConfig::default(),
        ));
        (
            Ranker::new(catalog, stats.clone(), ScoringConfig::default()),
            stats,
        )
    }

    fn names(order: &Ranking) -> Vec<&str> {
        order.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_empty_stats_follow_tier_then_catalog_order() {
        let (ranker, _) = ranker(vec![
            descriptor("f1", Tier::Fallback, Region::Global, 1),
            descriptor("s1", Tier::Standard, Region::Global, 1),
            descriptor("p1", Tier::Premium, Region::Global, 1),
            descriptor("s2", Tier::Standard, Region::Global, 1),
            descriptor("p2", Tier::Premium, Region::Global, 1),
        ]);

        let order = ranker.order(&RankContext::default());
        assert_eq!(names(&order), vec!["p1", "p2", "s1", "s2", "f1"]);
    }

    #[test]
    fn test_quality_defaults() {
        let config = ScoringConfig::default();
        let q = quality(None, &config, 0);
        assert!((q - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_success_reorders_within_tier() {
        let (ranker, stats) = ranker(vec![
            descriptor("a", Tier::Standard, Region::Global, 1),
            descriptor("b", Tier::Standard, Region::Global, 1),
        ]);
        stats.record_result("a", false, 0);
        stats.record_result("b", true, 200);

        let order = ranker.order(&RankContext::default());
        assert_eq!(names(&order), vec!["b", "a"]);
    }

    #[test]
    fn test_tier_dominates_quality() {
        let (ranker, stats) = ranker(vec![
            descriptor("standard", Tier::Standard, Region::Global, 1),
            descriptor("premium", Tier::Premium, Region::Global, 1),
        ]);
        for _ in 0..10 {
            stats.record_result("premium", false, 0);
            stats.record_result("standard", true, 50);
        }

        let order = ranker.order(&RankContext::default());
        assert_eq!(names(&order), vec!["premium", "standard"]);
    }

    #[test]
    fn test_mainland_boost() {
        let (ranker, _) = ranker(vec![
            descriptor("global", Tier::Standard, Region::Global, 2),
            descriptor("mainland", Tier::Standard, Region::Mainland, 1),
        ]);

        let overseas = RankContext::default();
        assert_eq!(names(&ranker.order(&overseas)), vec!["global", "mainland"]);

        let mainland = RankContext {
            is_mainland_user: true,
            is_domestic_target: false,
        };
        assert_eq!(names(&ranker.order(&mainland)), vec!["mainland", "global"]);
    }

    #[test]
    fn test_mainland_boost_can_require_domestic_target() {
        let config = ScoringConfig {
            geo_boost_requires_domestic_target: true,
            ..Default::default()
        };
        let proxy = descriptor("mainland", Tier::Standard, Region::Mainland, 1);
        let foreign = RankContext {
            is_mainland_user: true,
            is_domestic_target: false,
        };
        let domestic = RankContext {
            is_mainland_user: true,
            is_domestic_target: true,
        };

        let plain = score(&proxy, None, &foreign, &config, 0);
        let boosted = score(&proxy, None, &domestic, &config, 0);
        assert!((boosted - 500.0 - (plain - 500.0) * 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hit_skips_scoring() {
        let (ranker, _) = ranker(vec![
            descriptor("a", Tier::Premium, Region::Global, 1),
            descriptor("b", Tier::Standard, Region::Global, 1),
            descriptor("c", Tier::Fallback, Region::Global, 1),
        ]);
        let context = RankContext::default();

        let first = ranker.order(&context);
        assert_eq!(ranker.score_evaluations(), 3);

        let second = ranker.order(&context);
        assert_eq!(ranker.score_evaluations(), 3);
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_stats_update_invalidates_cache() {
        let (ranker, stats) = ranker(vec![
            descriptor("a", Tier::Premium, Region::Global, 1),
            descriptor("b", Tier::Standard, Region::Global, 1),
        ]);
        let context = RankContext::default();

        ranker.order(&context);
        stats.record_result("a", true, 100);
        ranker.order(&context);
        assert_eq!(ranker.score_evaluations(), 4);
    }

    #[test]
    fn test_contexts_cached_separately() {
        let (ranker, _) = ranker(vec![descriptor("a", Tier::Premium, Region::Global, 1)]);

        ranker.order(&RankContext::default());
        ranker.order(&RankContext {
            is_mainland_user: true,
            is_domestic_target: true,
        });
        assert_eq!(ranker.score_evaluations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let (ranker, _) = ranker(vec![descriptor("a", Tier::Premium, Region::Global, 1)]);
        let context = RankContext::default();

        ranker.order(&context);
        tokio::time::advance(Duration::from_millis(1500)).await;
        ranker.order(&context);
        assert_eq!(ranker.score_evaluations(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        ranker.order(&context);
        assert_eq!(ranker.score_evaluations(), 2);
    }
}
