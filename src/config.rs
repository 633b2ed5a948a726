//! Configuration management for relay-fetch.
//!
//! This module handles loading, parsing, validating, and hot-reloading
//! of the YAML configuration file. It uses `notify` for file system
//! watching and `Arc<RwLock>` for shared config access. Every tunable has a
//! default, so an empty file (or no file at all) yields a working setup.

use crate::catalog::{ProxyCatalog, ProxyDescriptor, Region, Tier, UrlTemplate};
use crate::error::{FetchError, Result};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Admission, hedging and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchSettings {
    /// Maximum in-flight attempts per proxy.
    pub max_concurrent_per_proxy: usize,

    /// How long an admission request may wait in a proxy's queue.
    pub queue_timeout_ms: u64,

    /// Race the two best candidates.
    pub hedge_enabled: bool,

    /// Delay before the secondary hedge leg starts.
    pub hedge_delay_ms: u64,

    /// Per-attempt timeout when the caller does not supply one.
    pub default_timeout_ms: u64,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_per_proxy: 3,
            queue_timeout_ms: 15_000,
            hedge_enabled: true,
            hedge_delay_ms: 150,
            default_timeout_ms: 10_000,
            user_agent: concat!("relay-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchSettings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn hedge_delay(&self) -> Duration {
        Duration::from_millis(self.hedge_delay_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Relative weights of the quality terms. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub success: f64,
    pub recency: f64,
    pub speed: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: 0.4,
            recency: 0.3,
            speed: 0.3,
        }
    }
}

/// Base score per tier. Larger values rank first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierPriority {
    pub premium: f64,
    pub standard: f64,
    pub fallback: f64,
}

impl Default for TierPriority {
    fn default() -> Self {
        Self {
            premium: 1000.0,
            standard: 500.0,
            fallback: 0.0,
        }
    }
}

impl TierPriority {
    pub fn for_tier(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Premium => self.premium,
            Tier::Standard => self.standard,
            Tier::Fallback => self.fallback,
        }
    }
}

/// Ranking parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,

    /// Window over which a last success fades to zero recency.
    pub decay_window_hours: f64,

    /// Average response time at which the speed term reaches zero.
    pub speed_threshold_ms: f64,

    /// Scales quality relative to the tier priority.
    pub quality_multiplier: f64,

    pub tier_priority: TierPriority,

    /// How long a computed ranking is reused.
    pub ranking_cache_ttl_ms: u64,

    /// Only apply the mainland boost when the target is a domestic platform.
    pub geo_boost_requires_domestic_target: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            decay_window_hours: 24.0,
            speed_threshold_ms: 3000.0,
            quality_multiplier: 10.0,
            tier_priority: TierPriority::default(),
            ranking_cache_ttl_ms: 2000,
            geo_boost_requires_domestic_target: false,
        }
    }
}

impl ScoringConfig {
    pub fn decay_window_ms(&self) -> f64 {
        self.decay_window_hours * 3_600_000.0
    }
}

/// Decay parameters of the stats store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// Once `success + fail` exceeds this, accumulators are scaled down.
    pub decay_cap: u64,

    /// Scale applied to the accumulators on decay.
    pub decay_factor: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            decay_cap: 100,
            decay_factor: 0.8,
        }
    }
}

/// How the caller's region is determined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRegion {
    /// Inspect the process locale (`LC_ALL`, `LANG`).
    #[default]
    Auto,
    Mainland,
    Overseas,
}

/// Region detection section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RegionConfig {
    pub user: UserRegion,
}

impl RegionConfig {
    /// Resolves whether the caller counts as a mainland user.
    pub fn is_mainland_user(&self) -> bool {
        match self.user {
            UserRegion::Mainland => true,
            UserRegion::Overseas => false,
            UserRegion::Auto => ["LC_ALL", "LANG"]
                .iter()
                .filter_map(|var| std::env::var(var).ok())
                .find(|value| !value.is_empty())
                .map(|locale| locale_is_mainland(&locale))
                .unwrap_or(false),
        }
    }
}

/// Whether a POSIX locale string names mainland China.
pub fn locale_is_mainland(locale: &str) -> bool {
    let locale = locale.to_lowercase();
    locale.starts_with("zh_cn") || locale.starts_with("zh-cn") || locale.starts_with("zh_hans")
}

/// Unproxied probe for domestic platforms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectConfig {
    /// Attempt a direct fetch before going through relays.
    pub enabled: bool,

    /// Timeout of the direct attempt.
    pub timeout_ms: u64,

    /// Hosts (suffix match) treated as domestic platforms.
    pub domestic_hosts: Vec<String>,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 3000,
            domestic_hosts: vec![
                "douyu.com".to_string(),
                "huya.com".to_string(),
                "bilibili.com".to_string(),
                "douyin.com".to_string(),
            ],
        }
    }
}

impl DirectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks if a host belongs to a domestic platform.
    pub fn is_domestic_host(&self, host: &str) -> bool {
        let host_lower = host.to_lowercase();

        self.domestic_hosts.iter().any(|pattern| {
            let pattern = pattern.trim_start_matches('.').to_lowercase();
            host_lower == pattern || host_lower.ends_with(&format!(".{}", pattern))
        })
    }

    /// Checks if a target URL points at a domestic platform.
    pub fn is_domestic_target(&self, target: &str) -> bool {
        target
            .parse::<http::Uri>()
            .ok()
            .and_then(|uri| uri.host().map(|h| self.is_domestic_host(h)))
            .unwrap_or(false)
    }
}

/// Key-value storage section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the store. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include timestamps in logs.
    pub timestamps: bool,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stderr".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            include_target: true,
        }
    }
}

/// One relay entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyEntry {
    /// Unique proxy name.
    pub name: String,

    /// URL template with a `{url}` (percent-encoded) or `{raw}` placeholder.
    pub url: String,

    /// Payload is nested in a `contents` field.
    #[serde(default)]
    pub wrap: bool,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub region: Region,

    #[serde(default)]
    pub tier: Tier,
}

fn default_weight() -> u32 {
    1
}

impl ProxyEntry {
    /// Converts the entry into a catalog descriptor.
    pub fn to_descriptor(&self) -> Result<ProxyDescriptor> {
        if self.name.trim().is_empty() {
            return Err(FetchError::config_validation("Proxy name cannot be empty"));
        }
        let url = UrlTemplate::parse(&self.url).ok_or_else(|| {
            FetchError::config_validation(format!(
                "Proxy {} url must contain {{url}} or {{raw}}: {}",
                self.name, self.url
            ))
        })?;

        Ok(ProxyDescriptor {
            name: self.name.clone(),
            url,
            wrap: self.wrap,
            weight: self.weight,
            region: self.region,
            tier: self.tier,
        })
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub fetch: FetchSettings,
    pub scoring: ScoringConfig,
    pub stats: StatsConfig,
    pub region: RegionConfig,
    pub direct: DirectConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,

    /// Relay list. Empty selects the built-in catalog.
    pub proxies: Vec<ProxyEntry>,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FetchError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).map_err(|e| FetchError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_concurrent_per_proxy == 0 {
            return Err(FetchError::config_validation(
                "max_concurrent_per_proxy must be at least 1",
            ));
        }

        let w = &self.scoring.weights;
        if w.success < 0.0 || w.recency < 0.0 || w.speed < 0.0 {
            return Err(FetchError::config_validation(
                "Score weights cannot be negative",
            ));
        }
        let sum = w.success + w.recency + w.speed;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(FetchError::config_validation(format!(
                "Score weights must sum to 1, got {}",
                sum
            )));
        }

        if self.scoring.decay_window_hours <= 0.0 || self.scoring.speed_threshold_ms <= 0.0 {
            return Err(FetchError::config_validation(
                "decay_window_hours and speed_threshold_ms must be positive",
            ));
        }

        if self.stats.decay_cap == 0 {
            return Err(FetchError::config_validation("decay_cap must be positive"));
        }
        if !(self.stats.decay_factor > 0.0 && self.stats.decay_factor < 1.0) {
            return Err(FetchError::config_validation(format!(
                "decay_factor must be between 0 and 1, got {}",
                self.stats.decay_factor
            )));
        }

        let mut names = HashSet::new();
        for entry in &self.proxies {
            entry.to_descriptor()?;
            if !names.insert(entry.name.as_str()) {
                return Err(FetchError::config_validation(format!(
                    "Duplicate proxy name: {}",
                    entry.name
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(FetchError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Builds the proxy catalog, falling back to the built-in relays.
    pub fn catalog(&self) -> Result<ProxyCatalog> {
        if self.proxies.is_empty() {
            return Ok(ProxyCatalog::builtin());
        }

        let descriptors = self
            .proxies
            .iter()
            .map(ProxyEntry::to_descriptor)
            .collect::<Result<Vec<_>>>()?;
        ProxyCatalog::new(descriptors)
    }
}

/// Shared configuration holder with hot-reload support.
#[derive(Clone)]
pub struct ConfigManager {
    /// Current configuration.
    config: Arc<RwLock<AppConfig>>,

    /// Path to the configuration file.
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager and loads the initial configuration.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref().to_path_buf();
        let config = AppConfig::load(&config_path)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Gets a clone of the current configuration.
    pub fn get(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Gets a reference to the configuration Arc.
    pub fn get_arc(&self) -> Arc<RwLock<AppConfig>> {
        self.config.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The proxy list is fixed at startup; a reload only changes tunables.
    pub fn reload(&self) -> Result<()> {
        info!("Reloading configuration from {:?}", self.config_path);

        match AppConfig::load(&self.config_path) {
            Ok(new_config) => {
                let mut config = self
                    .config
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if config.proxies != new_config.proxies {
                    warn!("Proxy list changes take effect after restart");
                }
                *config = new_config;
                info!("Configuration reloaded successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload configuration: {}", e);
                Err(e)
            }
        }
    }

    /// Starts watching the configuration file for changes.
    /// Returns a channel receiver that signals when a reload occurs.
    pub fn start_watcher(&self) -> Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(1);
        let config_path = self.config_path.clone();
        let manager = self.clone();

        std::thread::spawn(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = match RecommendedWatcher::new(
                move |res: std::result::Result<Event, notify::Error>| {
                    if let Ok(event) = res {
                        if event.kind.is_modify() || event.kind.is_create() {
                            let _ = notify_tx.send(());
                        }
                    }
                },
                NotifyConfig::default(),
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!("Failed to create file watcher: {}", e);
                    return;
                }
            };

            // Watch the parent directory to catch file replacements
            let watch_path = config_path.parent().unwrap_or(&config_path);
            if let Err(e) = watcher.watch(watch_path, RecursiveMode::NonRecursive) {
                error!("Failed to watch config directory: {}", e);
                return;
            }

            info!("Started watching configuration file for changes");

            let mut last_reload = std::time::Instant::now();
            let debounce_duration = Duration::from_millis(500);

            loop {
                match notify_rx.recv() {
                    Ok(()) => {
                        let now = std::time::Instant::now();
                        if now.duration_since(last_reload) >= debounce_duration {
                            if manager.reload().is_ok() {
                                last_reload = now;
                                let _ = tx.blocking_send(());
                            }
                        } else {
                            debug!("Debouncing config reload");
                        }
                    }
                    Err(_) => {
                        warn!("Config watcher channel closed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.fetch.max_concurrent_per_proxy, 3);
        assert_eq!(config.fetch.queue_timeout_ms, 15_000);
        assert_eq!(config.fetch.hedge_delay_ms, 150);
        assert!(config.fetch.hedge_enabled);
        assert_eq!(config.scoring.ranking_cache_ttl_ms, 2000);
        assert_eq!(config.stats.decay_cap, 100);
        assert!(!config.direct.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let yaml = r#"
fetch:
  max_concurrent_per_proxy: 1
  hedge_enabled: false
scoring:
  weights: { success: 0.6, recency: 0.2, speed: 0.2 }
stats:
  decay_cap: 50
region:
  user: mainland
proxies:
  - name: "alpha"
    url: "https://alpha.example/get?url={url}"
    wrap: true
    weight: 2
    region: mainland
    tier: premium
  - name: "beta"
    url: "https://beta.example/{raw}"
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.fetch.max_concurrent_per_proxy, 1);
        assert!(!config.fetch.hedge_enabled);
        assert_eq!(config.fetch.queue_timeout_ms, 15_000);
        assert_eq!(config.scoring.weights.success, 0.6);
        assert_eq!(config.stats.decay_cap, 50);
        assert!(config.region.is_mainland_user());

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 2);
        let alpha = catalog.get("alpha").unwrap();
        assert!(alpha.wrap);
        assert_eq!(alpha.weight, 2);
        assert_eq!(alpha.region, Region::Mainland);
        assert_eq!(alpha.tier, Tier::Premium);
        let beta = catalog.get("beta").unwrap();
        assert_eq!(beta.weight, 1);
        assert_eq!(beta.tier, Tier::Standard);
        assert_eq!(beta.region, Region::Global);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let yaml = r#"
scoring:
  weights: { success: 0.5, recency: 0.5, speed: 0.5 }
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_invalid_decay_factor() {
        let yaml = r#"
stats:
  decay_factor: 1.5
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let yaml = r#"
logging:
  level: "invalid"
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_proxy_template_requires_placeholder() {
        let yaml = r#"
proxies:
  - name: "broken"
    url: "https://broken.example/fetch"
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_duplicate_proxy_names() {
        let yaml = r#"
proxies:
  - { name: "dup", url: "https://a.example/?u={url}" }
  - { name: "dup", url: "https://b.example/?u={url}" }
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_empty_proxies_uses_builtin() {
        let config = AppConfig::default();
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), ProxyCatalog::builtin().len());
    }

    #[test]
    fn test_domestic_hosts() {
        let direct = DirectConfig::default();
        assert!(direct.is_domestic_host("www.douyu.com"));
        assert!(direct.is_domestic_host("HUYA.COM"));
        assert!(!direct.is_domestic_host("twitch.tv"));
        assert!(!direct.is_domestic_host("notdouyu.com"));

        assert!(direct.is_domestic_target("https://m.douyu.com/room/1234"));
        assert!(!direct.is_domestic_target("https://api.twitch.tv/helix/streams"));
        assert!(!direct.is_domestic_target("not a url"));
    }

    #[test]
    fn test_locale_detection() {
        assert!(locale_is_mainland("zh_CN.UTF-8"));
        assert!(locale_is_mainland("zh-CN"));
        assert!(!locale_is_mainland("zh_TW.UTF-8"));
        assert!(!locale_is_mainland("en_US.UTF-8"));

        let region = RegionConfig {
            user: UserRegion::Overseas,
        };
        assert!(!region.is_mainland_user());
    }

    #[test]
    fn test_config_manager() {
        let yaml = r#"
fetch:
  hedge_delay_ms: 300
"#;
        let file = create_temp_config(yaml);
        let manager = ConfigManager::new(file.path()).unwrap();

        let config = manager.get();
        assert_eq!(config.fetch.hedge_delay_ms, 300);
        assert_eq!(config.fetch.hedge_delay(), Duration::from_millis(300));
    }
}
