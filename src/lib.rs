//! # Relay Fetch Library
//!
//! Fetches remote resources through a pool of public CORS relays. Relays are
//! ranked by tier and observed quality, hedged in pairs, and scanned in order
//! until one returns a usable payload.
//!
//! ## Modules
//!
//! - [`catalog`]: Relay descriptors and URL templates
//! - [`config`]: Configuration loading, validation, and hot-reload support
//! - [`error`]: Error types and handling
//! - [`executor`]: Single attempts through one relay
//! - [`fetcher`]: Direct probe, hedge race, and failover scan
//! - [`hedge`]: Staggered race of two attempts
//! - [`logging`]: Logging setup and configuration
//! - [`pool`]: Per-relay concurrency slots with redirect and FIFO queueing
//! - [`ranker`]: Scoring and cached ordering of relays
//! - [`stats`]: Persistent success/failure/latency records
//! - [`storage`]: Key-value persistence and device identity
//!
//! ## Example
//!
//! ```ignore
//! use relay_fetch::config::ConfigManager;
//! use relay_fetch::fetcher::RelayFetcher;
//!
//! let manager = ConfigManager::new("relay-fetch.yaml")?;
//! let fetcher = RelayFetcher::new(manager.get_arc())?;
//!
//! if let Some(value) = fetcher.fetch_with_proxy("https://api.example.com/rooms").await {
//!     println!("{}", value);
//! }
//! ```
//!
//! ## Fetch Order
//!
//! 1. **Direct probe**: Domestic targets are tried without a relay when enabled
//! 2. **Hedge race**: The two best relays, the second delayed by a short stagger
//! 3. **Failover scan**: Remaining relays in rank order, one at a time

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod hedge;
pub mod logging;
pub mod pool;
pub mod ranker;
pub mod stats;
pub mod storage;

pub use catalog::{ProxyCatalog, ProxyDescriptor, Region, Tier};
pub use config::{AppConfig, ConfigManager};
pub use error::{FetchError, Result};
pub use executor::{FetchMode, Payload, Transport};
pub use fetcher::{FetchOptions, RelayFetcher};
pub use ranker::{RankContext, Ranker};
pub use stats::{ProxyStats, StatsStore};
