//! # Relay Fetch
//!
//! Fetches a URL through a ranked pool of public CORS relays.
//!
//! ## Features
//!
//! - **Ranking**: Relays are ordered by tier and observed quality
//! - **Hedging**: The two best relays race with a short stagger
//! - **Failover**: Remaining relays are tried one at a time
//! - **Persistence**: Relay stats survive restarts when a storage path is set
//! - **Hot Reload**: Configuration changes apply between polling cycles
//!
//! ## Usage
//!
//! ```bash
//! # One-shot JSON fetch
//! relay-fetch https://api.example.com/rooms
//!
//! # Poll an M3U playlist every 30 seconds
//! relay-fetch -m text --interval 30 https://cdn.example.com/live.m3u8
//!
//! # Show how relays currently rank
//! relay-fetch --show-ranking
//!
//! # Increase verbosity
//! relay-fetch -vvvv https://api.example.com/rooms  # trace level
//! ```

use clap::{Parser, ValueEnum};
use relay_fetch::config::{AppConfig, ConfigManager};
use relay_fetch::executor::{FetchMode, Payload};
use relay_fetch::fetcher::{FetchOptions, RelayFetcher};
use relay_fetch::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fetches a URL through a ranked pool of CORS relays.
#[derive(Parser, Debug)]
#[command(name = "relay-fetch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target URL
    #[arg(required_unless_present_any = ["show_ranking", "reset_stats"])]
    url: Option<String>,

    /// Path to the configuration file
    #[arg(short, long, env = "RELAY_FETCH_CONFIG")]
    config: Option<PathBuf>,

    /// How to interpret the response body
    #[arg(short, long, value_enum, default_value_t = Mode::Json)]
    mode: Mode,

    /// Try only the top-ranked relay
    #[arg(long)]
    quick: bool,

    /// Per-attempt timeout in milliseconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Poll every N seconds instead of fetching once
    #[arg(long)]
    interval: Option<u64>,

    /// Print the current relay ranking and exit
    #[arg(long)]
    show_ranking: bool,

    /// Clear persisted relay stats before running
    #[arg(long)]
    reset_stats: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Json,
    Text,
    Binary,
}

impl From<Mode> for FetchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Json => FetchMode::Json,
            Mode::Text => FetchMode::Text,
            Mode::Binary => FetchMode::Binary,
        }
    }
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }

    fn options(&self, cancel: CancellationToken) -> FetchOptions {
        let mut options = FetchOptions {
            mode: self.mode.into(),
            quick: self.quick,
            ..Default::default()
        }
        .with_cancel(cancel);
        if let Some(ms) = self.timeout {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        options
    }
}

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let (config, config_manager) = load_config(&args);

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting relay-fetch");

    let config_arc = match config_manager {
        Some(ref manager) => manager.get_arc(),
        None => Arc::new(RwLock::new(config)),
    };

    let fetcher = match RelayFetcher::new(config_arc) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!(error = %e, "Failed to create relay fetcher");
            return ExitCode::FAILURE;
        }
    };

    if args.reset_stats {
        fetcher.stats().reset();
        info!("Relay stats cleared");
    }

    if args.show_ranking {
        print_ranking(&fetcher, args.url.as_deref().unwrap_or_default());
        return ExitCode::SUCCESS;
    }

    let Some(url) = args.url.clone() else {
        return ExitCode::SUCCESS;
    };

    if let Some(manager) = config_manager {
        match manager.start_watcher() {
            Ok(mut rx) => {
                let fetcher_refresh = fetcher.clone();
                tokio::spawn(async move {
                    while rx.recv().await.is_some() {
                        info!("Configuration reloaded successfully");
                        fetcher_refresh.refresh();
                    }
                });
            }
            Err(e) => {
                error!("Failed to start config watcher: {}", e);
            }
        }
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                shutdown.cancel();
            }
        });
    }

    let Some(interval) = args.interval else {
        return match fetcher.fetch(&url, args.options(shutdown.child_token())).await {
            Some(payload) => {
                print_payload(payload);
                ExitCode::SUCCESS
            }
            None => ExitCode::FAILURE,
        };
    };

    let period = Duration::from_secs(interval.max(1));
    loop {
        match fetcher.fetch(&url, args.options(shutdown.child_token())).await {
            Some(payload) => print_payload(payload),
            None if shutdown.is_cancelled() => break,
            None => warn!(url = %url, "No relay returned a payload this cycle"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    ExitCode::SUCCESS
}

fn print_payload(payload: Payload) {
    match payload {
        Payload::Json(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", value),
        },
        Payload::Text(text) => println!("{}", text),
        Payload::Binary(bytes) => println!("{} bytes", bytes.len()),
    }
}

fn print_ranking(fetcher: &RelayFetcher, url: &str) {
    let context = fetcher.rank_context(url);
    for (i, entry) in fetcher.ranker().scored(&context).iter().enumerate() {
        let stats = fetcher.stats().get(&entry.proxy.name).unwrap_or_default();
        let position = fetcher.catalog().position(&entry.proxy.name).unwrap_or(i);
        println!(
            "{:>2}. {:<16} {:>9.2}  catalog=#{} tier={:?} region={:?} ok={} fail={} avg={:.0}ms",
            i + 1,
            entry.proxy.name,
            entry.score,
            position + 1,
            entry.proxy.tier,
            entry.proxy.region,
            stats.success,
            stats.fail,
            stats.avg_response_time,
        );
    }
}

/// Load configuration from file or use defaults
fn load_config(args: &Args) -> (AppConfig, Option<ConfigManager>) {
    let config_path = args.config.clone().or_else(|| {
        let defaults = ["./relay-fetch.yaml", "./config.yaml"];
        defaults.iter().map(PathBuf::from).find(|p| p.exists())
    });

    match config_path {
        Some(path) => {
            if path.exists() {
                match ConfigManager::new(&path) {
                    Ok(manager) => {
                        let config = manager.get();
                        (config, Some(manager))
                    }
                    Err(e) => {
                        eprintln!("Warning: Failed to load config from {:?}: {}", path, e);
                        eprintln!("Using default configuration");
                        (AppConfig::default(), None)
                    }
                }
            } else {
                eprintln!("Warning: Config file not found: {:?}", path);
                eprintln!("Using default configuration");
                (AppConfig::default(), None)
            }
        }
        None => (AppConfig::default(), None),
    }
}
