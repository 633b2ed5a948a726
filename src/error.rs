//! Error types for the relay-fetch library.
//!
//! Attempt failures (network, timeout, status, parse) are recorded into the
//! stats store as feedback for the ranker; queue timeouts and cancellations
//! are not, since no relay answered. At the top level every kind is collapsed
//! into an empty result by the `Option`-returning fetch entry points.

use thiserror::Error;

/// Main error type for the relay-fetch library.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection failure or transport-level error.
    #[error("Network error via {proxy}: {message}")]
    Network { proxy: String, message: String },

    /// The attempt exceeded its time budget.
    #[error("Request via {proxy} timed out after {after_ms}ms")]
    Timeout { proxy: String, after_ms: u64 },

    /// The attempt was aborted through its cancellation token.
    #[error("Request cancelled")]
    Cancelled,

    /// The relay answered with a non-success status code.
    #[error("HTTP status {status} from {proxy}")]
    HttpStatus { proxy: String, status: u16 },

    /// Empty, malformed, or un-unwrappable payload.
    #[error("Failed to parse response from {proxy}: {message}")]
    Parse { proxy: String, message: String },

    /// Admission wait for a proxy slot exceeded the queue timeout.
    #[error("Timed out after {waited_ms}ms waiting for a slot on {proxy}")]
    QueueTimeout { proxy: String, waited_ms: u64 },

    /// Every ranked candidate was tried without success.
    #[error("All {tried} proxies failed")]
    Exhausted { tried: usize },

    /// A proxy name that is not part of the catalog.
    #[error("Unknown proxy: {0}")]
    UnknownProxy(String),

    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// Key-value storage failure.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Creates a new network error.
    pub fn network(proxy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            proxy: proxy.into(),
            message: message.into(),
        }
    }

    /// Creates a new parse error.
    pub fn parse(proxy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            proxy: proxy.into(),
            message: message.into(),
        }
    }

    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether this belongs to the network class (connection, timeout, abort).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Cancelled
        )
    }

    /// Whether this outcome counts against the proxy in the stats store.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::HttpStatus { .. }
                | Self::Parse { .. }
        )
    }
}

/// Result type alias using FetchError.
pub type Result<T> = std::result::Result<T, FetchError>;
