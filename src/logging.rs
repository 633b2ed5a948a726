//! Logging configuration and initialization.
//!
//! Sets up the tracing subscriber from the `logging` config section. Output
//! goes to stdout, stderr or an appended file through a non-blocking writer.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// HTTP stack crates that are silenced unless dependency tracing is on.
const NOISY_DEPS: [&str; 4] = ["hyper", "reqwest", "rustls", "h2"];

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// so buffered records are flushed on exit.
///
/// `RUST_LOG`, when set, takes precedence over both `config.level` and
/// `level_override`.
///
/// # Example
///
/// ```ignore
/// let config = LoggingConfig::default();
/// let _guard = init_logging(&config, None, false)?;
/// tracing::info!("Logging initialized");
/// ```
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override.unwrap_or_else(|| config.level.clone());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&level, trace_deps)));

    let (writer, guard, ansi) = match config.output.to_lowercase().as_str() {
        "stdout" => {
            let (non_blocking, guard) = tracing_appender::non_blocking(io::stdout());
            (BoxMakeWriter::new(non_blocking), guard, true)
        }
        "stderr" => {
            let (non_blocking, guard) = tracing_appender::non_blocking(io::stderr());
            (BoxMakeWriter::new(non_blocking), guard, true)
        }
        _ => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            (BoxMakeWriter::new(non_blocking), guard, false)
        }
    };

    tracing_subscriber::registry()
        .with(format_layer(config, writer, ansi))
        .with(filter)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(guard)
}

/// Builds the default filter directive for a level name.
///
/// Unknown levels fall back to `info`.
pub fn filter_directive(level: &str, trace_deps: bool) -> String {
    let level = level.to_lowercase();
    let level = if LEVELS.contains(&level.as_str()) {
        level
    } else {
        "info".to_string()
    };

    if trace_deps {
        return level;
    }

    NOISY_DEPS
        .iter()
        .fold(level, |directive, dep| format!("{},{}=warn", directive, dep))
}

fn format_layer(
    config: &LoggingConfig,
    writer: BoxMakeWriter,
    ansi: bool,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_target);

    match (&config.format, config.timestamps) {
        (LogFormat::Json, true) => base.json().with_span_events(FmtSpan::CLOSE).boxed(),
        (LogFormat::Json, false) => base
            .json()
            .without_time()
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
    }
}
