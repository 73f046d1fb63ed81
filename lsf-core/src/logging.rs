//! Process-wide `tracing` subscriber.

use std::{fs::OpenOptions, sync::Arc};

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Transport crates that are chatty below `info`.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "tungstenite", "tokio_tungstenite", "rustls"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level`. Output goes to stderr, or is appended
/// to `config.file_path` without colours.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(parse_log_level(&config.level)?)?,
    };

    let (writer, ansi) = match config.file_path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_writer(writer),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init()?;
    }
    Ok(())
}

fn default_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new(level.to_string());
    if level > Level::INFO {
        for target in QUIET_TARGETS {
            filter = filter.add_directive(format!("{target}=info").parse()?);
        }
    }
    Ok(filter)
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
