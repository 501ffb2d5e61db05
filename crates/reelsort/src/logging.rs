use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::error::{ReelsortError, Result};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. `log` records from dependencies and leaf
/// modules are bridged into `tracing`. Filtering follows `RUST_LOG`, `info`
/// by default.
pub fn init_logging(format: LogFormat) -> Result<()> {
    tracing_log::LogTracer::init()
        .map_err(|e| ReelsortError::Logging(e.to_string()))?;

    let registry = Registry::default().with(env_filter());
    let result = match format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        ),
    };

    result.map_err(|e| ReelsortError::Logging(e.to_string()))
}
