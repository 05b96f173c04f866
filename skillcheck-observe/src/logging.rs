//! Global `tracing` subscriber configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Output format of the console layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-oriented output.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON objects.
    Json,
}

/// Logging configuration.
///
/// ```toml
/// level = "info"
/// format = "compact"
///
/// [targets]
/// skillcheck_core = "debug"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Default level for every target.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Per-target level overrides.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,

    /// Colorize output. Ignored for JSON.
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            targets: BTreeMap::new(),
            ansi: default_ansi(),
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.targets.insert(target.into(), level.into());
        self
    }

    /// Filter directives for this configuration, e.g. `info,skillcheck_core=debug`.
    pub fn directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.targets
                    .iter()
                    .map(|(target, level)| format!("{target}={level}")),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Errors from [`init_logging`].
#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),

    /// A global subscriber was already installed.
    #[error("failed to set global subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter for `config`. A non-empty `RUST_LOG` replaces it entirely.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, LogInitError> {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_for(config, from_env.as_deref())
}

fn filter_for(config: &LogConfig, from_env: Option<&str>) -> Result<EnvFilter, LogInitError> {
    let directives = match from_env.map(str::trim) {
        Some(env) if !env.is_empty() => env.to_string(),
        _ => config.directives(),
    };
    Ok(EnvFilter::try_new(directives)?)
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if the filter does not parse or a global subscriber has
/// already been set.
pub fn init_logging(config: &LogConfig) -> Result<(), LogInitError> {
    let filter = env_filter(config)?;
    let registry = Registry::default().with(filter);

    match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.ansi))
            .try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.ansi))
            .try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }

    tracing::debug!(directives = %config.directives(), format = ?config.format, "Logging initialized");
    Ok(())
}
