use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::Settings;

/// Filter installed by [`init_logging`], reloadable at runtime
static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Verbosity of the membership engine target
    pub membership_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            membership_level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Read `log_level`, `log_format`, `log_file` and `mem_log_level`
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let d = Self::default();
        let level_or = |key: &str, default: String| match settings.get(key) {
            Some(level) if parse_log_level(level).is_ok() => level.to_lowercase(),
            _ => default,
        };
        Self {
            level: level_or("log_level", d.level),
            format: match settings.get("log_format") {
                Some("json") => "json".to_string(),
                _ => d.format,
            },
            file_path: settings.get("log_file").map(str::to_string),
            membership_level: level_or("mem_log_level", d.membership_level),
        }
    }

    /// `EnvFilter` directives for this configuration
    #[must_use]
    pub fn filter_directives(&self) -> String {
        format!(
            "{},{}::membership={}",
            self.level,
            env!("CARGO_CRATE_NAME"),
            self.membership_level
        )
    }
}

/// Initialize structured logging based on configuration
///
/// Supports both JSON (production) and pretty (development) formats
/// with configurable log levels and optional file output.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let (env_filter, handle) = reload::Layer::new(env_filter);
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        if let Some(file_path) = &config.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            let file_layer = json_layer.with_writer(std::sync::Arc::new(file));
            registry.with(file_layer).try_init()?;
        } else {
            registry.with(json_layer).try_init()?;
        }
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false);

        if let Some(file_path) = &config.file_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            let file_layer = pretty_layer.with_writer(std::sync::Arc::new(file));
            registry.with(file_layer).try_init()?;
        } else {
            registry.with(pretty_layer).try_init()?;
        }
    }

    let _ = FILTER.set(handle);
    Ok(())
}

fn membership_directive(level: &str) -> anyhow::Result<Directive> {
    let level = parse_log_level(level)?.as_str().to_lowercase();
    Ok(format!("{}::membership={level}", env!("CARGO_CRATE_NAME")).parse()?)
}

/// Change the membership engine's verbosity on the running subscriber
///
/// Returns `false` when logging was not installed by [`init_logging`].
pub fn set_membership_level(level: &str) -> anyhow::Result<bool> {
    let directive = membership_directive(level)?;
    let Some(handle) = FILTER.get() else {
        return Ok(false);
    };
    handle.modify(|filter| *filter = std::mem::take(filter).add_directive(directive))?;
    Ok(true)
}

/// Parse log level string to tracing Level
pub(crate) fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
