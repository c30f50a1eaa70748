//! Tracing setup for CacheKit binaries and tests.
//!
//! [`LogConfig`] is the `log` section of `cachekit.json`. Cache decisions
//! (hits, misses, dropped writes, purges) are logged at `debug` under the
//! `cachekit_sw` target, so the presets differ mostly in how much of that
//! they let through.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Filter used by [`LogConfig::trace`]: every routing decision, network
/// calls at debug, everything else at info.
const CACHE_TRACE_FILTER: &str = "cachekit_sw=trace,cachekit_net=debug,info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One line per event; what the smoke harness uses in CI logs.
    Compact,
    Json,
}

/// Logging section of the config file. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when neither `filter` nor `RUST_LOG` is set.
    #[serde(with = "level_serde")]
    pub level: Level,
    pub format: LogFormat,
    /// Source file and line on each event.
    pub include_location: bool,
    /// Span enter/close events, useful for timing strategies.
    pub include_span_events: bool,
    /// Explicit `EnvFilter` directives. Takes precedence over `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Debug level with source locations.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            ..Default::default()
        }
    }

    /// Every cache routing decision, with span timings.
    pub fn trace() -> Self {
        Self {
            level: Level::TRACE,
            include_location: true,
            include_span_events: true,
            filter: Some(CACHE_TRACE_FILTER.to_string()),
            ..Default::default()
        }
    }

    /// JSON lines at info.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// An unparsable `filter` falls back to `level` rather than failing
    /// startup.
    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string());
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already
/// installed, which happens when several tests in one binary call this.
pub fn init_logging(config: LogConfig) -> bool {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let installed = match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_target(true)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json().with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    installed.is_ok()
}

mod level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<Level>().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_debug() {
        let config = LogConfig::debug();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_location);
    }

    #[test]
    fn test_trace_preset_targets_cache_crates() {
        let config = LogConfig::trace();
        assert_eq!(config.level, Level::TRACE);
        assert!(config.include_span_events);
        assert_eq!(config.filter.as_deref(), Some(CACHE_TRACE_FILTER));
    }

    #[test]
    fn test_second_init_reports_false() {
        init_logging(LogConfig::default());
        assert!(!init_logging(LogConfig::debug()));
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::default().with_filter("cachekit_sw=debug");
        assert_eq!(config.filter, Some("cachekit_sw=debug".to_string()));
    }

    #[test]
    fn test_log_config_from_json() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level": "warn", "format": "json"}"#).unwrap();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_log_config_rejects_unknown_level() {
        let result = serde_json::from_str::<LogConfig>(r#"{"level": "loud"}"#);
        assert!(result.is_err());
    }
}
