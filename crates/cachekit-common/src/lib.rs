//! # CacheKit Common
//!
//! Error types, logging setup, configuration and clocks shared by the
//! CacheKit crates.
//!
//! ## Features
//!
//! - Unified error type with source chaining and backtraces on internal errors
//! - Logging configuration and setup
//! - Worker and controller configuration with JSON loading
//! - Injectable clocks and timeout helpers

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod time;

pub use config::{CacheKitConfig, ControllerConfig, PartitionLimits, PartitionMaxAge, WorkerConfig};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use time::{with_timeout, Clock, ManualClock, SystemClock};

/// Unified error type for CacheKit.
#[derive(Error, Debug)]
pub enum CacheKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl CacheKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CacheKitError::Config { .. } => "config",
            CacheKitError::Timeout(_) => "timeout",
            CacheKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for CacheKit operations.
pub type Result<T> = std::result::Result<T, CacheKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CacheKitError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}
