//! CacheKit configuration

use crate::logging::LogConfig;
use crate::{CacheKitError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheKitConfig {
    /// Worker Cache Router settings (also served as the worker script)
    pub worker: WorkerConfig,

    /// Cache Controller settings
    pub controller: ControllerConfig,

    /// Logging settings
    pub log: LogConfig,
}

impl CacheKitConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CacheKitError::config_with_source(format!("invalid config {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.controller.validate()
    }
}

/// Worker Cache Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache version embedded in every partition name
    pub version: String,

    /// App-shell assets precached into the static partition on install
    pub static_assets: Vec<String>,

    /// Page served for offline navigations
    pub offline_page: String,

    /// Path prefix of the bundler's static-asset directory
    pub static_prefix: String,

    /// Third-party image hosts (matched by suffix)
    pub image_hosts: Vec<String>,

    /// Entry limits per partition
    pub limits: PartitionLimits,

    /// Entry lifetimes per partition, in seconds
    pub max_age: PartitionMaxAge,
}

/// Maximum entries per partition (`None` means unbounded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionLimits {
    pub static_entries: Option<usize>,
    pub dynamic_entries: Option<usize>,
    pub image_entries: Option<usize>,
}

/// Entry lifetime per partition, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionMaxAge {
    pub static_secs: u64,
    pub dynamic_secs: u64,
    pub image_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "v2026-1.0.1".to_string(),
            static_assets: [
                "/",
                "/offline.html",
                "/manifest.json",
                "/favicon.webp",
                "/favicon.png",
                "/favicon.ico",
                "/logo/logo_favicon.webp",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_page: "/offline.html".to_string(),
            static_prefix: "/_next/static/".to_string(),
            image_hosts: vec!["shopify.com".to_string()],
            limits: PartitionLimits::default(),
            max_age: PartitionMaxAge::default(),
        }
    }
}

impl Default for PartitionLimits {
    fn default() -> Self {
        Self {
            static_entries: None,
            dynamic_entries: Some(100),
            image_entries: Some(200),
        }
    }
}

impl Default for PartitionMaxAge {
    fn default() -> Self {
        Self {
            static_secs: 365 * DAY_SECS,
            dynamic_secs: 7 * DAY_SECS,
            image_secs: 30 * DAY_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(CacheKitError::config("worker version must not be empty"));
        }
        if !self.static_assets.iter().any(|a| a == &self.offline_page) {
            return Err(CacheKitError::config(format!(
                "offline page {} is not precached",
                self.offline_page
            )));
        }
        Ok(())
    }
}

/// Cache Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Build identifier used to cache-bust URLs
    pub build_time: String,

    /// Update check period in seconds
    pub update_interval_secs: u64,

    /// Health endpoint polled by the update checker
    pub health_path: String,

    /// Health request timeout in seconds
    pub health_timeout_secs: u64,

    /// Origin revalidation endpoint
    pub revalidate_path: String,

    /// localStorage key holding the last check time (epoch millis)
    pub last_check_key: String,

    /// localStorage key holding the last seen server version
    pub version_key: String,

    /// localStorage keys that survive a full cache clear
    pub preserved_keys: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            build_time: "dev".to_string(),
            update_interval_secs: 30,
            health_path: "/api/health".to_string(),
            health_timeout_secs: 10,
            revalidate_path: "/api/revalidate".to_string(),
            last_check_key: "app-last-check".to_string(),
            version_key: "app-version".to_string(),
            preserved_keys: vec!["savedCars".to_string()],
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.update_interval_secs == 0 {
            return Err(CacheKitError::config("update interval must be positive"));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}
