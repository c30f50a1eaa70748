//! Request classification.
//!
//! Both functions here are pure: they look only at the method, the URL and
//! the worker configuration, never at Cache Storage.

use cachekit_common::WorkerConfig;
use http::Method;
use url::Url;

/// Path prefixes that always go straight to the network.
const SKIP_PATH_PREFIXES: &[&str] = &["/api/revalidate", "/api/analytics"];

/// Query markers that always go straight to the network.
const SKIP_QUERY_MARKERS: &[&str] = &["no-cache", "_refresh"];

const API_PREFIX: &str = "/api/";
const STATIC_EXTENSIONS: &[&str] = &["css", "js", "woff", "woff2", "ico"];
const IMAGE_EXTENSIONS: &[&str] = &["webp", "jpg", "jpeg", "png", "svg"];

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    NetworkOnly,
    CacheFirst,
    StaleWhileRevalidate,
    NetworkFirst,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::NetworkOnly => "network-only",
            Strategy::CacheFirst => "cache-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::NetworkFirst => "network-first",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition class. The versioned cache name is `<prefix>-<version>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionClass {
    Static,
    Dynamic,
    Images,
}

impl PartitionClass {
    pub const ALL: [PartitionClass; 3] = [
        PartitionClass::Static,
        PartitionClass::Dynamic,
        PartitionClass::Images,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            PartitionClass::Static => "static",
            PartitionClass::Dynamic => "dynamic",
            PartitionClass::Images => "images",
        }
    }

    /// Versioned cache name.
    pub fn cache_name(&self, version: &str) -> String {
        format!("{}-{}", self.prefix(), version)
    }
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub strategy: Strategy,
    pub partition: Option<PartitionClass>,
}

impl Route {
    const fn new(strategy: Strategy, partition: Option<PartitionClass>) -> Self {
        Self { strategy, partition }
    }
}

/// Requests matching this never touch Cache Storage.
pub fn should_skip_cache(method: &Method, url: &Url) -> bool {
    if method != Method::GET {
        return true;
    }

    let path = url.path();
    if SKIP_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return true;
    }

    url.query()
        .is_some_and(|q| SKIP_QUERY_MARKERS.iter().any(|m| q.contains(m)))
}

/// Pick the strategy and partition for a request.
pub fn classify(method: &Method, url: &Url, config: &WorkerConfig) -> Route {
    let path = url.path();

    if method != Method::GET || path.starts_with(API_PREFIX) {
        return Route::new(Strategy::NetworkOnly, None);
    }

    let extension = extension(path);
    let has_extension = |set: &[&str]| extension.as_deref().is_some_and(|e| set.contains(&e));

    if path.starts_with(&config.static_prefix) || has_extension(STATIC_EXTENSIONS) {
        return Route::new(Strategy::CacheFirst, Some(PartitionClass::Static));
    }

    if has_extension(IMAGE_EXTENSIONS) || is_image_host(url, &config.image_hosts) {
        return Route::new(Strategy::StaleWhileRevalidate, Some(PartitionClass::Images));
    }

    Route::new(Strategy::NetworkFirst, Some(PartitionClass::Dynamic))
}

/// Lowercased extension of the last path segment.
fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn is_image_host(url: &Url, hosts: &[String]) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    hosts.iter().any(|h| {
        host == h
            || host
                .strip_suffix(h.as_str())
                .is_some_and(|rest| rest.ends_with('.'))
    })
}
