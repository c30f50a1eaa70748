//! `Cache-Control` header sets for server responses.

use http::header::{HeaderName, CACHE_CONTROL, EXPIRES, PRAGMA, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, HeaderValue};

const NO_CACHE: &str = "no-cache, no-store, must-revalidate, max-age=0";

/// `Service-Worker-Allowed`.
pub static SERVICE_WORKER_ALLOWED: HeaderName = HeaderName::from_static("service-worker-allowed");

/// `X-Timestamp`.
pub static X_TIMESTAMP: HeaderName = HeaderName::from_static("x-timestamp");

/// `public, max-age=<n>[, must-revalidate]` for `max_age > 0`, otherwise the
/// no-cache triad.
pub fn get_cache_headers(max_age: u64, must_revalidate: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if max_age > 0 {
        let suffix = if must_revalidate { ", must-revalidate" } else { "" };
        insert(&mut headers, CACHE_CONTROL, format!("public, max-age={max_age}{suffix}"));
    } else {
        no_cache(&mut headers, NO_CACHE);
    }
    headers
}

/// Named header presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePreset {
    /// HTML pages: always fresh.
    NoCache,
    /// Fingerprinted assets.
    Static,
    Images,
    Api,
    /// Sitemaps, feeds.
    Short,
    ServiceWorker,
}

impl CachePreset {
    /// Parse a preset name (`no-cache`, `static`, `images`, `api`, `short`,
    /// `sw`).
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "no-cache" => CachePreset::NoCache,
            "static" => CachePreset::Static,
            "images" => CachePreset::Images,
            "api" => CachePreset::Api,
            "short" => CachePreset::Short,
            "sw" => CachePreset::ServiceWorker,
            _ => return None,
        })
    }

    /// Default max-age in seconds.
    pub fn default_max_age(&self) -> u64 {
        match self {
            CachePreset::Static => 31_536_000,
            CachePreset::Images => 2_592_000,
            CachePreset::Short => 3_600,
            CachePreset::NoCache | CachePreset::Api | CachePreset::ServiceWorker => 0,
        }
    }

    /// Header set for this preset. `max_age` of `None` or `Some(0)` takes
    /// the preset default. `now_millis` fills `X-Timestamp` on `NoCache`.
    pub fn headers(&self, max_age: Option<u64>, now_millis: u64) -> HeaderMap {
        let max_age = max_age.filter(|n| *n > 0).unwrap_or(self.default_max_age());
        let mut headers = HeaderMap::new();

        match self {
            CachePreset::NoCache => {
                no_cache(&mut headers, NO_CACHE);
                insert(&mut headers, X_TIMESTAMP.clone(), now_millis.to_string());
            }
            CachePreset::Static => {
                insert(&mut headers, CACHE_CONTROL, format!("public, max-age={max_age}, immutable"));
                nosniff(&mut headers);
            }
            CachePreset::Images => {
                insert(
                    &mut headers,
                    CACHE_CONTROL,
                    format!("public, max-age={max_age}, stale-while-revalidate=86400"),
                );
                nosniff(&mut headers);
            }
            CachePreset::Api if max_age > 0 => {
                insert(&mut headers, CACHE_CONTROL, format!("public, max-age={max_age}, must-revalidate"));
                nosniff(&mut headers);
            }
            CachePreset::Api => no_cache(&mut headers, "no-cache, no-store, must-revalidate"),
            CachePreset::Short => {
                insert(&mut headers, CACHE_CONTROL, format!("public, max-age={max_age}, must-revalidate"));
            }
            CachePreset::ServiceWorker => {
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=0, must-revalidate"));
                headers.insert(SERVICE_WORKER_ALLOWED.clone(), HeaderValue::from_static("/"));
            }
        }
        headers
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: String) {
    // Formatted from integers and fixed text, always valid.
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

fn no_cache(headers: &mut HeaderMap, cache_control: &'static str) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}

fn nosniff(headers: &mut HeaderMap) {
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
}
