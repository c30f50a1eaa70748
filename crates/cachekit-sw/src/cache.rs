//! Cache Storage: named partitions of request → response pairs.
//!
//! Every write carries a [`WriteTicket`] taken before the network work
//! started. Purging partitions bumps the storage generation, so a write
//! whose ticket predates the purge is dropped instead of resurrecting a
//! deleted partition.

use cachekit_net::Response;
use hashbrown::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// Size and lifetime bounds of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Oldest entries are evicted beyond this count.
    pub max_entries: Option<usize>,
    /// Entries older than this are misses.
    pub max_age: Option<Duration>,
}

/// A cache partition. Keys are kept in insertion order; re-putting a key
/// moves it to the back.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
    order: Vec<String>,
    policy: CachePolicy,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn set_policy(&mut self, policy: CachePolicy) {
        self.policy = policy;
        self.trim();
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Match a request, ignoring entries older than the max age.
    pub fn match_request(&self, url: &str, now_ms: u64) -> Option<&CacheEntry> {
        let entry = self.entries.get(url)?;
        if let Some(max_age) = self.policy.max_age {
            if now_ms.saturating_sub(entry.cached_at) > max_age.as_millis() as u64 {
                trace!(cache = %self.name, url, "Entry expired");
                return None;
            }
        }
        Some(entry)
    }

    /// Add entry, evicting the oldest entries beyond the limit.
    pub fn put(&mut self, entry: CacheEntry) {
        let url = entry.url.clone();
        if self.entries.insert(url.clone(), entry).is_some() {
            self.order.retain(|k| k != &url);
        }
        self.order.push(url);
        self.trim();
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &str) -> bool {
        if self.entries.remove(url).is_some() {
            self.order.retain(|k| k != url);
            true
        } else {
            false
        }
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of stored body sizes.
    pub fn size_bytes(&self) -> usize {
        self.entries.values().map(|e| e.response.body.len()).sum()
    }

    fn trim(&mut self) {
        let Some(max) = self.policy.max_entries else {
            return;
        };
        while self.order.len() > max {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
            debug!(cache = %self.name, url = %oldest, "Evicted oldest entry");
        }
    }
}

/// Proof that a write was started in a given storage generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket {
    generation: u64,
}

/// Cache storage (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    generation: u64,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All cache names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.caches.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Match across all caches, in name order.
    pub fn match_request(&self, url: &str, now_ms: u64) -> Option<&CacheEntry> {
        self.keys()
            .into_iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(url, now_ms))
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ticket for a write about to start.
    pub fn ticket(&self) -> WriteTicket {
        WriteTicket {
            generation: self.generation,
        }
    }

    /// Whether no purge happened since `ticket` was taken.
    pub fn is_current(&self, ticket: WriteTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Commit `response` under `url` into `name` if no purge happened since
    /// `ticket` was taken. Returns whether the entry was stored.
    pub fn put_if_current(
        &mut self,
        ticket: WriteTicket,
        name: &str,
        policy: CachePolicy,
        url: &str,
        response: Response,
        now_ms: u64,
    ) -> bool {
        if !self.is_current(ticket) {
            debug!(
                cache = name,
                url,
                ticket = ticket.generation,
                current = self.generation,
                "Dropping write from a purged generation"
            );
            return false;
        }

        let cache = self.open(name);
        if cache.policy() != policy {
            cache.set_policy(policy);
        }
        cache.put(CacheEntry {
            url: url.to_string(),
            response,
            cached_at: now_ms,
        });
        true
    }

    /// Delete every cache not named in `keep`. Always starts a new
    /// generation. Returns the deleted names.
    pub fn retain_only(&mut self, keep: &[String]) -> Vec<String> {
        let mut stale: Vec<String> = self
            .caches
            .keys()
            .filter(|name| !keep.contains(name))
            .cloned()
            .collect();
        stale.sort_unstable();

        for name in &stale {
            self.caches.remove(name);
        }
        self.generation += 1;
        stale
    }

    /// Delete every cache and start a new generation. Returns the deleted
    /// names.
    pub fn clear(&mut self) -> Vec<String> {
        self.retain_only(&[])
    }

    /// Total stored body bytes.
    pub fn total_size(&self) -> usize {
        self.caches.values().map(|c| c.size_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn entry(url: &str, body: &'static str, cached_at: u64) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            response: Response::new(StatusCode::OK, body),
            cached_at,
        }
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("static-v1");

        cache.put(entry("https://shop.test/style.css", "body{}", 0));

        assert!(cache.match_request("https://shop.test/style.css", 0).is_some());
        assert!(cache.match_request("https://shop.test/other.css", 0).is_none());
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("static-v1");

        cache.put(entry("https://shop.test/style.css", "body{}", 0));
        assert!(cache.delete("https://shop.test/style.css"));
        assert!(cache.match_request("https://shop.test/style.css", 0).is_none());
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        let mut cache = Cache::new("images-v1");
        cache.set_policy(CachePolicy {
            max_entries: Some(2),
            max_age: None,
        });

        cache.put(entry("a", "1", 0));
        cache.put(entry("b", "2", 0));
        cache.put(entry("a", "1'", 0));
        cache.put(entry("c", "3", 0));

        assert_eq!(cache.keys(), vec!["a", "c"]);
    }

    #[test]
    fn test_max_age() {
        let mut cache = Cache::new("dynamic-v1");
        cache.set_policy(CachePolicy {
            max_entries: None,
            max_age: Some(Duration::from_secs(60)),
        });
        cache.put(entry("page", "<html>", 1_000));

        assert!(cache.match_request("page", 61_000).is_some());
        assert!(cache.match_request("page", 61_001).is_none());
    }

    #[test]
    fn test_cache_storage() {
        let mut storage = CacheStorage::new();

        assert!(!storage.has("v1"));

        storage.open("v1");
        assert!(storage.has("v1"));

        assert!(storage.delete("v1"));
        assert!(!storage.has("v1"));
    }

    #[test]
    fn test_stale_ticket_is_dropped() {
        let mut storage = CacheStorage::new();
        let before = storage.ticket();

        let deleted = storage.retain_only(&["static-v2".to_string()]);
        assert!(deleted.is_empty());
        assert!(!storage.is_current(before));

        let stored = storage.put_if_current(
            before,
            "images-v1",
            CachePolicy::default(),
            "https://cdn.shopify.com/car.webp",
            Response::new(StatusCode::OK, "img"),
            0,
        );
        assert!(!stored);
        assert!(!storage.has("images-v1"));

        let after = storage.ticket();
        assert!(storage.put_if_current(
            after,
            "images-v2",
            CachePolicy::default(),
            "https://cdn.shopify.com/car.webp",
            Response::new(StatusCode::OK, "img"),
            0,
        ));
        assert_eq!(storage.total_size(), 3);
    }

    #[test]
    fn test_retain_only_reports_deleted() {
        let mut storage = CacheStorage::new();
        storage.open("static-v1");
        storage.open("static-v2");
        storage.open("dynamic-v1");

        let deleted = storage.retain_only(&["static-v2".to_string()]);

        assert_eq!(deleted, vec!["dynamic-v1", "static-v1"]);
        assert_eq!(storage.keys(), vec!["static-v2"]);
    }

    #[test]
    fn test_match_across_caches() {
        let mut storage = CacheStorage::new();
        storage.open("dynamic-v1").put(entry("https://shop.test/", "home", 0));

        let found = storage.match_request("https://shop.test/", 0).unwrap();
        assert_eq!(found.response.body.as_ref(), b"home");
    }
}
