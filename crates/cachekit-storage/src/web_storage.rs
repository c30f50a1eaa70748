//! `localStorage` / `sessionStorage`.

use hashbrown::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Default quota per storage area, as in most browsers.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Web Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },
}

/// Which storage area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Session,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "localStorage",
            StorageKind::Session => "sessionStorage",
        }
    }
}

/// A string key/value storage area.
#[derive(Debug, Clone)]
pub struct WebStorage {
    kind: StorageKind,
    items: HashMap<String, String>,
    quota_bytes: usize,
}

impl WebStorage {
    pub fn new(kind: StorageKind) -> Self {
        Self::with_quota(kind, DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(kind: StorageKind, quota_bytes: usize) -> Self {
        Self {
            kind,
            items: HashMap::new(),
            quota_bytes,
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn get_item(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(|s| s.as_str())
    }

    /// Store a value, failing if the area would exceed its quota.
    pub fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let existing = self.items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let needed = key.len() + value.len();
        let available = self.quota_bytes - (self.used_bytes() - existing);

        if needed > available {
            return Err(StorageError::QuotaExceeded { needed, available });
        }

        trace!(storage = self.kind.as_str(), key, "setItem");
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_item(&mut self, key: &str) -> Option<String> {
        self.items.remove(key)
    }

    /// Remove every item.
    pub fn clear(&mut self) {
        debug!(storage = self.kind.as_str(), removed = self.items.len(), "Storage cleared");
        self.items.clear();
    }

    /// Remove every item except `preserved` keys.
    pub fn clear_except(&mut self, preserved: &[String]) {
        let before = self.items.len();
        self.items.retain(|key, _| preserved.iter().any(|p| p == key));
        debug!(
            storage = self.kind.as_str(),
            removed = before - self.items.len(),
            kept = self.items.len(),
            "Storage cleared"
        );
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.items.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bytes used by keys and values.
    pub fn used_bytes(&self) -> usize {
        self.items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut storage = WebStorage::new(StorageKind::Local);

        storage.set_item("theme", "dark").unwrap();
        assert_eq!(storage.get_item("theme"), Some("dark"));

        assert_eq!(storage.remove_item("theme"), Some("dark".to_string()));
        assert!(storage.get_item("theme").is_none());
    }

    #[test]
    fn test_clear_except_keeps_preserved() {
        let mut storage = WebStorage::new(StorageKind::Local);
        storage.set_item("savedCars", "[1,2,3]").unwrap();
        storage.set_item("app-last-check", "1700000000000").unwrap();
        storage.set_item("consent", "yes").unwrap();

        storage.clear_except(&["savedCars".to_string()]);

        assert_eq!(storage.keys(), vec!["savedCars"]);
        assert_eq!(storage.get_item("savedCars"), Some("[1,2,3]"));
    }

    #[test]
    fn test_quota() {
        let mut storage = WebStorage::with_quota(StorageKind::Session, 10);

        storage.set_item("k", "12345").unwrap();
        let err = storage.set_item("other", "123456").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));

        // Overwriting an item only counts the difference.
        storage.set_item("k", "123456789").unwrap();
        assert_eq!(storage.used_bytes(), 10);
    }

    #[test]
    fn test_clear() {
        let mut storage = WebStorage::new(StorageKind::Session);
        storage.set_item("a", "1").unwrap();
        storage.clear();
        assert!(storage.is_empty());
    }
}
