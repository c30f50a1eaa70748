//! IndexedDB factory (`window.indexedDB`).
//!
//! Only the surface the page needs: open databases, enumerate them and
//! delete whole databases. A database with open connections cannot be
//! deleted.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ==================== Errors ====================

/// IndexedDB errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdbError {
    #[error("Version error: {0}")]
    Version(String),

    #[error("Delete blocked: {name} has {open} open connection(s)")]
    Blocked { name: String, open: usize },
}

// ==================== Database ====================

/// A database.
#[derive(Debug)]
pub struct IdbDatabase {
    /// Database name.
    pub name: String,

    /// Version.
    pub version: u64,

    connections: Arc<AtomicUsize>,
}

impl IdbDatabase {
    fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn open_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// An open connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct IdbConnection {
    pub name: String,
    pub version: u64,
    counter: Arc<AtomicUsize>,
}

impl Drop for IdbConnection {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

// ==================== Factory ====================

/// Database info for the `databases()` API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

/// IdbFactory (`window.indexedDB`).
#[derive(Default)]
pub struct IdbFactory {
    databases: Arc<RwLock<HashMap<String, IdbDatabase>>>,
}

impl IdbFactory {
    /// Create a new factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (creating or upgrading) a database.
    pub async fn open(&self, name: &str, version: Option<u64>) -> Result<IdbConnection, IdbError> {
        let mut databases = self.databases.write().await;

        let current_version = databases.get(name).map(|db| db.version).unwrap_or(0);
        let requested_version = version.unwrap_or(current_version.max(1));

        if requested_version < current_version {
            return Err(IdbError::Version(format!(
                "Requested version {} is less than current version {}",
                requested_version, current_version
            )));
        }

        if requested_version > current_version {
            debug!(
                db = name,
                old_version = current_version,
                new_version = requested_version,
                "Upgrade needed"
            );
        }

        let db = databases
            .entry(name.to_string())
            .or_insert_with(|| IdbDatabase::new(name, requested_version));
        db.version = requested_version;
        db.connections.fetch_add(1, Ordering::SeqCst);

        Ok(IdbConnection {
            name: name.to_string(),
            version: requested_version,
            counter: Arc::clone(&db.connections),
        })
    }

    /// Delete a database. Deleting a missing database succeeds.
    pub async fn delete_database(&self, name: &str) -> Result<(), IdbError> {
        let mut databases = self.databases.write().await;

        if let Some(db) = databases.get(name) {
            let open = db.open_connections();
            if open > 0 {
                warn!(db = name, open, "deleteDatabase blocked");
                return Err(IdbError::Blocked {
                    name: name.to_string(),
                    open,
                });
            }
        }

        if databases.remove(name).is_some() {
            debug!(db = name, "Database deleted");
        }
        Ok(())
    }

    /// List databases, sorted by name.
    pub async fn databases(&self) -> Vec<DatabaseInfo> {
        let databases = self.databases.read().await;
        let mut infos: Vec<_> = databases
            .iter()
            .map(|(name, db)| DatabaseInfo {
                name: name.clone(),
                version: db.version,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
