//! # CacheKit Storage
//!
//! Page-owned storage areas that the Cache Controller mutates directly.
//!
//! ## Features
//!
//! - **Web Storage**: `localStorage` / `sessionStorage` with a byte quota
//! - **IndexedDB**: `indexedDB.open()`, `databases()`, `deleteDatabase()`
//!
//! ## Architecture
//!
//! ```text
//! Page
//!  ├── localStorage   (WebStorage, StorageKind::Local)
//!  ├── sessionStorage (WebStorage, StorageKind::Session)
//!  └── indexedDB      (IdbFactory)
//!          └── IdbDatabase ← IdbConnection
//! ```
//!
//! Cache Storage partitions are not here: they belong to the worker.

pub mod idb;
pub mod web_storage;

pub use idb::{DatabaseInfo, IdbConnection, IdbDatabase, IdbError, IdbFactory};
pub use web_storage::{StorageError, StorageKind, WebStorage};
