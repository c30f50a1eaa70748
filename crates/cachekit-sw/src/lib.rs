//! # CacheKit Service Worker
//!
//! The worker half of CacheKit: a cache router that intercepts every page
//! request and serves it through exactly one caching strategy, plus the
//! page-side container that registers, updates and messages it.
//!
//! ## Features
//!
//! - **Classification**: pure `{method, url}` → strategy + partition
//! - **Strategies**: network-only, cache-first, stale-while-revalidate,
//!   network-first
//! - **Versioned partitions**: `static-<v>`, `dynamic-<v>`, `images-<v>`
//! - **Generation tickets**: writes started before a purge are dropped
//! - **Control channel**: `CLEAR_CACHE`, `UPDATE_CACHE`, `GET_CACHE_INFO`,
//!   `SKIP_WAITING`
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (navigator.serviceWorker)
//!     │
//!     └── ServiceWorkerRegistration
//!             ├── installing / waiting / active (ServiceWorker)
//!             │       └── WorkerCacheRouter ── message loop
//!             └── scope
//!
//! CacheStorage (caches, shared by every worker generation)
//!     └── Cache (partition)
//!             └── URL → Response
//! ```

pub mod cache;
pub mod container;
pub mod lifecycle;
pub mod message;
mod offline;
pub mod route;
pub mod router;
mod strategy;

pub use cache::{Cache, CacheEntry, CachePolicy, CacheStorage, WriteTicket};
pub use container::{
    RegistrationInfo, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent, UpdateOutcome,
};
pub use lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
pub use message::{CacheInfo, ControlMessage, MessagePort, PartitionInfo, PortId, WorkerMessage};
pub use route::{classify, should_skip_cache, PartitionClass, Route, Strategy};
pub use router::{MessageOutcome, WorkerCacheRouter};

use cachekit_net::NetError;
use http::StatusCode;
use thiserror::Error;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Bad status {status} for {url}")]
    BadStatus { url: String, status: StatusCode },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message port {0} closed")]
    PortClosed(u64),

    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}
