use cachekit_common::CacheKitError;
use cachekit_net::NetError;
use cachekit_storage::{IdbError, StorageError};
use cachekit_sw::ServiceWorkerError;
use thiserror::Error;

/// Failures inside controller operations. Public operations log these and
/// report `false`/`None` instead of returning them.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Service worker error: {0}")]
    ServiceWorker(#[from] ServiceWorkerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IndexedDB error: {0}")]
    IndexedDb(#[from] IdbError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP {0}")]
    Status(http::StatusCode),

    #[error(transparent)]
    Common(#[from] CacheKitError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
