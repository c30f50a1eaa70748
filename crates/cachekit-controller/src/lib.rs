//! # CacheKit Controller
//!
//! The page half of CacheKit. [`CacheController`] decides when to clear
//! caches, force reloads, check for updates and ask the origin to
//! revalidate, and reports cache state to the UI.
//!
//! ## Features
//!
//! - **Cache busting**: `?v=<build>-<timestamp>` on asset URLs
//! - **Full clear**: worker partitions, web storage (minus preserved keys),
//!   IndexedDB
//! - **Update checker**: worker script changes and server version changes
//! - **Revalidation**: `POST /api/revalidate`
//! - **Header presets**: `Cache-Control` sets for server responses
//!
//! Outside a browser context ([`CacheController::server`]) every operation
//! is a no-op that reports `false` or `None`.

mod controller;
pub mod error;
pub mod headers;
pub mod page;
mod revalidate;
mod update;

pub use controller::{CacheController, PageCacheInfo, ServiceWorkerStatus, UpdateNotice};
pub use error::{ControllerError, Result};
pub use headers::{get_cache_headers, CachePreset};
pub use page::{DisplayMode, Host, HostCall, Page, PageBuilder, Permission, ScriptedHost};
pub use revalidate::{RevalidateRequest, RevalidateResponse, Revalidated, RevalidatedPath};
