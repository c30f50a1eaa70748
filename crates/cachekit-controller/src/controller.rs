//! The Cache Controller: page-side cache policy.
//!
//! Every public operation is infallible from the caller's point of view.
//! Failures are logged and reported as `false` or `None`. Outside a browser
//! context (no [`Page`]) operations are no-ops.

use std::sync::Arc;

use cachekit_common::{with_timeout, Clock, ControllerConfig, SystemClock};
use cachekit_storage::IdbFactory;
use cachekit_sw::{CacheInfo, ControlMessage, MessagePort, ServiceWorker};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::Result;
use crate::page::{Page, Permission};

pub(crate) const UPDATE_TITLE: &str = "Update available";
pub(crate) const UPDATE_BODY: &str = "A new version is available. Refresh to get the latest content.";
pub(crate) const UPDATE_CONFIRM: &str = "A new version is available. Reload now?";

/// Service worker status in [`PageCacheInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceWorkerStatus {
    NotAvailable,
    Active,
    Inactive,
}

/// Snapshot returned by [`CacheController::get_cache_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCacheInfo {
    #[serde(rename = "isPWA")]
    pub is_pwa: bool,
    pub has_service_worker: bool,
    pub local_storage: bool,
    pub session_storage: bool,
    #[serde(rename = "indexedDB")]
    pub indexed_db: bool,
    pub service_worker_status: ServiceWorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_worker_scope: Option<String>,
}

/// How an available update was surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateNotice {
    /// Native notification shown.
    Notified,
    /// The user accepted the confirm dialog and the page was refreshed.
    Refreshed,
    /// The user declined the confirm dialog.
    Dismissed,
    /// Not in a browser context.
    Unavailable,
}

/// Page-side cache controller. Cloning shares the page.
#[derive(Clone)]
pub struct CacheController {
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) page: Option<Arc<Page>>,
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("build_time", &self.config.build_time)
            .field("page", &self.page)
            .finish()
    }
}

impl CacheController {
    /// Create a controller for `page`. `None` models a server render.
    pub fn new(config: ControllerConfig, page: Option<Page>) -> Self {
        Self {
            config: Arc::new(config),
            page: page.map(Arc::new),
        }
    }

    /// A controller outside any browser context.
    pub fn server(config: ControllerConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn page(&self) -> Option<&Arc<Page>> {
        self.page.as_ref()
    }

    pub fn is_client(&self) -> bool {
        self.page.is_some()
    }

    fn now_millis(&self) -> u64 {
        match &self.page {
            Some(page) => page.now_millis(),
            None => SystemClock.now_millis(),
        }
    }

    // ==================== Cache busting ====================

    /// `<build>-<timestamp>`.
    pub fn get_cache_version(&self) -> String {
        format!("{}-{}", self.config.build_time, self.now_millis())
    }

    /// Append `v=<cache version>` to `url`, keeping any fragment last.
    pub fn cache_bust_url(&self, url: &str) -> String {
        if !self.is_client() || url.is_empty() {
            return url.to_string();
        }

        let (base, fragment) = match url.split_once('#') {
            Some((base, fragment)) => (base, Some(fragment)),
            None => (url, None),
        };
        let separator = if base.contains('?') { '&' } else { '?' };
        let mut busted = format!("{base}{separator}v={}", self.get_cache_version());
        if let Some(fragment) = fragment {
            busted.push('#');
            busted.push_str(fragment);
        }
        busted
    }

    // ==================== Clearing ====================

    /// Clear worker caches, web storage (keeping preserved keys) and
    /// IndexedDB.
    pub async fn clear_all_caches(&self) -> bool {
        let Some(page) = &self.page else {
            return false;
        };

        match self.try_clear_all(page).await {
            Ok(()) => {
                info!("All caches cleared successfully");
                true
            }
            Err(e) => {
                error!(error = %e, "Error clearing caches");
                false
            }
        }
    }

    async fn try_clear_all(&self, page: &Page) -> Result<()> {
        if let Some(worker) = controller_worker(page).await {
            worker.post_message(ControlMessage::ClearCache.to_json(), None)?;
        }

        if let Some(local) = page.local_storage() {
            local.lock().await.clear_except(&self.config.preserved_keys);
        }
        if let Some(session) = page.session_storage() {
            session.lock().await.clear();
        }
        if let Some(idb) = page.indexed_db() {
            clear_indexed_db(idb).await;
        }
        Ok(())
    }

    /// Clear everything, unregister every worker, and navigate to the
    /// current URL with `_refresh=<timestamp>`.
    pub async fn force_refresh(&self) -> bool {
        let Some(page) = &self.page else {
            return false;
        };

        match self.try_force_refresh(page).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Force refresh failed");
                false
            }
        }
    }

    async fn try_force_refresh(&self, page: &Page) -> Result<()> {
        if !self.clear_all_caches().await {
            warn!("Cache clear incomplete, refreshing anyway");
        }

        if let Some(container) = page.service_worker() {
            for registration in container.get_registrations().await {
                container.unregister(registration.scope.as_str()).await?;
            }
        }

        let url = with_query_param(&page.location().await, "_refresh", &page.now_millis().to_string());
        info!(url = %url, "Force refreshing");
        page.navigate(url).await;
        Ok(())
    }

    /// Navigate to the current URL with `_t=<timestamp>`.
    pub async fn force_reload(&self) {
        let Some(page) = &self.page else {
            return;
        };
        let url = with_query_param(&page.location().await, "_t", &page.now_millis().to_string());
        page.navigate(url).await;
    }

    // ==================== Status ====================

    /// Whether the page runs as an installed app.
    pub fn is_pwa(&self) -> bool {
        let Some(page) = &self.page else {
            return false;
        };
        page.matches_standalone()
            || page.ios_standalone() == Some(true)
            || page.referrer().contains("android-app://")
    }

    pub async fn get_cache_info(&self) -> Option<PageCacheInfo> {
        let page = self.page.as_ref()?;

        let mut info = PageCacheInfo {
            is_pwa: self.is_pwa(),
            has_service_worker: page.service_worker().is_some(),
            local_storage: page.local_storage().is_some(),
            session_storage: page.session_storage().is_some(),
            indexed_db: page.indexed_db().is_some(),
            service_worker_status: ServiceWorkerStatus::NotAvailable,
            service_worker_scope: None,
        };

        if let Some(container) = page.service_worker() {
            let location = page.location().await;
            if let Some(registration) = container.get_registration(location.as_str()).await {
                info.service_worker_status = if registration.active {
                    ServiceWorkerStatus::Active
                } else {
                    ServiceWorkerStatus::Inactive
                };
                info.service_worker_scope = Some(registration.scope.to_string());
            }
        }
        Some(info)
    }

    /// Tell the user about an update: a notification when permitted,
    /// otherwise a confirm dialog that refreshes on accept.
    pub async fn notify_update_available(&self) -> UpdateNotice {
        let Some(page) = &self.page else {
            return UpdateNotice::Unavailable;
        };
        let host = page.host();

        if host.notification_permission() == Some(Permission::Granted) {
            host.show_notification(UPDATE_TITLE, UPDATE_BODY);
            return UpdateNotice::Notified;
        }

        if host.confirm(UPDATE_CONFIRM) {
            self.force_refresh().await;
            UpdateNotice::Refreshed
        } else {
            UpdateNotice::Dismissed
        }
    }

    // ==================== Worker protocol ====================

    /// Ask the controlling worker for its cache info.
    pub async fn worker_cache_info(&self) -> Option<CacheInfo> {
        let worker = controller_worker(self.page.as_ref()?).await?;
        let (mut reply, port) = MessagePort::create_pair();

        if let Err(e) = worker.post_message(ControlMessage::GetCacheInfo.to_json(), Some(port)) {
            warn!(error = %e, "Could not request cache info");
            return None;
        }

        match with_timeout(self.config.health_timeout(), || reply.recv()).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .map_err(|e| warn!(error = %e, "Malformed cache info"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Worker did not answer");
                None
            }
        }
    }

    /// Ask the controlling worker to re-fetch `paths` into its dynamic cache.
    pub async fn update_worker_cache(&self, paths: Vec<String>) -> bool {
        self.post_to_worker(ControlMessage::UpdateCache { paths }).await
    }

    /// Ask a waiting worker to activate now.
    pub async fn skip_waiting(&self) -> bool {
        self.post_to_worker(ControlMessage::SkipWaiting).await
    }

    async fn post_to_worker(&self, message: ControlMessage) -> bool {
        let Some(page) = &self.page else {
            return false;
        };
        let Some(worker) = controller_worker(page).await else {
            debug!(kind = message.kind(), "No controlling worker");
            return false;
        };
        match worker.post_message(message.to_json(), None) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Could not message worker");
                false
            }
        }
    }
}

async fn controller_worker(page: &Page) -> Option<ServiceWorker> {
    page.service_worker()?.controller().await
}

/// Delete every database. Failures are only logged.
async fn clear_indexed_db(idb: &IdbFactory) {
    let databases = idb.databases().await;
    let mut deleted = 0;
    for db in &databases {
        match idb.delete_database(&db.name).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(db = %db.name, error = %e, "Could not clear IndexedDB"),
        }
    }
    debug!(deleted, total = databases.len(), "IndexedDB cleared");
}

/// `url` with `key` set to `value`, replacing earlier values.
pub(crate) fn with_query_param(url: &Url, key: &str, value: &str) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut out = url.clone();
    out.set_query(None);
    {
        let mut query = out.query_pairs_mut();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query.append_pair(key, value);
    }
    out
}
