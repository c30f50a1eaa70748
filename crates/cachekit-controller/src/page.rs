//! The browsing context a [`CacheController`](crate::CacheController)
//! operates on: location, storage areas, the service worker container, the
//! network, and a [`Host`] for the bits of UI the controller touches.

use std::sync::{Arc, Mutex};

use cachekit_common::{Clock, SystemClock};
use cachekit_net::{Fetcher, NetError, Request, Response};
use cachekit_storage::{IdbFactory, StorageKind, WebStorage};
use cachekit_sw::ServiceWorkerContainer;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::debug;
use url::Url;

/// `display-mode` media feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Browser,
    MinimalUi,
    Standalone,
    Fullscreen,
}

/// Notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Default,
    Granted,
    Denied,
}

/// The embedder: notifications, dialogs and navigation.
pub trait Host: Send + Sync {
    /// `None` when the Notification API is unavailable.
    fn notification_permission(&self) -> Option<Permission>;

    fn show_notification(&self, title: &str, body: &str);

    /// Blocking confirm dialog.
    fn confirm(&self, message: &str) -> bool;

    fn navigate(&self, url: &Url);
}

/// What a [`ScriptedHost`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Notification { title: String, body: String },
    Confirm { message: String },
    Navigate { url: Url },
}

/// A [`Host`] with canned answers that records every call.
#[derive(Debug)]
pub struct ScriptedHost {
    permission: Option<Permission>,
    confirm_answer: bool,
    calls: Mutex<Vec<HostCall>>,
}

impl ScriptedHost {
    pub fn new(permission: Option<Permission>, confirm_answer: bool) -> Self {
        Self {
            permission,
            confirm_answer,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: HostCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self::new(None, false)
    }
}

impl Host for ScriptedHost {
    fn notification_permission(&self) -> Option<Permission> {
        self.permission
    }

    fn show_notification(&self, title: &str, body: &str) {
        self.record(HostCall::Notification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }

    fn confirm(&self, message: &str) -> bool {
        self.record(HostCall::Confirm {
            message: message.to_string(),
        });
        self.confirm_answer
    }

    fn navigate(&self, url: &Url) {
        self.record(HostCall::Navigate { url: url.clone() });
    }
}

// ==================== Page ====================

/// A browsing context.
pub struct Page {
    location: RwLock<Url>,
    referrer: String,
    display_mode: DisplayMode,
    ios_standalone: Option<bool>,
    local_storage: Option<AsyncMutex<WebStorage>>,
    session_storage: Option<AsyncMutex<WebStorage>>,
    indexed_db: Option<IdbFactory>,
    service_worker: Option<ServiceWorkerContainer>,
    network: Arc<dyn Fetcher>,
    host: Arc<dyn Host>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("referrer", &self.referrer)
            .field("display_mode", &self.display_mode)
            .field("has_service_worker", &self.service_worker.is_some())
            .finish_non_exhaustive()
    }
}

impl Page {
    pub fn builder(url: Url, network: Arc<dyn Fetcher>) -> PageBuilder {
        PageBuilder {
            url,
            network,
            referrer: String::new(),
            display_mode: DisplayMode::Browser,
            ios_standalone: None,
            local_storage: None,
            session_storage: None,
            indexed_db: None,
            service_worker: None,
            host: Arc::new(ScriptedHost::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Current URL.
    pub async fn location(&self) -> Url {
        self.location.read().await.clone()
    }

    pub fn referrer(&self) -> &str {
        &self.referrer
    }

    /// `matchMedia('(display-mode: standalone)')`.
    pub fn matches_standalone(&self) -> bool {
        self.display_mode == DisplayMode::Standalone
    }

    /// `navigator.standalone` (iOS only).
    pub fn ios_standalone(&self) -> Option<bool> {
        self.ios_standalone
    }

    pub fn local_storage(&self) -> Option<&AsyncMutex<WebStorage>> {
        self.local_storage.as_ref()
    }

    pub fn session_storage(&self) -> Option<&AsyncMutex<WebStorage>> {
        self.session_storage.as_ref()
    }

    pub fn indexed_db(&self) -> Option<&IdbFactory> {
        self.indexed_db.as_ref()
    }

    /// `navigator.serviceWorker`.
    pub fn service_worker(&self) -> Option<&ServiceWorkerContainer> {
        self.service_worker.as_ref()
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    /// `Date.now()`.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// `fetch()`: through the controlling worker when there is one.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        match &self.service_worker {
            Some(container) => container.fetch(request).await,
            None => self.network.fetch(request).await,
        }
    }

    /// Navigate to `url`.
    pub async fn navigate(&self, url: Url) {
        debug!(url = %url, "Navigating");
        *self.location.write().await = url.clone();
        self.host.navigate(&url);
        if let Some(container) = &self.service_worker {
            container.navigated(&url).await;
        }
    }
}

/// Builder for [`Page`].
pub struct PageBuilder {
    url: Url,
    network: Arc<dyn Fetcher>,
    referrer: String,
    display_mode: DisplayMode,
    ios_standalone: Option<bool>,
    local_storage: Option<WebStorage>,
    session_storage: Option<WebStorage>,
    indexed_db: Option<IdbFactory>,
    service_worker: Option<ServiceWorkerContainer>,
    host: Arc<dyn Host>,
    clock: Arc<dyn Clock>,
}

impl PageBuilder {
    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }

    pub fn display_mode(mut self, mode: DisplayMode) -> Self {
        self.display_mode = mode;
        self
    }

    pub fn ios_standalone(mut self, standalone: bool) -> Self {
        self.ios_standalone = Some(standalone);
        self
    }

    /// Provide both `localStorage` and `sessionStorage`.
    pub fn with_web_storage(mut self) -> Self {
        self.local_storage = Some(WebStorage::new(StorageKind::Local));
        self.session_storage = Some(WebStorage::new(StorageKind::Session));
        self
    }

    pub fn local_storage(mut self, storage: WebStorage) -> Self {
        self.local_storage = Some(storage);
        self
    }

    pub fn session_storage(mut self, storage: WebStorage) -> Self {
        self.session_storage = Some(storage);
        self
    }

    pub fn indexed_db(mut self, factory: IdbFactory) -> Self {
        self.indexed_db = Some(factory);
        self
    }

    pub fn service_worker(mut self, container: ServiceWorkerContainer) -> Self {
        self.service_worker = Some(container);
        self
    }

    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Page {
        Page {
            location: RwLock::new(self.url),
            referrer: self.referrer,
            display_mode: self.display_mode,
            ios_standalone: self.ios_standalone,
            local_storage: self.local_storage.map(AsyncMutex::new),
            session_storage: self.session_storage.map(AsyncMutex::new),
            indexed_db: self.indexed_db,
            service_worker: self.service_worker,
            network: self.network,
            host: self.host,
            clock: self.clock,
        }
    }
}
