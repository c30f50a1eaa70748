//! The Worker Cache Router: lifecycle handlers, fetch interception and the
//! control channel of one worker generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachekit_common::{Clock, WorkerConfig};
use cachekit_net::{Fetcher, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CachePolicy, CacheStorage, WriteTicket};
use crate::message::{CacheInfo, ControlMessage, PartitionInfo, Unrecognized, WorkerMessage};
use crate::route::{classify, should_skip_cache, PartitionClass};
use crate::ServiceWorkerError;

/// What the message loop should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Handled,
    /// The worker asked to leave the waiting state.
    SkipWaiting,
    Ignored,
}

/// Cache router for one worker generation. Cloning shares the router.
#[derive(Clone)]
pub struct WorkerCacheRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    scope: Url,
    config: WorkerConfig,
    caches: Arc<RwLock<CacheStorage>>,
    network: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    skip_waiting: AtomicBool,
}

impl std::fmt::Debug for WorkerCacheRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCacheRouter")
            .field("scope", &self.inner.scope.as_str())
            .field("version", &self.inner.config.version)
            .finish()
    }
}

impl WorkerCacheRouter {
    /// Create a router. `scope` resolves relative asset paths.
    pub fn new(
        scope: Url,
        config: WorkerConfig,
        caches: Arc<RwLock<CacheStorage>>,
        network: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                scope,
                config,
                caches,
                network,
                clock,
                skip_waiting: AtomicBool::new(false),
            }),
        }
    }

    pub fn version(&self) -> &str {
        &self.inner.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn scope(&self) -> &Url {
        &self.inner.scope
    }

    /// Versioned cache name for a partition class.
    pub fn cache_name(&self, class: PartitionClass) -> String {
        class.cache_name(self.version())
    }

    /// The three current cache names.
    pub fn cache_names(&self) -> Vec<String> {
        PartitionClass::ALL
            .iter()
            .map(|c| self.cache_name(*c))
            .collect()
    }

    /// Whether `skipWaiting()` was called.
    pub fn skip_waiting_requested(&self) -> bool {
        self.inner.skip_waiting.load(Ordering::SeqCst)
    }

    fn skip_waiting(&self) {
        self.inner.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn policy(&self, class: PartitionClass) -> CachePolicy {
        let limits = &self.inner.config.limits;
        let max_age = &self.inner.config.max_age;
        let (max_entries, secs) = match class {
            PartitionClass::Static => (limits.static_entries, max_age.static_secs),
            PartitionClass::Dynamic => (limits.dynamic_entries, max_age.dynamic_secs),
            PartitionClass::Images => (limits.image_entries, max_age.image_secs),
        };
        CachePolicy {
            max_entries,
            max_age: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }

    // ==================== Lifecycle ====================

    /// Install: purge stale partitions, precache the app shell, then request
    /// skip-waiting. Any asset failure fails the install, and so does a purge
    /// that lands while the assets are in flight.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        info!(version = %self.version(), "Installing worker");

        self.purge_stale().await;
        let ticket = self.ticket().await;

        let mut fetched = Vec::with_capacity(self.inner.config.static_assets.len());
        for asset in &self.inner.config.static_assets {
            let url = self.resolve(asset).map_err(|e| {
                error!(asset = %asset, error = %e, "Installation failed");
                e
            })?;
            let response = self.fetch_ok(Request::get(url.clone())).await.map_err(|e| {
                error!(url = %url, error = %e, "Installation failed");
                ServiceWorkerError::InstallFailed(e.to_string())
            })?;
            fetched.push((url, response));
        }

        let name = self.cache_name(PartitionClass::Static);
        let policy = self.policy(PartitionClass::Static);
        let now = self.now();
        {
            let mut caches = self.inner.caches.write().await;
            // A purge while precaching would leave the app shell half written.
            if !caches.is_current(ticket) {
                error!(cache = %name, "Installation failed: caches were purged while precaching");
                return Err(ServiceWorkerError::InstallFailed(format!(
                    "{name} was purged while precaching"
                )));
            }
            caches.open(&name).set_policy(policy);
            for (url, response) in fetched {
                caches.put_if_current(ticket, &name, policy, &cache_key(&url), response, now);
            }
        }
        info!(cache = %name, "Static cache created");

        self.skip_waiting();
        Ok(())
    }

    /// Activate: purge stale partitions again. Claiming clients is done by
    /// the container. Returns the deleted cache names.
    pub async fn activate(&self) -> Vec<String> {
        info!(version = %self.version(), "Activating worker");
        self.purge_stale().await
    }

    async fn purge_stale(&self) -> Vec<String> {
        let keep = self.cache_names();
        let deleted = self.inner.caches.write().await.retain_only(&keep);
        if !deleted.is_empty() {
            info!(deleted = ?deleted, "Deleted old caches");
        }
        deleted
    }

    // ==================== Fetch ====================

    /// Handle a fetch event. `None` means the request was not intercepted
    /// and goes to the network untouched.
    pub async fn handle_fetch(&self, request: Request) -> Option<Response> {
        if should_skip_cache(&request.method, &request.url) {
            debug!(method = %request.method, url = %request.url, "Bypassing cache");
            return None;
        }

        let route = classify(&request.method, &request.url, &self.inner.config);
        debug!(url = %request.url, strategy = %route.strategy, "Routing request");

        match self.run_strategy(route, request.clone()).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %request.url, strategy = %route.strategy, error = %e, "Request failed");
                Some(self.offline_response(&request).await)
            }
        }
    }

    // ==================== Messages ====================

    /// Handle a control message.
    pub async fn handle_message(&self, message: WorkerMessage) -> MessageOutcome {
        let control = match ControlMessage::parse(&message.data) {
            Ok(control) => control,
            Err(Unrecognized::UnknownType(kind)) => {
                info!(kind = %kind, "Unknown message type");
                return MessageOutcome::Ignored;
            }
            Err(Unrecognized::Malformed) => {
                info!(data = %message.data, "Ignoring message without a type");
                return MessageOutcome::Ignored;
            }
        };

        debug!(kind = control.kind(), "Handling message");
        match control {
            ControlMessage::ClearCache => {
                let deleted = self.inner.caches.write().await.clear();
                info!(deleted = deleted.len(), "All caches cleared");
                MessageOutcome::Handled
            }
            ControlMessage::UpdateCache { paths } => {
                self.update_cache(&paths).await;
                MessageOutcome::Handled
            }
            ControlMessage::GetCacheInfo => {
                let info = self.cache_info().await;
                match (message.ports.first(), serde_json::to_value(&info)) {
                    (Some(port), Ok(value)) => {
                        if let Err(e) = port.post_message(value) {
                            warn!(error = %e, "Could not reply with cache info");
                        }
                    }
                    (None, _) => warn!("GET_CACHE_INFO without a reply port"),
                    (_, Err(e)) => warn!(error = %e, "Could not serialize cache info"),
                }
                MessageOutcome::Handled
            }
            ControlMessage::SkipWaiting => {
                self.skip_waiting();
                MessageOutcome::SkipWaiting
            }
        }
    }

    /// Re-fetch each path into the dynamic partition. Failures are logged
    /// per path.
    async fn update_cache(&self, paths: &[String]) {
        for path in paths {
            let url = match self.resolve(path) {
                Ok(url) => url,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to update cache");
                    continue;
                }
            };

            let ticket = self.ticket().await;
            match self.inner.network.fetch(Request::get(url.clone())).await {
                Ok(response) if response.ok() => {
                    if self.commit(ticket, PartitionClass::Dynamic, &url, response).await {
                        info!(path = %path, "Updated cache");
                    }
                }
                Ok(response) => {
                    debug!(path = %path, status = %response.status, "Not caching non-OK response");
                }
                Err(e) => warn!(path = %path, error = %e, "Failed to update cache"),
            }
        }
    }

    /// Version and per-partition entry counts.
    pub async fn cache_info(&self) -> CacheInfo {
        let caches = self.inner.caches.read().await;
        let partitions = caches
            .keys()
            .into_iter()
            .filter_map(|name| caches.get(name))
            .map(|cache| PartitionInfo {
                name: cache.name.clone(),
                entries: cache.len(),
            })
            .collect();

        CacheInfo {
            version: self.version().to_string(),
            caches: partitions,
            total_size: caches.total_size(),
        }
    }

    // ==================== Cache access ====================

    pub(crate) fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    pub(crate) fn network(&self) -> &Arc<dyn Fetcher> {
        &self.inner.network
    }

    pub(crate) fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.inner
            .scope
            .join(path)
            .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{path}: {e}")))
    }

    pub(crate) async fn ticket(&self) -> WriteTicket {
        self.inner.caches.read().await.ticket()
    }

    /// Look up `url` across all partitions.
    pub(crate) async fn lookup(&self, url: &Url) -> Option<Response> {
        let now = self.now();
        self.inner
            .caches
            .read()
            .await
            .match_request(&cache_key(url), now)
            .map(|entry| entry.response.clone())
    }

    /// Store `response` if the ticket is still current.
    pub(crate) async fn commit(
        &self,
        ticket: WriteTicket,
        class: PartitionClass,
        url: &Url,
        response: Response,
    ) -> bool {
        let name = self.cache_name(class);
        let policy = self.policy(class);
        let now = self.now();
        self.inner
            .caches
            .write()
            .await
            .put_if_current(ticket, &name, policy, &cache_key(url), response, now)
    }

    /// Fetch and require an OK status.
    pub(crate) async fn fetch_ok(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let url = request.url.to_string();
        let response = self.inner.network.fetch(request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::BadStatus {
                url,
                status: response.status,
            });
        }
        Ok(response)
    }
}

/// Cache key: the absolute URL without fragment.
pub(crate) fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePort;
    use cachekit_common::ManualClock;
    use cachekit_net::{MockNetwork, MockResponse};
    use http::StatusCode;
    use serde_json::json;

    const ORIGIN: &str = "https://shop.test/";

    fn config(assets: &[&str]) -> WorkerConfig {
        WorkerConfig {
            version: "v1".to_string(),
            static_assets: assets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn setup(assets: &[&str]) -> (WorkerCacheRouter, Arc<MockNetwork>, Arc<RwLock<CacheStorage>>) {
        let network = Arc::new(MockNetwork::new());
        for asset in assets {
            network
                .route(&format!("https://shop.test{asset}"), MockResponse::ok(format!("asset {asset}")))
                .await;
        }
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let router = WorkerCacheRouter::new(
            Url::parse(ORIGIN).unwrap(),
            config(assets),
            caches.clone(),
            network.clone(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        (router, network, caches)
    }

    #[tokio::test]
    async fn test_install_precaches_app_shell() {
        let (router, _network, caches) = setup(&["/", "/offline.html", "/manifest.json"]).await;

        router.install().await.unwrap();

        let caches = caches.read().await;
        let static_cache = caches.get("static-v1").unwrap();
        assert_eq!(
            static_cache.keys(),
            vec![
                "https://shop.test/",
                "https://shop.test/offline.html",
                "https://shop.test/manifest.json"
            ]
        );
        assert!(router.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_install_fails_on_missing_asset() {
        let (router, network, caches) = setup(&["/", "/offline.html"]).await;
        network
            .route("https://shop.test/offline.html", MockResponse::status(StatusCode::NOT_FOUND, ""))
            .await;

        let err = router.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert!(caches.read().await.get("static-v1").is_none());
        assert!(!router.skip_waiting_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_fails_when_purged_mid_precache() {
        let (router, network, caches) = setup(&["/", "/offline.html"]).await;
        network
            .route(
                "https://shop.test/offline.html",
                MockResponse::ok("offline").with_delay(Duration::from_secs(5)),
            )
            .await;

        let install = tokio::spawn({
            let router = router.clone();
            async move { router.install().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        caches.write().await.clear();

        let err = install.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert!(caches.read().await.get("static-v1").is_none());
        assert!(!router.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_install_purges_other_versions() {
        let (router, _network, caches) = setup(&["/"]).await;
        {
            let mut caches = caches.write().await;
            caches.open("static-v0");
            caches.open("images-v0");
            caches.open("dynamic-v1");
        }

        router.install().await.unwrap();

        assert_eq!(caches.read().await.keys(), vec!["dynamic-v1", "static-v1"]);
    }

    #[tokio::test]
    async fn test_activate_twice_is_idempotent() {
        let (router, _network, caches) = setup(&["/"]).await;
        caches.write().await.open("static-v0");
        router.install().await.unwrap();

        let first = router.activate().await;
        let second = router.activate().await;

        assert!(first.is_empty());
        assert!(second.is_empty());

        let caches = caches.read().await;
        for class in PartitionClass::ALL {
            let count = caches
                .keys()
                .iter()
                .filter(|n| n.starts_with(&format!("{}-", class.prefix())))
                .count();
            assert!(count <= 1, "{:?}", class);
        }
    }

    #[tokio::test]
    async fn test_skip_predicate_never_touches_caches() {
        let (router, network, caches) = setup(&[]).await;
        let generation = caches.read().await.generation();

        for request in [
            Request::post(Url::parse("https://shop.test/cars").unwrap(), bytes::Bytes::new()),
            Request::get(Url::parse("https://shop.test/api/revalidate").unwrap()),
            Request::get(Url::parse("https://shop.test/?_refresh=1").unwrap()),
        ] {
            assert!(router.handle_fetch(request).await.is_none());
        }

        let caches = caches.read().await;
        assert!(caches.keys().is_empty());
        assert_eq!(caches.generation(), generation);
        assert!(network.requests().is_empty());
    }

    #[tokio::test]
    async fn test_clear_then_info_reports_zero() {
        let (router, _network, _caches) = setup(&["/", "/offline.html"]).await;
        router.install().await.unwrap();
        assert_eq!(router.cache_info().await.total_entries(), 2);

        let outcome = router
            .handle_message(WorkerMessage::new(json!({"type": "CLEAR_CACHE"})))
            .await;
        assert_eq!(outcome, MessageOutcome::Handled);

        let (mut mine, theirs) = MessagePort::create_pair();
        router
            .handle_message(WorkerMessage::new(json!({"type": "GET_CACHE_INFO"})).with_port(theirs))
            .await;

        let reply: CacheInfo = serde_json::from_value(mine.recv().await.unwrap()).unwrap();
        assert_eq!(reply.version, "v1");
        assert_eq!(reply.total_entries(), 0);
        assert_eq!(reply.total_size, 0);
    }

    #[tokio::test]
    async fn test_update_cache_tolerates_failures() {
        let (router, network, caches) = setup(&[]).await;
        network.route("https://shop.test/cars", MockResponse::ok("cars")).await;
        network.route("https://shop.test/broken", MockResponse::failure()).await;

        router
            .handle_message(WorkerMessage::new(json!({
                "type": "UPDATE_CACHE",
                "data": {"paths": ["/broken", "/cars", "/missing"]}
            })))
            .await;

        let caches = caches.read().await;
        let dynamic = caches.get("dynamic-v1").unwrap();
        assert_eq!(dynamic.keys(), vec!["https://shop.test/cars"]);
    }

    #[tokio::test]
    async fn test_unknown_and_skip_waiting_messages() {
        let (router, _network, _caches) = setup(&[]).await;

        let outcome = router
            .handle_message(WorkerMessage::new(json!({"type": "PING"})))
            .await;
        assert_eq!(outcome, MessageOutcome::Ignored);

        let outcome = router
            .handle_message(WorkerMessage::new(json!({"type": "SKIP_WAITING"})))
            .await;
        assert_eq!(outcome, MessageOutcome::SkipWaiting);
        assert!(router.skip_waiting_requested());
    }

    #[test]
    fn test_policies_follow_config() {
        let router = WorkerCacheRouter::new(
            Url::parse(ORIGIN).unwrap(),
            WorkerConfig::default(),
            Arc::new(RwLock::new(CacheStorage::new())),
            Arc::new(MockNetwork::new()),
            Arc::new(ManualClock::new(0)),
        );

        assert_eq!(router.policy(PartitionClass::Dynamic).max_entries, Some(100));
        assert_eq!(router.policy(PartitionClass::Images).max_entries, Some(200));
        assert_eq!(router.policy(PartitionClass::Static).max_entries, None);
        assert_eq!(
            router.cache_names(),
            vec!["static-v2026-1.0.1", "dynamic-v2026-1.0.1", "images-v2026-1.0.1"]
        );
    }
}
