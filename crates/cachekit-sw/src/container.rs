//! The page-side service worker container (`navigator.serviceWorker`).
//!
//! A worker "script" is the JSON [`WorkerConfig`] served at the script URL.
//! Registering fetches it, builds a [`WorkerCacheRouter`] over the shared
//! Cache Storage, installs it and, since install requests skip-waiting,
//! activates it and makes it the page controller.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use cachekit_common::{Clock, SystemClock, WorkerConfig};
use cachekit_net::{Fetcher, NetError, Request, Response};
use hashbrown::HashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
use crate::message::WorkerMessage;
use crate::router::{MessageOutcome, WorkerCacheRouter};
use crate::ServiceWorkerError;

const EVENT_CAPACITY: usize = 64;

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the script's directory.
    pub scope: Option<String>,
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A changed script was found and is being installed.
    UpdateFound { registration_scope: String },
    /// The page controller changed.
    ControllerChange { worker_id: Option<ServiceWorkerId> },
}

/// Snapshot of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub scope: Url,
    pub installing: bool,
    pub waiting: bool,
    pub active: bool,
    /// Cache version of the active worker.
    pub active_version: Option<String>,
}

impl RegistrationInfo {
    fn from_registration(registration: &ServiceWorkerRegistration) -> Self {
        Self {
            scope: registration.scope.clone(),
            installing: registration.installing.is_some(),
            waiting: registration.waiting.is_some(),
            active: registration.active.is_some(),
            active_version: registration
                .active
                .as_ref()
                .map(|w| w.router().version().to_string()),
        }
    }
}

/// Result of an update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The script is byte-identical.
    NoChange,
    /// A new worker finished installing and is `installed`.
    Installed {
        worker_id: ServiceWorkerId,
        /// Whether a worker controlled the page when the update began.
        had_controller: bool,
    },
}

// ==================== Service Worker Container ====================

/// Service worker container (navigator.serviceWorker). Cloning shares the
/// container.
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    shared: Arc<Shared>,
}

struct Shared {
    /// Registrations by scope.
    registrations: RwLock<HashMap<String, ServiceWorkerRegistration>>,

    /// The worker controlling the page.
    controller: RwLock<Option<ServiceWorker>>,

    /// Cache storage, shared by every worker generation.
    caches: Arc<RwLock<CacheStorage>>,

    network: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(network: Arc<dyn Fetcher>) -> Self {
        Self::with_clock(network, Arc::new(SystemClock))
    }

    /// Create a container whose workers timestamp cache entries with `clock`.
    pub fn with_clock(network: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                registrations: RwLock::new(HashMap::new()),
                controller: RwLock::new(None),
                caches: Arc::new(RwLock::new(CacheStorage::new())),
                network,
                clock,
                events,
            }),
        }
    }

    /// Listen for lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceWorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Cache storage (`caches`).
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.shared.caches)
    }

    /// The worker controlling the page.
    pub async fn controller(&self) -> Option<ServiceWorker> {
        self.shared.controller.read().await.clone()
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(scope, worker = worker_id.raw(), state = ?new_state, "Worker state change");
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    // ==================== Registration ====================

    /// Register a service worker. Returns the registration scope.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<Url, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        // Determine scope
        let scope = match options.scope {
            Some(s) => script_url
                .join(&s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => {
                let mut scope = script_url.clone();
                let dir = script_url
                    .path()
                    .rsplit_once('/')
                    .map(|(dir, _)| dir)
                    .unwrap_or("");
                scope.set_path(&format!("{dir}/"));
                scope.set_query(None);
                scope
            }
        };
        let scope_key = scope.to_string();

        let (script, config) = self.fetch_script(&script_url).await?;

        {
            let mut registrations = self.shared.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));

            if let Some(active) = registration.get_active() {
                if active.script_url == script_url && active.script == script {
                    debug!(scope = %scope_key, "Already registered with this script");
                    return Ok(scope);
                }
            }
        }

        info!(scope = %scope_key, script = %script_url, "Registering service worker");
        self.install_worker(&scope_key, script_url, script, config)
            .await?;
        Ok(scope)
    }

    /// Check the registration's script for changes and install it if it
    /// differs.
    pub async fn update(&self, scope: &str) -> Result<UpdateOutcome, ServiceWorkerError> {
        let (script_url, current) = {
            let registrations = self.shared.registrations.read().await;
            let registration = registrations
                .get(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            let newest = registration
                .installing
                .as_ref()
                .or(registration.waiting.as_ref())
                .or(registration.active.as_ref())
                .ok_or_else(|| ServiceWorkerError::StateError(format!("{scope} has no worker")))?;
            (newest.script_url.clone(), newest.script.clone())
        };

        let (script, config) = self.fetch_script(&script_url).await?;

        if let Some(registration) = self.shared.registrations.write().await.get_mut(scope) {
            registration.last_update_check = Some(std::time::Instant::now());
        }

        if script == current {
            debug!(scope, "Service worker script unchanged");
            return Ok(UpdateOutcome::NoChange);
        }

        info!(scope, version = %config.version, "Service worker update found");
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope.to_string(),
        });

        let had_controller = self.controller().await.is_some();
        let worker_id = self.install_worker(scope, script_url, script, config).await?;
        Ok(UpdateOutcome::Installed {
            worker_id,
            had_controller,
        })
    }

    /// Fetch and parse a worker script, bypassing HTTP caches.
    async fn fetch_script(&self, url: &Url) -> Result<(Bytes, WorkerConfig), ServiceWorkerError> {
        let response = self
            .shared
            .network
            .fetch(Request::get(url.clone()).no_store())
            .await?;

        if !response.ok() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "{url} returned {}",
                response.status
            )));
        }

        let config: WorkerConfig = serde_json::from_slice(&response.body)
            .map_err(|e| ServiceWorkerError::ScriptError(format!("{url}: {e}")))?;
        config
            .validate()
            .map_err(|e| ServiceWorkerError::ScriptError(format!("{url}: {e}")))?;

        Ok((response.body, config))
    }

    /// Create a worker, run its install, then activate it if it asked to
    /// skip waiting.
    async fn install_worker(
        &self,
        scope_key: &str,
        script_url: Url,
        script: Bytes,
        config: WorkerConfig,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let scope = Url::parse(scope_key)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let router = WorkerCacheRouter::new(
            scope,
            config,
            Arc::clone(&self.shared.caches),
            Arc::clone(&self.shared.network),
            Arc::clone(&self.shared.clock),
        );

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let worker = ServiceWorker::new(script_url, script, router.clone(), message_tx);
        let worker_id = worker.id;
        spawn_message_loop(
            Arc::downgrade(&self.shared),
            scope_key.to_string(),
            router.clone(),
            message_rx,
        );

        {
            let mut registrations = self.shared.registrations.write().await;
            let registration = registrations
                .get_mut(scope_key)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_key.to_string()))?;
            if let Some(replaced) = registration.begin_install(worker) {
                self.emit_state(scope_key, replaced.id, ServiceWorkerState::Redundant);
            }
        }
        self.emit_state(scope_key, worker_id, ServiceWorkerState::Installing);

        if let Err(e) = router.install().await {
            warn!(scope = scope_key, error = %e, "Service worker install failed");
            let mut registrations = self.shared.registrations.write().await;
            if let Some(registration) = registrations.get_mut(scope_key) {
                if registration.installing.as_ref().map(|w| w.id) == Some(worker_id) {
                    registration.install_failed();
                }
            }
            self.emit_state(scope_key, worker_id, ServiceWorkerState::Redundant);
            return Err(e);
        }

        {
            let mut registrations = self.shared.registrations.write().await;
            let registration = registrations
                .get_mut(scope_key)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_key.to_string()))?;
            if registration.installing.as_ref().map(|w| w.id) != Some(worker_id) {
                return Err(ServiceWorkerError::StateError(
                    "Install superseded by a newer worker".to_string(),
                ));
            }
            if let Some(replaced) = registration.install_complete() {
                self.emit_state(scope_key, replaced.id, ServiceWorkerState::Redundant);
            }
        }
        self.emit_state(scope_key, worker_id, ServiceWorkerState::Installed);

        if router.skip_waiting_requested() {
            self.activate(scope_key).await?;
        }
        Ok(worker_id)
    }

    /// Activate the waiting worker of `scope` and make it the page
    /// controller. No-op when nothing is waiting.
    pub async fn activate(&self, scope: &str) -> Result<(), ServiceWorkerError> {
        let (worker, replaced) = {
            let mut registrations = self.shared.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            match registration.begin_activate() {
                Some(pair) => pair,
                None => return Ok(()),
            }
        };

        if let Some(replaced) = replaced {
            self.emit_state(scope, replaced.id, ServiceWorkerState::Redundant);
        }
        self.emit_state(scope, worker.id, ServiceWorkerState::Activating);

        worker.router().activate().await;

        let active = {
            let mut registrations = self.shared.registrations.write().await;
            registrations
                .get_mut(scope)
                .filter(|r| r.active.as_ref().map(|w| w.id) == Some(worker.id))
                .and_then(|r| r.activate_complete().cloned())
        };
        let Some(active) = active else {
            return Err(ServiceWorkerError::StateError(
                "Worker was replaced during activation".to_string(),
            ));
        };
        self.emit_state(scope, active.id, ServiceWorkerState::Activated);
        info!(scope, version = %active.router().version(), "Activated and claimed all clients");

        // clients.claim()
        let worker_id = active.id;
        *self.shared.controller.write().await = Some(active);
        self.emit(ServiceWorkerEvent::ControllerChange {
            worker_id: Some(worker_id),
        });
        Ok(())
    }

    /// Get the registration whose scope matches `url` (longest scope wins).
    pub async fn get_registration(&self, url: &str) -> Option<RegistrationInfo> {
        let registrations = self.shared.registrations.read().await;
        registrations
            .iter()
            .filter(|(scope, _)| url.starts_with(scope.as_str()))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(_, registration)| RegistrationInfo::from_registration(registration))
    }

    /// Get all registrations, sorted by scope.
    pub async fn get_registrations(&self) -> Vec<RegistrationInfo> {
        let registrations = self.shared.registrations.read().await;
        let mut infos: Vec<_> = registrations
            .values()
            .map(RegistrationInfo::from_registration)
            .collect();
        infos.sort_by(|a, b| a.scope.as_str().cmp(b.scope.as_str()));
        infos
    }

    /// Unregister a service worker. The current controller keeps serving
    /// until the next navigation.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let mut registrations = self.shared.registrations.write().await;
        if let Some(mut registration) = registrations.remove(scope) {
            registration.unregister();
            info!(scope, "Service worker unregistered");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-evaluate the controller after the page navigated to `url`.
    pub async fn navigated(&self, url: &Url) {
        let next = {
            let registrations = self.shared.registrations.read().await;
            registrations
                .iter()
                .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
                .max_by_key(|(scope, _)| scope.len())
                .and_then(|(_, r)| r.active.clone())
        };

        let mut controller = self.shared.controller.write().await;
        let changed = controller.as_ref().map(|w| w.id) != next.as_ref().map(|w| w.id);
        *controller = next;
        if changed {
            let worker_id = controller.as_ref().map(|w| w.id);
            drop(controller);
            self.emit(ServiceWorkerEvent::ControllerChange { worker_id });
        }
    }

    // ==================== Fetch ====================

    /// Fetch on behalf of the page, through the controller when there is one.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if let Some(controller) = self.controller().await {
            if let Some(response) = controller.router().handle_fetch(request.clone()).await {
                return Ok(response);
            }
        }
        self.shared.network.fetch(request).await
    }
}

/// Run a worker's message queue: one message at a time, in order.
fn spawn_message_loop(
    shared: Weak<Shared>,
    scope: String,
    router: WorkerCacheRouter,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            if router.handle_message(message).await != MessageOutcome::SkipWaiting {
                continue;
            }
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let container = ServiceWorkerContainer { shared };
            if let Err(e) = container.activate(&scope).await {
                warn!(scope = %scope, error = %e, "skipWaiting activation failed");
            }
        }
        debug!(scope = %scope, "Worker message loop ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CacheInfo, MessagePort};
    use cachekit_common::ManualClock;
    use cachekit_net::{MockNetwork, MockResponse};
    use serde_json::json;

    const SCRIPT: &str = "https://shop.test/sw.json";

    fn script(version: &str) -> String {
        json!({
            "version": version,
            "static_assets": ["/", "/offline.html", "/manifest.json"],
        })
        .to_string()
    }

    async fn site() -> Arc<MockNetwork> {
        let network = Arc::new(MockNetwork::new());
        network.route(SCRIPT, MockResponse::ok(script("v1"))).await;
        network.route("https://shop.test/", MockResponse::ok("home")).await;
        network
            .route("https://shop.test/offline.html", MockResponse::ok("offline"))
            .await;
        network
            .route("https://shop.test/manifest.json", MockResponse::ok("{}"))
            .await;
        network
    }

    fn container(network: Arc<MockNetwork>) -> ServiceWorkerContainer {
        ServiceWorkerContainer::with_clock(network, Arc::new(ManualClock::new(1_700_000_000_000)))
    }

    #[tokio::test]
    async fn test_register_installs_and_claims() {
        let network = site().await;
        let container = container(network.clone());
        let mut events = container.subscribe();

        let scope = container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .unwrap();
        assert_eq!(scope.as_str(), "https://shop.test/");

        let controller = container.controller().await.unwrap();
        assert!(controller.is_active());
        assert_eq!(controller.router().version(), "v1");

        let caches = container.caches();
        assert_eq!(caches.read().await.get("static-v1").map(|c| c.len()), Some(3));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );

        // The script fetch bypassed HTTP caches.
        let script_request = network
            .requests()
            .into_iter()
            .find(|r| r.url.as_str() == SCRIPT)
            .unwrap();
        assert_eq!(script_request.cache, cachekit_net::CacheMode::NoStore);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_script() {
        let network = site().await;
        network.route(SCRIPT, MockResponse::ok("not json")).await;
        let container = container(network);

        let err = container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::ScriptError(_)));
        assert!(container.controller().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_install_leaves_no_worker() {
        let network = site().await;
        network
            .route("https://shop.test/manifest.json", MockResponse::failure())
            .await;
        let container = container(network);

        assert!(container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .is_err());

        let info = container.get_registration("https://shop.test/cars").await.unwrap();
        assert!(!info.installing && !info.waiting && !info.active);
    }

    #[tokio::test]
    async fn test_update_swaps_versions() {
        let network = site().await;
        let container = container(network.clone());
        container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .unwrap();
        let first = container.controller().await.unwrap();

        assert_eq!(
            container.update("https://shop.test/").await.unwrap(),
            UpdateOutcome::NoChange
        );

        network.route(SCRIPT, MockResponse::ok(script("v2"))).await;
        let mut events = container.subscribe();
        let outcome = container.update("https://shop.test/").await.unwrap();
        assert!(matches!(
            outcome,
            UpdateOutcome::Installed {
                had_controller: true,
                ..
            }
        ));

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(seen.contains(&ServiceWorkerEvent::UpdateFound {
            registration_scope: "https://shop.test/".to_string()
        }));
        assert!(seen.contains(&ServiceWorkerEvent::StateChange {
            registration_scope: "https://shop.test/".to_string(),
            worker_id: first.id,
            new_state: ServiceWorkerState::Redundant,
        }));

        let controller = container.controller().await.unwrap();
        assert_eq!(controller.router().version(), "v2");
        assert_eq!(container.caches().read().await.keys(), vec!["static-v2"]);
    }

    #[tokio::test]
    async fn test_fetch_through_controller() {
        let network = site().await;
        network
            .route("https://shop.test/_next/static/app.js", MockResponse::ok("js"))
            .await;
        let container = container(network.clone());

        // No controller yet: straight to the network.
        let response = container
            .fetch(Request::get(Url::parse("https://shop.test/_next/static/app.js").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"js");
        assert!(container.caches().read().await.keys().is_empty());

        container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .unwrap();
        container
            .fetch(Request::get(Url::parse("https://shop.test/_next/static/app.js").unwrap()))
            .await
            .unwrap();

        network.set_online(false);
        let response = container
            .fetch(Request::get(Url::parse("https://shop.test/_next/static/app.js").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"js");
    }

    #[tokio::test]
    async fn test_messages_are_processed_in_order() {
        let network = site().await;
        let container = container(network);
        container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .unwrap();
        let controller = container.controller().await.unwrap();

        controller
            .post_message(json!({"type": "CLEAR_CACHE"}), None)
            .unwrap();
        let (mut reply, port) = MessagePort::create_pair();
        controller
            .post_message(json!({"type": "GET_CACHE_INFO"}), Some(port))
            .unwrap();

        let info: CacheInfo = serde_json::from_value(reply.recv().await.unwrap()).unwrap();
        assert_eq!(info.total_entries(), 0);
        assert!(info.caches.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_and_navigate() {
        let network = site().await;
        let container = container(network);
        container
            .register(SCRIPT, RegistrationOptions::default())
            .await
            .unwrap();

        assert!(container.unregister("https://shop.test/").await.unwrap());
        assert!(!container.unregister("https://shop.test/").await.unwrap());
        assert!(container.get_registrations().await.is_empty());

        // Still controlled until the page navigates.
        assert!(container.controller().await.is_some());
        container
            .navigated(&Url::parse("https://shop.test/?_refresh=1").unwrap())
            .await;
        assert!(container.controller().await.is_none());
    }
}
