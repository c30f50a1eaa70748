//! Worker lifecycle: `installing → installed (waiting) → activating →
//! activated`, with `redundant` for replaced or failed workers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use url::Url;

use crate::message::{MessagePort, WorkerMessage};
use crate::router::WorkerCacheRouter;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance. Clones are handles to the same worker, but
/// `state` is a snapshot taken when the handle was cloned.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Script body as fetched. Updates compare against it byte for byte.
    pub script: Bytes,

    /// Time of last state change.
    pub state_changed_at: Instant,

    router: WorkerCacheRouter,
    message_tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl ServiceWorker {
    pub(crate) fn new(
        script_url: Url,
        script: Bytes,
        router: WorkerCacheRouter,
        message_tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            script,
            state_changed_at: Instant::now(),
            router,
            message_tx,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    /// The worker's cache router.
    pub fn router(&self) -> &WorkerCacheRouter {
        &self.router
    }

    /// Queue a message for the worker. Messages are handled one at a time,
    /// in order.
    pub fn post_message(
        &self,
        data: JsonValue,
        port: Option<MessagePort>,
    ) -> Result<(), ServiceWorkerError> {
        if self.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "Cannot post message to redundant worker".to_string(),
            ));
        }

        let mut message = WorkerMessage::new(data);
        if let Some(port) = port {
            message = message.with_port(port);
        }
        self.message_tx
            .send(message)
            .map_err(|_| ServiceWorkerError::StateError("Worker is gone".to_string()))
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new worker. A previous installing worker becomes
    /// redundant.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        let replaced = self.installing.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        self.last_update_check = Some(Instant::now());
        replaced
    }

    /// Transition installing to waiting. A previous waiting worker becomes
    /// redundant.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Drop a worker whose install failed.
    pub fn install_failed(&mut self) -> Option<ServiceWorker> {
        self.installing.take().map(|mut worker| {
            worker.set_state(ServiceWorkerState::Redundant);
            worker
        })
    }

    /// Move the waiting worker into the active slot in `Activating` state.
    /// Returns the new active worker and the one it replaced.
    pub fn begin_activate(&mut self) -> Option<(ServiceWorker, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let old = self.active.replace(worker.clone()).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Some((worker, old))
    }

    /// Finish activation of the active worker.
    pub fn activate_complete(&mut self) -> Option<&ServiceWorker> {
        let worker = self.active.as_mut()?;
        worker.set_state(ServiceWorkerState::Activated);
        Some(worker)
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}
