//! Periodic update detection.
//!
//! Two independent signals, checked on every tick:
//!
//! 1. the service worker registration found and installed a changed script
//!    while a worker was already controlling the page
//! 2. the health endpoint reports a version that differs from the one
//!    stored in `localStorage`

use cachekit_common::with_timeout;
use cachekit_sw::UpdateOutcome;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::CacheController;
use crate::error::{ControllerError, Result};
use crate::page::Page;

/// Version fields a health payload may carry.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthPayload {
    version: Option<String>,
    build_time: Option<String>,
}

impl CacheController {
    /// Poll for updates every `update_interval`. The first check runs one
    /// period after start. Abort the handle to stop.
    pub fn start_update_checker(&self) -> Option<JoinHandle<()>> {
        self.page.as_ref()?;

        let controller = self.clone();
        let period = self.config.update_interval();
        info!(period = ?period, "Starting update checker");

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                controller.check_for_updates().await;
            }
        }))
    }

    /// Run one update check. Notifies the user and returns `true` when
    /// either signal fired.
    pub async fn check_for_updates(&self) -> bool {
        let Some(page) = &self.page else {
            return false;
        };

        let worker_update = match self.check_worker_update(page).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Service worker update check failed");
                false
            }
        };

        let server_update = match self.check_server_version(page).await {
            Ok(found) => found,
            Err(e) => {
                debug!(error = %e, "Update check failed");
                false
            }
        };

        if worker_update || server_update {
            info!(worker_update, server_update, "Update available");
            self.notify_update_available().await;
            return true;
        }
        false
    }

    /// `registration.update()`. A changed script only counts as an update
    /// when the page already had a controller.
    async fn check_worker_update(&self, page: &Page) -> Result<bool> {
        let Some(container) = page.service_worker() else {
            return Ok(false);
        };
        let location = page.location().await;
        let Some(registration) = container.get_registration(location.as_str()).await else {
            return Ok(false);
        };

        match container.update(registration.scope.as_str()).await? {
            UpdateOutcome::NoChange => Ok(false),
            UpdateOutcome::Installed {
                worker_id,
                had_controller,
            } => {
                debug!(worker = worker_id.raw(), had_controller, "Service worker updated");
                Ok(had_controller)
            }
        }
    }

    /// Fetch the health endpoint and compare its version with the stored one.
    async fn check_server_version(&self, page: &Page) -> Result<bool> {
        let url = page.location().await.join(&self.config.health_path)?;
        let timeout = self.config.health_timeout();
        let request = cachekit_net::Request::get(url).no_store().timeout(timeout);

        let response = with_timeout(timeout, || page.fetch(request)).await??;
        if !response.ok() {
            return Err(ControllerError::Status(response.status));
        }

        let version = response
            .header("etag")
            .map(|etag| etag.trim_matches('"').to_string())
            .or_else(|| {
                let payload: HealthPayload = response.json().unwrap_or_default();
                payload.version.or(payload.build_time)
            });

        let Some(storage) = page.local_storage() else {
            return Ok(false);
        };
        let mut storage = storage.lock().await;
        storage.set_item(&self.config.last_check_key, &page.now_millis().to_string())?;

        let Some(version) = version else {
            debug!("Health response carries no version");
            return Ok(false);
        };

        let previous = storage.get_item(&self.config.version_key).map(str::to_string);
        storage.set_item(&self.config.version_key, &version)?;

        match previous {
            Some(previous) if previous != version => {
                info!(%previous, current = %version, "Server version changed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
