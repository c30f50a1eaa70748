//! Strategy handlers.

use cachekit_net::{Request, Response};
use tracing::{debug, trace, warn};

use crate::cache::WriteTicket;
use crate::route::{PartitionClass, Route, Strategy};
use crate::router::WorkerCacheRouter;
use crate::ServiceWorkerError;

impl WorkerCacheRouter {
    /// Dispatch to the handler for `route.strategy`.
    pub(crate) async fn run_strategy(
        &self,
        route: Route,
        request: Request,
    ) -> Result<Response, ServiceWorkerError> {
        let partition = route.partition.unwrap_or(PartitionClass::Dynamic);
        match route.strategy {
            Strategy::NetworkOnly => self.network_only(request).await,
            Strategy::CacheFirst => self.cache_first(request, partition).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, partition).await,
            Strategy::NetworkFirst => self.network_first(request).await,
        }
    }

    async fn network_only(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        Ok(self.network().fetch(request).await?)
    }

    async fn cache_first(
        &self,
        request: Request,
        partition: PartitionClass,
    ) -> Result<Response, ServiceWorkerError> {
        if let Some(cached) = self.lookup(&request.url).await {
            trace!(url = %request.url, "Cache hit");
            return Ok(cached);
        }

        let ticket = self.ticket().await;
        let url = request.url.clone();
        let response = self.network().fetch(request).await?;
        if response.ok() {
            self.commit(ticket, partition, &url, response.clone()).await;
        }
        Ok(response)
    }

    async fn stale_while_revalidate(
        &self,
        request: Request,
        partition: PartitionClass,
    ) -> Result<Response, ServiceWorkerError> {
        let cached = self.lookup(&request.url).await;
        let ticket = self.ticket().await;

        let router = self.clone();
        let refresh =
            tokio::spawn(async move { router.refresh(ticket, partition, request).await });

        match cached {
            // The refresh keeps running detached.
            Some(cached) => Ok(cached),
            None => refresh
                .await
                .map_err(|e| ServiceWorkerError::TaskFailed(e.to_string()))?,
        }
    }

    async fn refresh(
        &self,
        ticket: WriteTicket,
        partition: PartitionClass,
        request: Request,
    ) -> Result<Response, ServiceWorkerError> {
        let url = request.url.clone();
        match self.network().fetch(request).await {
            Ok(response) => {
                if response.ok() && self.commit(ticket, partition, &url, response.clone()).await {
                    trace!(url = %url, "Refreshed cache entry");
                }
                Ok(response)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Background fetch failed");
                Err(e.into())
            }
        }
    }

    async fn network_first(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let url = request.url.clone();
        let ticket = self.ticket().await;

        match self.fetch_ok(request).await {
            Ok(response) => {
                self.commit(ticket, PartitionClass::Dynamic, &url, response.clone())
                    .await;
                Ok(response)
            }
            Err(e) => match self.lookup(&url).await {
                Some(cached) => {
                    debug!(url = %url, error = %e, "Network failed, serving cached copy");
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }
}
