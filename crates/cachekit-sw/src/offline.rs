//! Responses for requests the network could not serve.

use bytes::Bytes;
use cachekit_net::{Request, Response};
use http::StatusCode;

use crate::router::WorkerCacheRouter;

impl WorkerCacheRouter {
    /// HTML requests get the cached offline page, images an empty 503,
    /// everything else a plain-text 503.
    pub(crate) async fn offline_response(&self, request: &Request) -> Response {
        if request.accepts("text/html") {
            let cached = match self.resolve(&self.config().offline_page) {
                Ok(url) => self.lookup(&url).await,
                Err(_) => None,
            };
            return cached
                .unwrap_or_else(|| Response::text_body(StatusCode::SERVICE_UNAVAILABLE, "Offline"));
        }

        if request.accepts("image/") {
            return Response::new(StatusCode::SERVICE_UNAVAILABLE, Bytes::new())
                .with_status_text("Image unavailable offline");
        }

        Response::text_body(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
    }
}
