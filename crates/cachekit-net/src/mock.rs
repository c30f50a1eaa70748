//! Scripted in-memory network.
//!
//! Routes are keyed by absolute URL (query included, fragment dropped).
//! Unrouted requests get a 404. Taking the network offline makes every
//! fetch fail with [`NetError::Offline`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{CacheMode, Fetcher, NetError, Request, Response};

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub delay: Option<Duration>,
    pub fail: bool,
}

impl MockResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            delay: None,
            fail: false,
        }
    }

    /// A route whose fetch always fails at the transport level.
    pub fn failure() -> Self {
        Self {
            fail: true,
            ..Self::status(StatusCode::OK, Bytes::new())
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }

    pub fn with_content_type(self, value: &'static str) -> Self {
        self.with_header(http::header::CONTENT_TYPE, value)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request as the network saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub cache: CacheMode,
    pub body: Option<Bytes>,
}

/// In-memory [`Fetcher`].
#[derive(Debug)]
pub struct MockNetwork {
    routes: RwLock<HashMap<String, MockResponse>>,
    online: AtomicBool,
    log: Mutex<Vec<RecordedRequest>>,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Serve `response` for `url`, replacing any previous route.
    pub async fn route(&self, url: &str, response: MockResponse) {
        self.routes.write().await.insert(route_key_str(url), response);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of requests seen for `url`.
    pub fn hits(&self, url: &str) -> usize {
        let key = route_key_str(url);
        self.requests()
            .iter()
            .filter(|r| route_key(&r.url) == key)
            .count()
    }

    fn record(&self, request: &Request) {
        if let Ok(mut log) = self.log.lock() {
            log.push(RecordedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                cache: request.cache,
                body: request.body.clone(),
            });
        }
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.record(&request);

        if !self.is_online() {
            trace!(url = %request.url, "Mock network offline");
            return Err(NetError::Offline);
        }

        let route = self.routes.read().await.get(&route_key(&request.url)).cloned();
        let Some(route) = route else {
            return Ok(Response::new(StatusCode::NOT_FOUND, Bytes::new()));
        };

        if let Some(delay) = route.delay {
            match request.timeout {
                Some(timeout) if timeout < delay => {
                    tokio::time::sleep(timeout).await;
                    return Err(NetError::Timeout(timeout));
                }
                _ => tokio::time::sleep(delay).await,
            }
        }

        // Re-check after the delay so a request in flight sees the network drop.
        if route.fail || !self.is_online() {
            return Err(NetError::RequestFailed(format!("{} failed", request.url)));
        }

        let mut response = Response::new(route.status, route.body);
        response.headers = route.headers;
        response.url = Some(request.url);
        Ok(response)
    }
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

fn route_key_str(url: &str) -> String {
    Url::parse(url)
        .map(|u| route_key(&u))
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_routed_and_unrouted() {
        let network = MockNetwork::new();
        network
            .route("https://shop.test/", MockResponse::ok("home").with_content_type("text/html"))
            .await;

        let home = network.fetch(get("https://shop.test/")).await.unwrap();
        assert_eq!(home.text().unwrap(), "home");
        assert_eq!(home.header("content-type"), Some("text/html"));

        let missing = network.fetch(get("https://shop.test/nope")).await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_fails_and_records() {
        let network = MockNetwork::new();
        network.route("https://shop.test/", MockResponse::ok("home")).await;
        network.set_online(false);

        let result = network.fetch(get("https://shop.test/#top")).await;
        assert!(matches!(result, Err(NetError::Offline)));
        assert_eq!(network.hits("https://shop.test/"), 1);
    }

    #[tokio::test]
    async fn test_failure_route() {
        let network = MockNetwork::new();
        network.route("https://shop.test/boom", MockResponse::failure()).await;

        assert!(network.fetch(get("https://shop.test/boom")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay() {
        let network = MockNetwork::new();
        network
            .route(
                "https://shop.test/slow",
                MockResponse::ok("late").with_delay(Duration::from_secs(5)),
            )
            .await;

        let start = tokio::time::Instant::now();
        let response = network.fetch(get("https://shop.test/slow")).await.unwrap();

        assert_eq!(response.text().unwrap(), "late");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_past_request_timeout() {
        let network = MockNetwork::new();
        network
            .route(
                "https://shop.test/slow",
                MockResponse::ok("late").with_delay(Duration::from_secs(5)),
            )
            .await;

        let start = tokio::time::Instant::now();
        let result = network
            .fetch(get("https://shop.test/slow").timeout(Duration::from_secs(2)))
            .await;

        assert!(matches!(result, Err(NetError::Timeout(t)) if t == Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
