//! End-to-end scenarios: a page, its controller, and a registered worker
//! over a scripted network.

use std::sync::Arc;

use cachekit_common::{ControllerConfig, ManualClock};
use cachekit_controller::{
    CacheController, HostCall, Page, Permission, ScriptedHost, ServiceWorkerStatus, UpdateNotice,
};
use cachekit_net::{MockNetwork, MockResponse, Request};
use cachekit_storage::IdbFactory;
use cachekit_sw::{RegistrationOptions, ServiceWorkerContainer};
use http::header::{ACCEPT, ETAG};
use http::{HeaderValue, StatusCode};
use serde_json::json;
use url::Url;

const ORIGIN: &str = "https://shop.test/";
const SCRIPT: &str = "https://shop.test/sw.json";
const NOW: u64 = 1_700_000_000_000;

fn script(version: &str) -> String {
    json!({
        "version": version,
        "static_assets": ["/", "/offline.html", "/manifest.json", "/favicon.ico"],
    })
    .to_string()
}

async fn site() -> Arc<MockNetwork> {
    let network = Arc::new(MockNetwork::new());
    network.route(SCRIPT, MockResponse::ok(script("v1"))).await;
    for (path, body) in [
        ("", "<h1>home</h1>"),
        ("offline.html", "<h1>offline</h1>"),
        ("manifest.json", "{}"),
        ("favicon.ico", "ico"),
        ("cars", "<h1>cars</h1>"),
        ("_next/static/chunks/app.js", "js"),
        ("api/cars", "[]"),
    ] {
        network
            .route(&format!("{ORIGIN}{path}"), MockResponse::ok(body))
            .await;
    }
    network
        .route(
            "https://shop.test/api/health",
            MockResponse::ok(r#"{"status":"healthy"}"#).with_header(ETAG, "\"build-1\""),
        )
        .await;
    network
}

struct Harness {
    network: Arc<MockNetwork>,
    host: Arc<ScriptedHost>,
    container: ServiceWorkerContainer,
    controller: CacheController,
}

async fn harness(host: ScriptedHost) -> Harness {
    let network = site().await;
    let clock = Arc::new(ManualClock::new(NOW));
    let container = ServiceWorkerContainer::with_clock(network.clone(), clock.clone());
    container
        .register(SCRIPT, RegistrationOptions::default())
        .await
        .unwrap();

    let host = Arc::new(host);
    let page = Page::builder(Url::parse(ORIGIN).unwrap(), network.clone())
        .with_web_storage()
        .indexed_db(IdbFactory::default())
        .service_worker(container.clone())
        .host(host.clone())
        .clock(clock)
        .build();

    let config = ControllerConfig {
        build_time: "build-1".to_string(),
        ..Default::default()
    };
    Harness {
        network,
        host,
        container,
        controller: CacheController::new(config, Some(page)),
    }
}

fn page(h: &Harness) -> &Page {
    h.controller.page().unwrap()
}

fn navigation(path: &str) -> Request {
    Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
        .header(ACCEPT, HeaderValue::from_static("text/html"))
}

#[tokio::test]
async fn clear_all_caches_keeps_only_saved_cars() {
    let h = harness(ScriptedHost::default()).await;
    let page = page(&h);

    page.fetch(navigation("/cars")).await.unwrap();
    {
        let mut local = page.local_storage().unwrap().lock().await;
        local.set_item("savedCars", "[1,2,3]").unwrap();
        local.set_item("theme", "dark").unwrap();
    }
    page.session_storage().unwrap().lock().await.set_item("tab", "2").unwrap();
    drop(page.indexed_db().unwrap().open("garage", Some(1)).await.unwrap());

    let before = h.controller.worker_cache_info().await.unwrap();
    assert!(before.total_entries() > 0);

    assert!(h.controller.clear_all_caches().await);

    // The worker handles messages in order, so this observes the clear.
    let after = h.controller.worker_cache_info().await.unwrap();
    assert_eq!(after.total_entries(), 0);
    assert_eq!(after.total_size, 0);
    assert!(h.container.caches().read().await.keys().is_empty());

    let local = page.local_storage().unwrap().lock().await;
    assert_eq!(local.keys(), vec!["savedCars"]);
    assert_eq!(local.get_item("savedCars"), Some("[1,2,3]"));
    assert!(page.session_storage().unwrap().lock().await.is_empty());
    assert!(page.indexed_db().unwrap().databases().await.is_empty());
}

#[tokio::test]
async fn offline_navigation_serves_cache_then_offline_page() {
    let h = harness(ScriptedHost::default()).await;
    let page = page(&h);

    let online = page.fetch(navigation("/cars")).await.unwrap();
    assert_eq!(online.text().unwrap(), "<h1>cars</h1>");

    h.network.set_online(false);

    let cached = page.fetch(navigation("/cars")).await.unwrap();
    assert_eq!(cached.text().unwrap(), "<h1>cars</h1>");

    let unknown = page.fetch(navigation("/about")).await.unwrap();
    assert_eq!(unknown.text().unwrap(), "<h1>offline</h1>");

    let api = page
        .fetch(Request::get(Url::parse("https://shop.test/api/dealers").unwrap()))
        .await
        .unwrap();
    assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn static_assets_survive_going_offline() {
    let h = harness(ScriptedHost::default()).await;
    let page = page(&h);
    let asset = || Request::get(Url::parse("https://shop.test/_next/static/chunks/app.js").unwrap());

    page.fetch(asset()).await.unwrap();
    h.network.set_online(false);

    let response = page.fetch(asset()).await.unwrap();
    assert_eq!(response.text().unwrap(), "js");
    assert_eq!(h.network.hits("https://shop.test/_next/static/chunks/app.js"), 1);
}

#[tokio::test]
async fn force_refresh_unregisters_and_navigates() {
    let h = harness(ScriptedHost::default()).await;

    assert!(h.controller.force_refresh().await);

    let calls = h.host.calls();
    let Some(HostCall::Navigate { url }) = calls.last() else {
        panic!("expected a navigation, got {calls:?}");
    };
    assert_eq!(url.as_str(), "https://shop.test/?_refresh=1700000000000");
    assert!(h.container.get_registrations().await.is_empty());

    // Nothing is registered any more, so the navigation left the page
    // uncontrolled.
    assert!(h.container.controller().await.is_none());
}

#[tokio::test]
async fn refresh_marker_skips_worker_cache() {
    let h = harness(ScriptedHost::default()).await;
    let page = page(&h);
    let refresh = || navigation("/cars?_refresh=1");

    page.fetch(refresh()).await.unwrap();
    h.network.set_online(false);

    // Skipped requests go straight to the network, offline or not.
    assert!(page.fetch(refresh()).await.is_err());
    assert_eq!(h.network.hits("https://shop.test/cars?_refresh=1"), 2);
    assert!(h.container.caches().read().await.get("dynamic-v1").is_none());
}

#[tokio::test]
async fn cache_info_reports_active_worker() {
    let h = harness(ScriptedHost::default()).await;

    let info = h.controller.get_cache_info().await.unwrap();
    assert!(!info.is_pwa);
    assert!(info.has_service_worker);
    assert_eq!(info.service_worker_status, ServiceWorkerStatus::Active);
    assert_eq!(info.service_worker_scope.as_deref(), Some(ORIGIN));

    let worker = h.controller.worker_cache_info().await.unwrap();
    assert_eq!(worker.version, "v1");
    assert_eq!(worker.caches[0].name, "static-v1");
    assert_eq!(worker.caches[0].entries, 4);
}

#[tokio::test]
async fn worker_script_change_is_an_update() {
    let h = harness(ScriptedHost::new(Some(Permission::Granted), false)).await;

    assert!(!h.controller.check_for_updates().await);

    h.network.route(SCRIPT, MockResponse::ok(script("v2"))).await;
    assert!(h.controller.check_for_updates().await);
    assert!(matches!(
        h.host.calls().as_slice(),
        [HostCall::Notification { .. }]
    ));

    let worker = h.controller.worker_cache_info().await.unwrap();
    assert_eq!(worker.version, "v2");
}

#[tokio::test]
async fn health_etag_change_is_an_update() {
    let h = harness(ScriptedHost::new(Some(Permission::Denied), false)).await;

    assert!(!h.controller.check_for_updates().await);
    assert_eq!(
        page(&h)
            .local_storage()
            .unwrap()
            .lock()
            .await
            .get_item("app-version"),
        Some("build-1")
    );

    h.network
        .route(
            "https://shop.test/api/health",
            MockResponse::ok(r#"{"status":"healthy"}"#).with_header(ETAG, "\"build-2\""),
        )
        .await;
    assert!(h.controller.check_for_updates().await);
    assert!(matches!(h.host.calls().as_slice(), [HostCall::Confirm { .. }]));
}

#[tokio::test]
async fn declined_update_leaves_page_alone() {
    let h = harness(ScriptedHost::new(None, false)).await;

    assert_eq!(h.controller.notify_update_available().await, UpdateNotice::Dismissed);
    assert_eq!(h.container.get_registrations().await.len(), 1);
}

#[tokio::test]
async fn update_worker_cache_refetches_paths() {
    let h = harness(ScriptedHost::default()).await;

    assert!(h.controller.update_worker_cache(vec!["/cars".to_string()]).await);

    // Ordered queue: the info reply comes after the update finished.
    let info = h.controller.worker_cache_info().await.unwrap();
    let dynamic = info.caches.iter().find(|c| c.name == "dynamic-v1").unwrap();
    assert_eq!(dynamic.entries, 1);
    assert_eq!(h.network.hits("https://shop.test/cars"), 1);
}

#[tokio::test]
async fn skip_waiting_without_waiting_worker_is_harmless() {
    let h = harness(ScriptedHost::default()).await;

    assert!(h.controller.skip_waiting().await);
    let worker = h.controller.worker_cache_info().await.unwrap();
    assert_eq!(worker.version, "v1");
}
