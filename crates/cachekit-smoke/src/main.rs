//! CacheKit smoke harness
//!
//! Serves a small site from an in-memory network, registers the worker,
//! drives one request per strategy online and then offline, clears every
//! cache, and prints a JSON summary with per-step timings.
//!
//! ```text
//! cachekit-smoke [config.json] [--perf-output <path>]
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cachekit_common::{init_logging, CacheKitConfig, ManualClock};
use cachekit_controller::{CacheController, Page, ScriptedHost};
use cachekit_net::{MockNetwork, MockResponse, Request};
use cachekit_storage::IdbFactory;
use cachekit_sw::{RegistrationOptions, ServiceWorkerContainer};
use http::header::{ACCEPT, ETAG};
use http::HeaderValue;
use serde_json::json;
use tracing::{error, info};
use url::Url;

const ORIGIN: &str = "https://smoke.cachekit.test/";
const SCRIPT_PATH: &str = "sw.json";
const START_MILLIS: u64 = 1_700_000_000_000;

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let timings = self.timings.borrow();
        let mut summary = serde_json::Map::new();

        for (op, durations) in timings.iter() {
            if durations.is_empty() {
                continue;
            }

            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let count = millis.len();
            let total_ms: f64 = millis.iter().sum();
            let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / count as f64),
                    "min_ms": round2(min_ms),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}

/// Parse command line arguments
#[derive(Default)]
struct Args {
    config: Option<String>,
    perf_output: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = Args::default();
        let mut raw = std::env::args().skip(1);

        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "--perf-output" => args.perf_output = raw.next(),
                _ if args.config.is_none() && !arg.starts_with("--") => args.config = Some(arg),
                _ => {}
            }
        }
        args
    }
}

/// One request per strategy.
const PROBES: &[(&str, &str, &str)] = &[
    ("network-first", "cars", "text/html"),
    ("cache-first", "_next/static/chunks/main.js", "*/*"),
    ("stale-while-revalidate", "images/hero.webp", "image/webp"),
    ("network-only", "api/cars", "application/json"),
];

async fn serve_site(network: &MockNetwork, config: &CacheKitConfig, origin: &Url) -> Result<()> {
    let script = serde_json::to_vec(&config.worker).context("serializing worker config")?;
    network
        .route(origin.join(SCRIPT_PATH)?.as_str(), MockResponse::ok(script))
        .await;

    for asset in &config.worker.static_assets {
        let body = format!("asset {asset}");
        network
            .route(origin.join(asset)?.as_str(), MockResponse::ok(body))
            .await;
    }
    for &(_, path, accept) in PROBES {
        network
            .route(
                origin.join(path)?.as_str(),
                MockResponse::ok(format!("{path} ({accept})")),
            )
            .await;
    }
    network
        .route(
            origin.join(&config.controller.health_path)?.as_str(),
            MockResponse::ok(r#"{"status":"healthy"}"#).with_header(ETAG, "\"smoke-1\""),
        )
        .await;
    Ok(())
}

async fn probe(page: &Page, origin: &Url, perf: &PerfTiming, phase: &'static str) -> Result<Vec<serde_json::Value>> {
    let mut results = Vec::with_capacity(PROBES.len());

    for &(strategy, path, accept) in PROBES {
        let request = Request::get(origin.join(path)?).header(ACCEPT, HeaderValue::from_static(accept));

        let start = Instant::now();
        let outcome = page.fetch(request).await;
        perf.record(phase, start.elapsed());

        let result = match outcome {
            Ok(response) => json!({
                "phase": phase,
                "strategy": strategy,
                "path": path,
                "status": response.status.as_u16(),
                "bytes": response.body.len(),
            }),
            Err(e) => json!({
                "phase": phase,
                "strategy": strategy,
                "path": path,
                "error": e.to_string(),
            }),
        };
        info!(%result, "Probe");
        results.push(result);
    }
    Ok(results)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CacheKitConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => CacheKitConfig::default(),
    };
    init_logging(config.log.clone());

    info!(version = %config.worker.version, "CacheKit smoke run starting");
    let perf = PerfTiming::new();
    let origin = Url::parse(ORIGIN)?;

    let network = Arc::new(MockNetwork::new());
    serve_site(&network, &config, &origin).await?;

    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let container = ServiceWorkerContainer::with_clock(network.clone(), clock.clone());

    let start = Instant::now();
    let scope = container
        .register(origin.join(SCRIPT_PATH)?.as_str(), RegistrationOptions::default())
        .await
        .context("registering worker")?;
    perf.record("register", start.elapsed());
    info!(scope = %scope, "Worker registered");

    let page = Page::builder(origin.clone(), network.clone())
        .with_web_storage()
        .indexed_db(IdbFactory::default())
        .service_worker(container.clone())
        .host(Arc::new(ScriptedHost::default()))
        .clock(clock.clone())
        .build();
    let controller = CacheController::new(config.controller.clone(), Some(page));
    let Some(page) = controller.page() else {
        anyhow::bail!("controller has no page");
    };

    let mut results = probe(page, &origin, &perf, "online").await?;

    // Let detached revalidations settle before dropping the network.
    tokio::time::sleep(Duration::from_millis(10)).await;
    network.set_online(false);
    clock.advance(Duration::from_secs(60));
    results.extend(probe(page, &origin, &perf, "offline").await?);
    network.set_online(true);

    let start = Instant::now();
    let update_detected = controller.check_for_updates().await;
    perf.record("check_for_updates", start.elapsed());

    let cache_before = controller.worker_cache_info().await;

    let start = Instant::now();
    let cleared = controller.clear_all_caches().await;
    perf.record("clear_all_caches", start.elapsed());
    if !cleared {
        error!("Cache clear reported failure");
    }

    let cache_after = controller.worker_cache_info().await;
    let page_info = controller.get_cache_info().await;

    let summary = json!({
        "status": if cleared { "ok" } else { "degraded" },
        "version": config.worker.version,
        "results": results,
        "update_detected": update_detected,
        "cache_before_clear": cache_before,
        "cache_after_clear": cache_after,
        "page": page_info,
        "timings": perf.summary(),
    });

    if let Some(path) = &args.perf_output {
        let pretty = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, pretty).with_context(|| format!("writing {path}"))?;
        info!(path = %path, "Wrote smoke summary");
    }
    println!("{summary}");

    Ok(())
}
