// ===============================
// src/main.rs
// ===============================
/*
 # run with defaults (200ms ticks, all assets, metrics on :9898)
 cargo run --release

 # track two assets, flag prices above 100
 ASSETS=bitcoin,solana ALERT_THRESHOLD=100 cargo run

 curl -s localhost:9898/metrics | egrep '^(market_|stats_|feed_)'
*/
/*
=============================================================================
Project : crypto_pulse — simulated crypto price feed with rolling statistics
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Ticks a small set of synthetic assets every 200ms, hands each
          snapshot to a dedicated stats worker (windowed SMA / volatility),
          reports summaries to the console and exposes Prometheus
          metrics. Price history lives only in the worker's windows.
=============================================================================
*/
mod config;
mod domain;
mod feed;
mod metrics;
mod observer;
mod stats;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::domain::StatsEvent;
use crate::feed::FeedSimulator;
use crate::stats::{AggregationEngine, StatsWorker};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = config::load();

    let (assets, unknown) = domain::select_assets(domain::default_assets(), &args.assets);
    for id in &unknown {
        warn!(%id, "unknown asset id, skipped");
    }
    if assets.is_empty() {
        warn!("no assets selected, feed will publish empty snapshots");
    }

    info!(
        tick_ms = args.tick_ms,
        history_cap = args.history_cap,
        stats_queue = args.stats_queue,
        assets = ?assets.iter().map(|a| a.symbol.as_str()).collect::<Vec<_>>(),
        alert_threshold = args.alert_threshold,
        search = %args.search,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_TICK_MS.set(args.tick_ms as i64);
    metrics::CONFIG_HISTORY_CAP.set(args.history_cap as i64);
    for a in &assets {
        metrics::CONFIG_ASSET.with_label_values(&[&a.symbol]).set(1);
    }
    if args.metrics_port != 0 {
        metrics::serve_metrics(args.metrics_port);
    }

    // ---- Buses ----
    // feed -> stats: bounded, ordered; stats -> observer: ordered
    let (snap_tx, snap_rx) = mpsc::channel(args.stats_queue);
    let (stats_tx, stats_rx) = mpsc::channel::<StatsEvent>(args.stats_queue);

    // ---- Stats worker ----
    let mut worker = StatsWorker::spawn(AggregationEngine::new(args.history_cap), snap_rx, stats_tx);

    // ---- Feed ----
    let feed = FeedSimulator::start(assets, args.tick_period(), Some(snap_tx));

    // ---- Observer ----
    let view = observer::ViewCfg { alert_threshold: args.alert_threshold, search: args.search.clone() };
    let mut observer_task = tokio::spawn(observer::run(
        stats_rx,
        feed.subscribe(),
        feed.status(),
        view,
        args.heartbeat(),
    ));
    info!(seq = feed.latest().seq(), "pipeline up");

    let observer_done = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(?e, "ctrl_c listener failed, shutting down");
            }
            info!("shutdown requested");
            false
        }
        _ = &mut observer_task => {
            warn!("observer exited");
            true
        }
    };

    // ---- Shutdown: feed first so no tick is half-published, then the worker ----
    let live = feed.subscribe();
    feed.join().await;
    let last_seq = live.borrow().seq();
    info!(worker_running = worker.is_running(), "stopping stats worker");
    worker.terminate();
    if !observer_done {
        observer_task.abort();
        let _ = observer_task.await;
    }
    info!(last_seq, "bye");
}
