// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_ticks_total", "feed simulator ticks").unwrap());

pub static SNAPSHOTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "feed_snapshots_dropped_total",
        "snapshots not handed to stats because its queue was full",
    )
    .unwrap()
});

pub static ASSET_PRICE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("asset_price", "last simulated price"), &["symbol"]).unwrap()
});

pub static FEED_FROZEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("feed_frozen", "1 if the feed timer could not be started").unwrap()
});

// -------- Stats worker --------
pub static SUMMARIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stats_summaries_total", "summaries computed").unwrap());

pub static STATS_NO_DATA: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stats_no_data_total", "empty snapshots seen").unwrap());

pub static STATS_REJECTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stats_rejected_total", "malformed snapshots rejected").unwrap());

// Wall time of one aggregation (milliseconds)
pub static CALC_TIME_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("stats_calc_time_ms", "aggregation wall time (ms)")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 20.0]),
    )
    .unwrap()
});

pub static MARKET_AVERAGE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("market_average", "mean of per-asset SMA").unwrap());

pub static MARKET_VOLATILITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("market_volatility", "mean of per-asset volatility").unwrap());

pub static WORKER_UNAVAILABLE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("stats_worker_unavailable", "1 if the stats worker could not be started").unwrap()
});

// ---- Config visibility ----
pub static CONFIG_TICK_MS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_tick_ms", "feed period (ms)").unwrap());

pub static CONFIG_HISTORY_CAP: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_history_cap", "per-asset window length").unwrap());

pub static CONFIG_ASSET: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_asset", "tracked assets (label: symbol)"), &["symbol"]).unwrap()
});

pub fn init() {
    let results = [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_DROPPED.clone())),
        REGISTRY.register(Box::new(ASSET_PRICE.clone())),
        REGISTRY.register(Box::new(FEED_FROZEN.clone())),
        REGISTRY.register(Box::new(SUMMARIES.clone())),
        REGISTRY.register(Box::new(STATS_NO_DATA.clone())),
        REGISTRY.register(Box::new(STATS_REJECTED.clone())),
        REGISTRY.register(Box::new(CALC_TIME_MS.clone())),
        REGISTRY.register(Box::new(MARKET_AVERAGE.clone())),
        REGISTRY.register(Box::new(MARKET_VOLATILITY.clone())),
        REGISTRY.register(Box::new(WORKER_UNAVAILABLE.clone())),
        REGISTRY.register(Box::new(CONFIG_TICK_MS.clone())),
        REGISTRY.register(Box::new(CONFIG_HISTORY_CAP.clone())),
        REGISTRY.register(Box::new(CONFIG_ASSET.clone())),
    ];
    for r in results {
        if let Err(e) = r {
            warn!(?e, "metrics: register failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (any path) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Dedicated OS thread keeps the endpoint off the tokio workers
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics: bind failed, endpoint disabled");
                return;
            }
        };
        info!(%addr, "metrics: listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(?e, "metrics: accept error"),
            }
        }
    });
}
