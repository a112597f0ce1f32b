// ===============================
// src/stats.rs
// ===============================
//
// Aggregation engine + its worker task.
//
// Per snapshot:
//   1) empty -> NoData (never a zeroed summary)
//   2) push each price into that asset's window (cap 50, oldest evicted)
//   3) per asset: SMA + population std-dev over its own window
//   4) market figures = plain mean of the per-asset figures
//   5) max/min = instantaneous prices of this snapshot only
//   6) calc_time_ms = wall time of 2..5
//
// The history map lives inside the worker task and is reachable only through
// the inbound channel.
//

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::domain::{AssetRecord, AssetStats, Snapshot, StatsEvent, StatsSummary};
use crate::metrics::{
    CALC_TIME_MS, MARKET_AVERAGE, MARKET_VOLATILITY, STATS_NO_DATA, STATS_REJECTED, SUMMARIES,
    WORKER_UNAVAILABLE,
};

pub const DEFAULT_HISTORY_CAP: usize = 50;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("record #{index} has an empty id")]
    EmptyId { index: usize },
    #[error("duplicate id `{id}` in snapshot")]
    DuplicateId { id: String },
    #[error("`{id}`: invalid {field} ({value})")]
    BadField { id: String, field: &'static str, value: f64 },
}

/// Bounded FIFO of past prices for one asset.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    prices: VecDeque<f64>,
    cap: usize,
}

impl HistoryWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { prices: VecDeque::with_capacity(cap + 1), cap }
    }

    pub fn push(&mut self, price: f64) {
        self.prices.push_back(price);
        if self.prices.len() > self.cap {
            self.prices.pop_front();
        }
    }

    pub fn len(&self) -> usize { self.prices.len() }
    pub fn is_empty(&self) -> bool { self.prices.is_empty() }
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &f64> { self.prices.iter() }

    pub fn sma(&self) -> Option<f64> {
        if self.is_empty() { return None; }
        Some(self.prices.iter().sum::<f64>() / self.prices.len() as f64)
    }

    /// Population variance (divide by n). A single sample gives 0.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.sma()?;
        let n = self.prices.len() as f64;
        Some(self.prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n)
    }

    pub fn volatility(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Warm,
}

pub struct AggregationEngine {
    histories: HashMap<String, HistoryWindow>,
    cap: usize,
}

impl Default for AggregationEngine {
    fn default() -> Self { Self::new(DEFAULT_HISTORY_CAP) }
}

impl AggregationEngine {
    pub fn new(cap: usize) -> Self {
        Self { histories: HashMap::new(), cap: cap.max(1) }
    }

    pub fn state(&self) -> EngineState {
        if self.histories.is_empty() { EngineState::Uninitialized } else { EngineState::Warm }
    }

    #[cfg(test)]
    pub fn history(&self, id: &str) -> Option<&HistoryWindow> {
        self.histories.get(id)
    }

    /// `Ok(None)` means "no data". A rejected snapshot leaves every window untouched.
    pub fn ingest(&mut self, snapshot: &Snapshot) -> Result<Option<StatsSummary>, StatsError> {
        if snapshot.is_empty() {
            return Ok(None);
        }
        let records = snapshot.records();
        validate(records)?;

        let started = Instant::now();
        let cap = self.cap;
        let mut per_asset = Vec::with_capacity(records.len());
        let mut max_price = f64::NEG_INFINITY;
        let mut min_price = f64::INFINITY;

        for r in records {
            let window = self
                .histories
                .entry(r.id.clone())
                .or_insert_with(|| HistoryWindow::new(cap));
            window.push(r.price);

            per_asset.push(AssetStats {
                id: r.id.clone(),
                sma: window.sma().unwrap_or(r.price),
                volatility: window.volatility().unwrap_or(0.0),
                samples: window.len(),
            });

            max_price = max_price.max(r.price);
            min_price = min_price.min(r.price);
        }

        let n = per_asset.len() as f64;
        let average = per_asset.iter().map(|a| a.sma).sum::<f64>() / n;
        let volatility = per_asset.iter().map(|a| a.volatility).sum::<f64>() / n;

        Ok(Some(StatsSummary {
            seq: snapshot.seq(),
            average,
            volatility,
            max_price: if max_price.is_finite() { max_price } else { 0.0 },
            min_price: if min_price.is_finite() { min_price } else { 0.0 },
            calc_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
            per_asset,
        }))
    }
}

fn validate(records: &[AssetRecord]) -> Result<(), StatsError> {
    let mut seen = HashSet::with_capacity(records.len());
    for (index, r) in records.iter().enumerate() {
        if r.id.is_empty() {
            return Err(StatsError::EmptyId { index });
        }
        if !seen.insert(r.id.as_str()) {
            return Err(StatsError::DuplicateId { id: r.id.clone() });
        }
        let bad = |field, value| StatsError::BadField { id: r.id.clone(), field, value };
        if !r.price.is_finite() || r.price <= 0.0 {
            return Err(bad("price", r.price));
        }
        if !r.change_percent.is_finite() {
            return Err(bad("changePercent", r.change_percent));
        }
        if !r.volume.is_finite() || r.volume < 0.0 {
            return Err(bad("volume", r.volume));
        }
    }
    Ok(())
}

/// Handle to the worker task that owns an `AggregationEngine`.
pub struct StatsWorker {
    task: Option<JoinHandle<()>>,
}

impl StatsWorker {
    /// Spawn the worker. Without a runtime the worker is reported once as
    /// `StatsEvent::Unavailable` on `out` and the returned handle is inert.
    pub fn spawn(
        engine: AggregationEngine,
        rx: mpsc::Receiver<Snapshot>,
        out: mpsc::Sender<StatsEvent>,
    ) -> Self {
        match Handle::try_current() {
            Ok(handle) => Self { task: Some(handle.spawn(run(engine, rx, out))) },
            Err(e) => {
                let reason = format!("no worker runtime: {e}");
                warn!(%reason, "stats: worker unavailable, statistics disabled");
                WORKER_UNAVAILABLE.set(1);
                let _ = out.try_send(StatsEvent::Unavailable { reason });
                Self { task: None }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Safe with messages in flight; nothing is delivered after this returns.
    pub fn terminate(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("stats: worker terminated");
        }
    }
}

impl Drop for StatsWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn run(mut engine: AggregationEngine, mut rx: mpsc::Receiver<Snapshot>, out: mpsc::Sender<StatsEvent>) {
    info!(cap = engine.cap, "stats: worker started");
    while let Some(snapshot) = rx.recv().await {
        let seq = snapshot.seq();
        let was = engine.state();
        let event = match engine.ingest(&snapshot) {
            Ok(Some(summary)) => {
                SUMMARIES.inc();
                CALC_TIME_MS.observe(summary.calc_time_ms);
                MARKET_AVERAGE.set(summary.average);
                MARKET_VOLATILITY.set(summary.volatility);
                StatsEvent::Summary(summary)
            }
            Ok(None) => {
                STATS_NO_DATA.inc();
                StatsEvent::NoData { seq }
            }
            Err(e) => {
                STATS_REJECTED.inc();
                warn!(seq, error = %e, "stats: malformed snapshot rejected");
                StatsEvent::Rejected { seq, reason: e.to_string() }
            }
        };
        if was == EngineState::Uninitialized && engine.state() == EngineState::Warm {
            info!(seq, "stats: engine warm");
        }
        if out.send(event).await.is_err() {
            debug!("stats: observer gone, worker exiting");
            break;
        }
    }
    info!("stats: worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetRecord;
    use chrono::Utc;

    fn asset(id: &str, price: f64) -> AssetRecord {
        AssetRecord::new(id, id, &id.to_ascii_uppercase(), price, 0.0, 1.0)
    }

    fn snap(seq: u64, records: Vec<AssetRecord>) -> Snapshot {
        Snapshot::new(seq, Utc::now(), records)
    }

    fn close(a: f64, b: f64) -> bool { (a - b).abs() < 1e-3 }

    #[test]
    fn test_three_point_history_sma_and_volatility() {
        let mut engine = AggregationEngine::default();
        let mut last = None;
        for (i, p) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            last = engine.ingest(&snap(i as u64, vec![asset("btc", p)])).unwrap();
        }
        let s = last.unwrap();
        assert!(close(s.average, 20.0));
        assert!(close(engine.history("btc").unwrap().variance().unwrap(), 66.667));
        assert!(close(s.volatility, 8.165));
        assert_eq!(s.max_price, 30.0);
        assert_eq!(s.min_price, 30.0);
        assert_eq!(s.per_asset[0].samples, 3);
    }

    #[test]
    fn test_first_observation_has_zero_volatility() {
        let mut engine = AggregationEngine::default();
        let s = engine
            .ingest(&snap(1, vec![asset("btc", 100.0), asset("eth", 50.0)]))
            .unwrap()
            .unwrap();
        assert_eq!(s.volatility, 0.0);
        assert!(close(s.average, 75.0));
        assert_eq!(s.max_price, 100.0);
        assert_eq!(s.min_price, 50.0);
        assert!(s.calc_time_ms >= 0.0);
    }

    #[test]
    fn test_empty_snapshot_is_no_data() {
        let mut engine = AggregationEngine::default();
        assert_eq!(engine.ingest(&snap(0, Vec::new())), Ok(None));
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_window_keeps_most_recent_in_arrival_order() {
        let mut engine = AggregationEngine::default();
        for i in 0..60 {
            engine.ingest(&snap(i, vec![asset("ada", 1.0 + i as f64)])).unwrap();
            assert!(engine.history("ada").unwrap().len() <= DEFAULT_HISTORY_CAP);
        }
        let got: Vec<f64> = engine.history("ada").unwrap().iter().copied().collect();
        let want: Vec<f64> = (10..60).map(|i| 1.0 + i as f64).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_window_after_exactly_cap_ingests() {
        let mut w = HistoryWindow::new(DEFAULT_HISTORY_CAP);
        for i in 0..50 {
            w.push(i as f64);
        }
        assert_eq!(w.len(), 50);
        assert_eq!(w.iter().next(), Some(&0.0));
        w.push(50.0);
        assert_eq!(w.len(), 50);
        assert_eq!(w.iter().next(), Some(&1.0));
    }

    #[test]
    fn test_ingest_is_order_sensitive() {
        let s1 = snap(1, vec![asset("sol", 10.0)]);
        let s2 = snap(2, vec![asset("sol", 20.0)]);

        let mut a = AggregationEngine::default();
        let a_first = a.ingest(&s1).unwrap().unwrap();
        let a_second = a.ingest(&s2).unwrap().unwrap();

        let mut b = AggregationEngine::default();
        let b_first = b.ingest(&s2).unwrap().unwrap();
        let b_second = b.ingest(&s1).unwrap().unwrap();

        assert!(close(a_first.average, 10.0));
        assert!(close(b_first.average, 20.0));
        // same full window, same mean
        assert!(close(a_second.average, b_second.average));

        // once eviction kicks in the final SMA depends on arrival order
        let mut c = AggregationEngine::new(1);
        c.ingest(&s1).unwrap();
        let c_last = c.ingest(&s2).unwrap().unwrap();
        let mut d = AggregationEngine::new(1);
        d.ingest(&s2).unwrap();
        let d_last = d.ingest(&s1).unwrap().unwrap();
        assert!(close(c_last.average, 20.0));
        assert!(close(d_last.average, 10.0));
    }

    #[test]
    fn test_malformed_snapshot_leaves_state_untouched() {
        let mut engine = AggregationEngine::default();
        let bad = snap(1, vec![asset("btc", 10.0), asset("eth", f64::NAN)]);
        assert!(matches!(engine.ingest(&bad), Err(StatsError::BadField { field: "price", .. })));
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.history("btc").is_none());

        engine.ingest(&snap(2, vec![asset("btc", 10.0)])).unwrap();
        assert_eq!(engine.state(), EngineState::Warm);

        let dup = snap(3, vec![asset("btc", 11.0), asset("btc", 12.0)]);
        assert_eq!(engine.ingest(&dup), Err(StatsError::DuplicateId { id: "btc".into() }));
        assert_eq!(engine.history("btc").unwrap().len(), 1);

        let empty_id = snap(4, vec![asset("", 1.0)]);
        assert_eq!(engine.ingest(&empty_id), Err(StatsError::EmptyId { index: 0 }));

        let negative = snap(5, vec![asset("btc", -1.0)]);
        assert!(engine.ingest(&negative).is_err());
        assert_eq!(engine.history("btc").unwrap().len(), 1);
    }

    #[test]
    fn test_spawn_without_runtime_reports_once() {
        let (_tx, rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let worker = StatsWorker::spawn(AggregationEngine::default(), rx, out_tx);

        assert!(!worker.is_running());
        assert!(matches!(out_rx.try_recv(), Ok(StatsEvent::Unavailable { .. })));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_worker_processes_in_arrival_order() {
        let (tx, rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let mut worker = StatsWorker::spawn(AggregationEngine::default(), rx, out_tx);

        tx.send(snap(1, Vec::new())).await.unwrap();
        tx.send(snap(2, vec![asset("btc", 10.0)])).await.unwrap();
        tx.send(snap(3, vec![asset("btc", f64::INFINITY)])).await.unwrap();
        tx.send(snap(4, vec![asset("btc", 30.0)])).await.unwrap();

        assert_eq!(out_rx.recv().await, Some(StatsEvent::NoData { seq: 1 }));
        match out_rx.recv().await {
            Some(StatsEvent::Summary(s)) => assert_eq!(s.seq, 2),
            other => panic!("expected summary, got {other:?}"),
        }
        assert!(matches!(out_rx.recv().await, Some(StatsEvent::Rejected { seq: 3, .. })));
        match out_rx.recv().await {
            // the rejected tick did not pollute the window
            Some(StatsEvent::Summary(s)) => assert!(close(s.average, 20.0)),
            other => panic!("expected summary, got {other:?}"),
        }

        worker.terminate();
        worker.terminate();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_terminate_with_message_in_flight() {
        let (tx, rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let mut worker = StatsWorker::spawn(AggregationEngine::default(), rx, out_tx);

        for i in 0..4 {
            tx.send(snap(i, vec![asset("eth", 100.0)])).await.unwrap();
        }
        worker.terminate();
        tokio::task::yield_now().await;
        // the receiver went away with the aborted task
        let mut closed = false;
        for _ in 0..100 {
            if tx.is_closed() { closed = true; break; }
            tokio::task::yield_now().await;
        }
        assert!(closed);
    }
}
