// ===============================
// src/observer.rs
// ===============================
//
// Console consumer of the pipeline: logs each stats event, and on every
// heartbeat prints the live view of the feed filtered by the search term,
// with top gainers and threshold alerts. The core never sees these settings.
//
use chrono::Utc;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{AssetRecord, FeedStatus, Snapshot, StatsEvent, StatsSummary};

pub const TOP_GAINER_MIN_CHANGE: f64 = 5.0;

#[derive(Debug, Clone, Default)]
pub struct ViewCfg {
    pub alert_threshold: f64,
    pub search: String,
}

/// Empty term matches everything.
pub fn matches_search(r: &AssetRecord, term: &str) -> bool {
    let term = term.trim().to_lowercase();
    term.is_empty()
        || r.name.to_lowercase().contains(&term)
        || r.symbol.to_lowercase().contains(&term)
}

pub fn filter_records<'a>(records: &'a [AssetRecord], term: &str) -> Vec<&'a AssetRecord> {
    records.iter().filter(|r| matches_search(r, term)).collect()
}

/// Change% above 5, best first.
pub fn top_gainers(records: &[AssetRecord]) -> Vec<&AssetRecord> {
    let mut out: Vec<&AssetRecord> = records
        .iter()
        .filter(|r| r.change_percent > TOP_GAINER_MIN_CHANGE)
        .collect();
    out.sort_by(|a, b| b.change_percent.total_cmp(&a.change_percent));
    out
}

/// Threshold 0 disables alerts.
pub fn is_alerting(r: &AssetRecord, threshold: f64) -> bool {
    threshold > 0.0 && r.price > threshold
}

#[derive(Debug, Default)]
pub struct Observer {
    cfg: ViewCfg,
    latest: Option<StatsSummary>,
    summaries: u64,
    unavailable_reported: bool,
}

impl Observer {
    pub fn new(cfg: ViewCfg) -> Self { Self { cfg, ..Default::default() } }

    #[cfg(test)]
    pub fn latest(&self) -> Option<&StatsSummary> { self.latest.as_ref() }

    pub fn on_stats(&mut self, ev: &StatsEvent) {
        match ev {
            StatsEvent::Summary(s) => {
                self.summaries += 1;
                debug!(
                    seq = s.seq,
                    avg = s.average,
                    vol = s.volatility,
                    max = s.max_price,
                    min = s.min_price,
                    calc_ms = s.calc_time_ms,
                    "stats"
                );
                self.latest = Some(s.clone());
            }
            // keep the last good summary on screen
            StatsEvent::NoData { seq } => debug!(seq, "stats: no data"),
            StatsEvent::Rejected { seq, reason } => warn!(seq, %reason, "stats: tick skipped"),
            StatsEvent::Unavailable { reason } => {
                if !self.unavailable_reported {
                    self.unavailable_reported = true;
                    warn!(%reason, "statistics unavailable, showing prices only");
                }
            }
        }
    }

    /// Lines for the periodic console view.
    pub fn render(&self, snap: &Snapshot) -> Vec<String> {
        let mut lines = Vec::new();
        for r in filter_records(snap.records(), &self.cfg.search) {
            let flag = if is_alerting(r, self.cfg.alert_threshold) { " [ALERT]" } else { "" };
            lines.push(format!("{:<5} {:>12} {:>+7.2}%{}", r.symbol, r.price, r.change_percent, flag));
        }
        let gainers: Vec<&str> = top_gainers(snap.records()).iter().map(|r| r.symbol.as_str()).collect();
        if !gainers.is_empty() {
            lines.push(format!("top gainers: {}", gainers.join(", ")));
        }
        match &self.latest {
            Some(s) => lines.push(format!(
                "avg {:.4} | vol {:.4} | max {} | min {} | calc {:.3}ms",
                s.average, s.volatility, s.max_price, s.min_price, s.calc_time_ms
            )),
            None => lines.push("stats: waiting for data".to_string()),
        }
        lines
    }
}

/// Runs until aborted. A closed stats channel (worker gone or never started)
/// only stops that branch; prices keep rendering.
pub async fn run(
    mut stats_rx: mpsc::Receiver<StatsEvent>,
    mut snapshots: watch::Receiver<Snapshot>,
    mut feed_status: watch::Receiver<FeedStatus>,
    cfg: ViewCfg,
    heartbeat: Duration,
) {
    let mut obs = Observer::new(cfg);
    let mut beat = interval(heartbeat);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut frozen_reported = false;
    let mut stats_open = true;

    loop {
        tokio::select! {
            maybe_ev = stats_rx.recv(), if stats_open => {
                match maybe_ev {
                    Some(ev) => obs.on_stats(&ev),
                    None => {
                        stats_open = false;
                        warn!("observer: stats channel closed, showing last known stats");
                    }
                }
            }
            res = feed_status.changed(), if !frozen_reported => {
                if res.is_err() {
                    frozen_reported = true;
                    continue;
                }
                if let FeedStatus::Frozen { reason } = &*feed_status.borrow_and_update() {
                    frozen_reported = true;
                    warn!(%reason, "feed frozen, prices will not update");
                }
            }
            _ = beat.tick() => {
                let snap = snapshots.borrow_and_update().clone();
                for line in obs.render(&snap) {
                    info!("{line}");
                }
                let age_ms = (Utc::now() - snap.taken_at()).num_milliseconds();
                info!(summaries = obs.summaries, seq = snap.seq(), age_ms, "heartbeat");
                obs.summaries = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::default_assets;

    #[test]
    fn test_search_matches_name_or_symbol() {
        let assets = default_assets();
        let got: Vec<&str> = filter_records(&assets, "eth").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["ethereum"]);
        let got: Vec<&str> = filter_records(&assets, "  XR ").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["ripple"]);
        assert_eq!(filter_records(&assets, "").len(), 5);
        assert!(filter_records(&assets, "doge").is_empty());
    }

    #[test]
    fn test_top_gainers_sorted_desc() {
        let mut assets = default_assets();
        assets[0].change_percent = 7.5;
        assets[1].change_percent = 5.0;
        let got: Vec<&str> = top_gainers(&assets).iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(got, vec!["BTC", "SOL"]);
    }

    #[test]
    fn test_alert_threshold_zero_disables() {
        let assets = default_assets();
        let btc = &assets[0];
        assert!(!is_alerting(btc, 0.0));
        assert!(is_alerting(btc, 60_000.0));
        assert!(!is_alerting(btc, 70_000.0));
    }

    #[test]
    fn test_no_data_keeps_previous_summary() {
        let mut obs = Observer::new(ViewCfg::default());
        let summary = StatsSummary {
            seq: 1,
            average: 10.0,
            volatility: 0.0,
            max_price: 10.0,
            min_price: 10.0,
            calc_time_ms: 0.01,
            per_asset: Vec::new(),
        };
        obs.on_stats(&StatsEvent::Summary(summary.clone()));
        obs.on_stats(&StatsEvent::NoData { seq: 2 });
        obs.on_stats(&StatsEvent::Rejected { seq: 3, reason: "bad".into() });
        assert_eq!(obs.latest(), Some(&summary));
    }

    #[test]
    fn test_render_marks_alerts_and_filters() {
        let obs = Observer::new(ViewCfg { alert_threshold: 1_000.0, search: "b".into() });
        let snap = Snapshot::new(3, Utc::now(), default_assets());
        let lines = obs.render(&snap);

        assert!(lines[0].starts_with("BTC") && lines[0].ends_with("[ALERT]"));
        assert_eq!(lines.iter().filter(|l| l.contains("[ALERT]")).count(), 1);
        assert!(lines.iter().any(|l| l == "top gainers: SOL"));
        assert_eq!(lines.last().map(String::as_str), Some("stats: waiting for data"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_running_when_stats_worker_unavailable() {
        let (_snap_tx, snap_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(4);
        // no runtime on this thread: the worker reports Unavailable and drops `out_tx`
        let worker = std::thread::spawn(move || {
            crate::stats::StatsWorker::spawn(crate::stats::AggregationEngine::default(), snap_rx, out_tx)
        })
        .join()
        .unwrap();
        assert!(!worker.is_running());

        let (_live_tx, live_rx) = watch::channel(Snapshot::new(0, Utc::now(), default_assets()));
        let (_status_tx, status_rx) = watch::channel(FeedStatus::Running);
        let task = tokio::spawn(run(out_rx, live_rx, status_rx, ViewCfg::default(), Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!task.is_finished());
        task.abort();
    }
}
