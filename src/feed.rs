// ===============================
// src/feed.rs
// ===============================
//
// Feed simulator:
// - step / tick : pure price-mutation rule (tiered volatility + mean-reverting change%)
// - start       : owned 200ms timer task that publishes a fresh Snapshot per tick
//                 into a watch cell (live view) and hands it to the stats worker
//
// Notes:
// - Prices below 1.0 move up to 0.8% per tick and keep 4 decimals,
//   everything else moves up to 0.2% and keeps 2 decimals.
// - The tick body is synchronous, so shutdown can only land between ticks.
//

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::domain::{AssetRecord, FeedStatus, Snapshot};
use crate::metrics::{ASSET_PRICE, FEED_FROZEN, SNAPSHOTS_DROPPED, TICKS};

const LOW_PRICE: f64 = 1.0;
const VOL_LOW_PRICE: f64 = 0.008;
const VOL_DEFAULT: f64 = 0.002;
const REVERSION: f64 = 0.01;
const SHIFT: f64 = 0.5;

pub fn round_dp(x: f64, dp: i32) -> f64 {
    let f = 10f64.powi(dp);
    (x * f).round() / f
}

/// Decimal places kept for a price, decided by the price *before* the move.
pub fn price_precision(price: f64) -> i32 {
    if price < LOW_PRICE { 4 } else { 2 }
}

/// Apply one tick of the price model to a single record.
pub fn step<R: Rng>(rec: &AssetRecord, rng: &mut R, now: DateTime<Utc>) -> AssetRecord {
    let v = if rec.price < LOW_PRICE { VOL_LOW_PRICE } else { VOL_DEFAULT };
    let u: f64 = rng.gen_range(-v..=v);
    let new_price = rec.price * (1.0 + u);

    let r: f64 = rng.gen_range(-SHIFT..=SHIFT);
    let new_change = rec.change_percent - rec.change_percent * REVERSION + r;

    AssetRecord {
        price: round_dp(new_price, price_precision(rec.price)),
        change_percent: round_dp(new_change, 2),
        last_update: now,
        ..rec.clone()
    }
}

/// Build the next snapshot. Always a fresh allocation, ids and order preserved.
pub fn tick<R: Rng>(prev: &Snapshot, rng: &mut R, now: DateTime<Utc>) -> Snapshot {
    let records = prev.records().iter().map(|r| step(r, &mut *rng, now)).collect();
    Snapshot::new(prev.seq() + 1, now, records)
}

pub struct FeedSimulator;

impl FeedSimulator {
    /// Start the periodic feed. Without a tokio runtime the feed degrades to
    /// `FeedStatus::Frozen` and keeps serving the initial snapshot.
    pub fn start(
        initial: Vec<AssetRecord>,
        period: Duration,
        stats_tx: Option<mpsc::Sender<Snapshot>>,
    ) -> FeedHandle {
        let first = Snapshot::new(0, Utc::now(), initial);
        let (snap_tx, snap_rx) = watch::channel(first.clone());
        let (status_tx, status_rx) = watch::channel(FeedStatus::Running);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = match Handle::try_current() {
            Ok(handle) => {
                info!(assets = first.len(), period_ms = period.as_millis() as u64, "feed: started");
                Some(handle.spawn(run(first, period, snap_tx, status_tx, shutdown_rx, stats_tx)))
            }
            Err(e) => {
                let reason = format!("no timer runtime: {e}");
                warn!(%reason, "feed: frozen, serving initial snapshot");
                FEED_FROZEN.set(1);
                status_tx.send_replace(FeedStatus::Frozen { reason });
                None
            }
        };

        FeedHandle { snapshots: snap_rx, status: status_rx, shutdown: shutdown_tx, task }
    }
}

async fn run(
    mut current: Snapshot,
    period: Duration,
    snap_tx: watch::Sender<Snapshot>,
    status_tx: watch::Sender<FeedStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut stats_tx: Option<mpsc::Sender<Snapshot>>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // StdRng is Send, ThreadRng is not
    let mut rng = StdRng::from_entropy();

    loop {
        tokio::select! {
            biased;
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() { break; }
            }
            _ = ticker.tick() => {
                current = tick(&current, &mut rng, Utc::now());
                TICKS.inc();
                for r in current.records() {
                    ASSET_PRICE.with_label_values(&[&r.symbol]).set(r.price);
                }
                snap_tx.send_replace(current.clone());

                if let Some(tx) = &stats_tx {
                    match tx.try_send(current.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(s)) => {
                            SNAPSHOTS_DROPPED.inc();
                            warn!(seq = s.seq(), "feed: stats queue full, snapshot skipped for stats");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("feed: stats worker gone, no longer forwarding");
                            stats_tx = None;
                        }
                    }
                }
            }
        }
    }

    status_tx.send_replace(FeedStatus::Stopped);
    info!(last_seq = current.seq(), "feed: stopped");
}

/// Owner of the feed task. Dropping the handle stops the timer.
pub struct FeedHandle {
    snapshots: watch::Receiver<Snapshot>,
    status: watch::Receiver<FeedStatus>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    /// Read-only view of the live record set.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> { self.snapshots.clone() }
    pub fn status(&self) -> watch::Receiver<FeedStatus> { self.status.clone() }
    pub fn latest(&self) -> Snapshot { self.snapshots.borrow().clone() }

    /// Idempotent; the task exits before its next tick.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop and wait for the task to finish its current tick.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
