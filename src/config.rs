// ===============================
// src/config.rs
// ===============================
use clap::Parser;
use dotenvy::dotenv;
use std::time::Duration;
use tracing::warn;

/// Every flag can also come from the environment (or `.env`).
#[derive(Parser, Clone, Debug)]
#[command(name = "crypto_pulse", version, about = "Simulated crypto feed with rolling stats")]
pub struct Args {
    /// Feed period in milliseconds
    #[arg(long, env = "TICK_MS", default_value_t = 200)]
    pub tick_ms: u64,

    /// Per-asset price window length
    #[arg(long, env = "HISTORY_CAP", default_value_t = 50)]
    pub history_cap: usize,

    /// Snapshots allowed to queue in front of the stats worker
    #[arg(long, env = "STATS_QUEUE", default_value_t = 64)]
    pub stats_queue: usize,

    /// Asset ids to track, e.g. bitcoin,solana (default: whole catalogue)
    #[arg(long, env = "ASSETS", value_delimiter = ',')]
    pub assets: Vec<String>,

    /// Price above which an asset is flagged; 0 disables
    #[arg(long, env = "ALERT_THRESHOLD", default_value_t = 0.0)]
    pub alert_threshold: f64,

    /// Case-insensitive name/symbol filter for the console view
    #[arg(long, env = "SEARCH", default_value = "")]
    pub search: String,

    /// 0 disables the endpoint
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 5)]
    pub heartbeat_secs: u64,
}

impl Args {
    /// Clamp values that would stall the pipeline.
    pub fn normalized(mut self) -> Self {
        if self.tick_ms == 0 {
            warn!("TICK_MS=0, using 1");
            self.tick_ms = 1;
        }
        if self.history_cap == 0 {
            warn!("HISTORY_CAP=0, using 1");
            self.history_cap = 1;
        }
        if self.stats_queue == 0 {
            warn!("STATS_QUEUE=0, using 1");
            self.stats_queue = 1;
        }
        if self.heartbeat_secs == 0 {
            self.heartbeat_secs = 1;
        }
        if !self.alert_threshold.is_finite() || self.alert_threshold < 0.0 {
            warn!(threshold = self.alert_threshold, "bad ALERT_THRESHOLD, alerts disabled");
            self.alert_threshold = 0.0;
        }
        self.assets = self
            .assets
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        self
    }

    pub fn tick_period(&self) -> Duration { Duration::from_millis(self.tick_ms) }
    pub fn heartbeat(&self) -> Duration { Duration::from_secs(self.heartbeat_secs) }
}

pub fn load() -> Args {
    // .env first so clap's env fallbacks see it
    let _ = dotenv();
    Args::parse().normalized()
}
