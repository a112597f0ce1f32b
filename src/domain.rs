// ===============================
// src/domain.rs
// ===============================
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tracked instrument. Identity fields and `volume` never change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub last_update: DateTime<Utc>,
}

impl AssetRecord {
    pub fn new(id: &str, name: &str, symbol: &str, price: f64, change_percent: f64, volume: f64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            price,
            change_percent,
            volume,
            last_update: Utc::now(),
        }
    }
}

/// Full replacement set of records at one point in time.
///
/// The records sit behind an `Arc<[_]>` with no mutable accessor, so a published
/// snapshot can be handed to any number of readers and never changes underneath them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    seq: u64,
    taken_at: DateTime<Utc>,
    records: Arc<[AssetRecord]>,
}

impl Snapshot {
    pub fn new(seq: u64, taken_at: DateTime<Utc>, records: Vec<AssetRecord>) -> Self {
        Self { seq, taken_at, records: records.into() }
    }

    pub fn seq(&self) -> u64 { self.seq }
    pub fn taken_at(&self) -> DateTime<Utc> { self.taken_at }
    pub fn records(&self) -> &[AssetRecord] { &self.records }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
}

/// Windowed figures for a single asset, as used to build the market-wide summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStats {
    pub id: String,
    pub sma: f64,
    pub volatility: f64,
    pub samples: usize,
}

/// Market-wide summary computed after one snapshot. `calc_time_ms` covers the
/// history update and the aggregation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub seq: u64,
    pub average: f64,
    pub volatility: f64,
    pub max_price: f64,
    pub min_price: f64,
    pub calc_time_ms: f64,
    pub per_asset: Vec<AssetStats>,
}

/// Outbound message from the stats worker, in snapshot order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatsEvent {
    Summary(StatsSummary),
    /// Snapshot had no records; deliberately not a zeroed summary.
    NoData { seq: u64 },
    /// Snapshot failed validation; engine state was left untouched.
    Rejected { seq: u64, reason: String },
    /// Worker could not be started. Sent at most once.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Running,
    Stopped,
    /// Timer could not be started; the last published snapshot stays current.
    Frozen { reason: String },
}

/// Built-in asset catalogue seeded at startup.
pub fn default_assets() -> Vec<AssetRecord> {
    vec![
        AssetRecord::new("bitcoin", "Bitcoin", "BTC", 65432.1, 2.5, 1_500_000_000.0),
        AssetRecord::new("ethereum", "Ethereum", "ETH", 3456.78, -1.2, 800_000_000.0),
        AssetRecord::new("solana", "Solana", "SOL", 123.45, 5.8, 200_000_000.0),
        AssetRecord::new("cardano", "Cardano", "ADA", 0.45, 0.5, 50_000_000.0),
        AssetRecord::new("ripple", "XRP", "XRP", 0.62, -0.8, 100_000_000.0),
    ]
}

/// Restrict the catalogue to `ids` (catalogue order kept). Empty `ids` keeps everything.
/// Returns the selected records and the ids that matched nothing.
pub fn select_assets(catalogue: Vec<AssetRecord>, ids: &[String]) -> (Vec<AssetRecord>, Vec<String>) {
    if ids.is_empty() {
        return (catalogue, Vec::new());
    }
    let unknown = ids
        .iter()
        .filter(|id| !catalogue.iter().any(|r| r.id.eq_ignore_ascii_case(id)))
        .cloned()
        .collect();
    let selected = catalogue
        .into_iter()
        .filter(|r| ids.iter().any(|id| r.id.eq_ignore_ascii_case(id)))
        .collect();
    (selected, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_assets_keeps_catalogue_order() {
        let ids = vec!["ripple".to_string(), "BITCOIN".to_string(), "dogecoin".to_string()];
        let (selected, unknown) = select_assets(default_assets(), &ids);

        let got: Vec<&str> = selected.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["bitcoin", "ripple"]);
        assert_eq!(unknown, vec!["dogecoin".to_string()]);
    }

    #[test]
    fn test_select_assets_empty_means_all() {
        let (selected, unknown) = select_assets(default_assets(), &[]);
        assert_eq!(selected.len(), 5);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_camel_case_records() {
        let snap = Snapshot::new(7, Utc::now(), vec![AssetRecord::new("solana", "Solana", "SOL", 123.45, 5.8, 2.0e8)]);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"changePercent\":5.8"));
        assert!(json.contains("\"seq\":7"));

        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records(), snap.records());
    }
}
