//! Domain model shared by every layer of `chainpulse-data`.
//!
//! Raw provider payloads never appear here: they are converted into these types by the
//! [`validate`](crate::validate) boundary, after which every required field is present.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{str::FromStr, time::Duration};

pub mod bundle;

pub use bundle::{
    AiAnalysis, CashflowMetrics, CategoryBundle, CategoryMetrics, MarketOverview,
    RollingAverageSet, Severity, SpikeDetection, TvlMetrics, UsageMetrics,
};

/// Identifier of a blockchain network (eg/ "ethereum", "solana").
pub type NetworkId = SmolStr;

/// Metric category, one per dashboard panel.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[display("usage")]
    Usage,
    #[display("tvl")]
    Tvl,
    #[display("cashflow")]
    Cashflow,
    #[display("market")]
    Market,
    #[display("ai")]
    Ai,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Usage,
        Category::Tvl,
        Category::Cashflow,
        Category::Market,
        Category::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Usage => "usage",
            Category::Tvl => "tvl",
            Category::Cashflow => "cashflow",
            Category::Market => "market",
            Category::Ai => "ai",
        }
    }

    /// Wire names of every metric in the category.
    pub fn metrics(&self) -> &'static [&'static str] {
        match self {
            Category::Usage => <UsageMetrics as CategoryMetrics>::METRICS,
            Category::Tvl => <TvlMetrics as CategoryMetrics>::METRICS,
            Category::Cashflow => <CashflowMetrics as CategoryMetrics>::METRICS,
            Category::Market => <MarketOverview as CategoryMetrics>::METRICS,
            Category::Ai => <AiAnalysis as CategoryMetrics>::METRICS,
        }
    }

    /// Cache time-to-live of a category bundle, scaled to how volatile the category is.
    pub fn cache_ttl(&self) -> Duration {
        match self {
            Category::Usage => Duration::from_secs(60),
            Category::Market => Duration::from_secs(2 * 60),
            Category::Tvl | Category::Cashflow => Duration::from_secs(5 * 60),
            Category::Ai => Duration::from_secs(10 * 60),
        }
    }
}

/// Dashboard lookback window.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    Display,
    Deserialize,
    Serialize,
)]
pub enum Timeframe {
    #[serde(rename = "24H")]
    #[display("24H")]
    Day,
    #[serde(rename = "7D")]
    #[display("7D")]
    Week,
    #[default]
    #[serde(rename = "30D")]
    #[display("30D")]
    Month,
    #[serde(rename = "90D")]
    #[display("90D")]
    Quarter,
    #[serde(rename = "1Y")]
    #[display("1Y")]
    Year,
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "24H" | "1D" => Ok(Timeframe::Day),
            "7D" => Ok(Timeframe::Week),
            "30D" => Ok(Timeframe::Month),
            "90D" => Ok(Timeframe::Quarter),
            "1Y" | "365D" => Ok(Timeframe::Year),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Direction of a metric, derived from its percentage change with a ±1% dead-band.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Stable,
}

impl Trend {
    /// Percentage change that must be exceeded before a trend leaves [`Trend::Stable`].
    pub const DEAD_BAND_PERCENT: f64 = 1.0;

    pub fn from_change_percent(change_percent: f64) -> Self {
        if change_percent > Self::DEAD_BAND_PERCENT {
            Trend::Up
        } else if change_percent < -Self::DEAD_BAND_PERCENT {
            Trend::Down
        } else {
            Trend::Stable
        }
    }
}

/// Where the data in a [`CategoryBundle`] came from.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Cache,
    Fallback,
}

/// One observation of a metric time-series.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u64>,
}

impl MetricSeriesPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            volume: None,
            sample_count: None,
        }
    }
}

/// Sort `points` ascending by timestamp, keeping the last point of any duplicated timestamp.
pub fn normalize_series(mut points: Vec<MetricSeriesPoint>) -> Vec<MetricSeriesPoint> {
    // Stable sort keeps arrival order within equal timestamps
    points.sort_by_key(|point| point.timestamp);

    let mut normalized: Vec<MetricSeriesPoint> = Vec::with_capacity(points.len());
    for point in points {
        match normalized.last_mut() {
            Some(last) if last.timestamp == point.timestamp => *last = point,
            _ => normalized.push(point),
        }
    }
    normalized
}

/// Current state of a single metric.
///
/// `value` is only ever `None` inside a fallback bundle.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub value: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub trend: Trend,
    pub timestamp: DateTime<Utc>,
}

impl MetricSnapshot {
    /// Placeholder snapshot used by the fallback synthesizer.
    pub fn placeholder() -> Self {
        Self {
            value: None,
            change: None,
            change_percent: None,
            trend: Trend::Stable,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Snapshot of `cache_info` exposed to consumers for observability.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct CacheInfo {
    pub hit: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub size: Option<usize>,
}
