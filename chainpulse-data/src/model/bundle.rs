use super::{Category, DataSource, MetricSeriesPoint, MetricSnapshot, NetworkId, Timeframe};
use crate::{
    spike,
    stats::{self, SeriesSummary},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fmt::Debug};

/// Trailing moving averages of one metric.
///
/// A window stays `None` until the series holds at least that many samples.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct RollingAverageSet {
    #[serde(rename = "7d")]
    pub d7: Option<f64>,
    #[serde(rename = "30d")]
    pub d30: Option<f64>,
    #[serde(rename = "90d")]
    pub d90: Option<f64>,
}

impl RollingAverageSet {
    /// Shortest populated window, used as the spike baseline.
    pub fn shortest(&self) -> Option<f64> {
        self.d7.or(self.d30).or(self.d90)
    }
}

/// Spike severity band.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

/// Classification of a metric's latest observation against its baseline.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpikeDetection {
    pub is_spike: bool,
    pub severity: Severity,
    pub confidence: f64,
    pub threshold: f64,
    pub current_value: f64,
    pub baseline: f64,
    pub deviation: f64,
}

impl SpikeDetection {
    /// Non-spike entry for a metric that has no usable observation.
    pub fn quiet(threshold: f64) -> Self {
        Self {
            is_spike: false,
            severity: Severity::Low,
            confidence: 0.0,
            threshold,
            current_value: 0.0,
            baseline: 0.0,
            deviation: 0.0,
        }
    }
}

/// Typed metric set of one [`Category`].
///
/// Implementors list their metric names once; both the validation boundary and the fallback
/// synthesizer build instances through [`CategoryMetrics::from_snapshots`], so live and
/// placeholder data can never disagree on shape.
pub trait CategoryMetrics:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const CATEGORY: Category;

    /// Wire names of every [`MetricSnapshot`] field, in declaration order.
    const METRICS: &'static [&'static str];

    fn from_snapshots<E, F>(lookup: F) -> Result<Self, E>
    where
        F: FnMut(&'static str) -> Result<MetricSnapshot, E>;

    fn snapshots(&self) -> Vec<(&'static str, &MetricSnapshot)>;

    /// Copy category specific, non-snapshot fields out of a validated payload.
    fn absorb_extras(&mut self, _payload: &serde_json::Map<String, serde_json::Value>) {}
}

/// Network activity metrics.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub active_addresses: MetricSnapshot,
    pub transaction_count: MetricSnapshot,
    pub gas_used: MetricSnapshot,
    pub new_addresses: MetricSnapshot,
}

impl CategoryMetrics for UsageMetrics {
    const CATEGORY: Category = Category::Usage;
    const METRICS: &'static [&'static str] =
        &["activeAddresses", "transactionCount", "gasUsed", "newAddresses"];

    fn from_snapshots<E, F>(mut lookup: F) -> Result<Self, E>
    where
        F: FnMut(&'static str) -> Result<MetricSnapshot, E>,
    {
        Ok(Self {
            active_addresses: lookup("activeAddresses")?,
            transaction_count: lookup("transactionCount")?,
            gas_used: lookup("gasUsed")?,
            new_addresses: lookup("newAddresses")?,
        })
    }

    fn snapshots(&self) -> Vec<(&'static str, &MetricSnapshot)> {
        vec![
            ("activeAddresses", &self.active_addresses),
            ("transactionCount", &self.transaction_count),
            ("gasUsed", &self.gas_used),
            ("newAddresses", &self.new_addresses),
        ]
    }
}

/// Total value locked metrics.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TvlMetrics {
    pub total_value_locked: MetricSnapshot,
    pub staked_value: MetricSnapshot,
    pub bridged_value: MetricSnapshot,
    pub defi_dominance: MetricSnapshot,
}

impl CategoryMetrics for TvlMetrics {
    const CATEGORY: Category = Category::Tvl;
    const METRICS: &'static [&'static str] =
        &["totalValueLocked", "stakedValue", "bridgedValue", "defiDominance"];

    fn from_snapshots<E, F>(mut lookup: F) -> Result<Self, E>
    where
        F: FnMut(&'static str) -> Result<MetricSnapshot, E>,
    {
        Ok(Self {
            total_value_locked: lookup("totalValueLocked")?,
            staked_value: lookup("stakedValue")?,
            bridged_value: lookup("bridgedValue")?,
            defi_dominance: lookup("defiDominance")?,
        })
    }

    fn snapshots(&self) -> Vec<(&'static str, &MetricSnapshot)> {
        vec![
            ("totalValueLocked", &self.total_value_locked),
            ("stakedValue", &self.staked_value),
            ("bridgedValue", &self.bridged_value),
            ("defiDominance", &self.defi_dominance),
        ]
    }
}

/// Capital flow metrics.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashflowMetrics {
    pub inflow: MetricSnapshot,
    pub outflow: MetricSnapshot,
    pub net_flow: MetricSnapshot,
    pub fees_collected: MetricSnapshot,
}

impl CategoryMetrics for CashflowMetrics {
    const CATEGORY: Category = Category::Cashflow;
    const METRICS: &'static [&'static str] = &["inflow", "outflow", "netFlow", "feesCollected"];

    fn from_snapshots<E, F>(mut lookup: F) -> Result<Self, E>
    where
        F: FnMut(&'static str) -> Result<MetricSnapshot, E>,
    {
        Ok(Self {
            inflow: lookup("inflow")?,
            outflow: lookup("outflow")?,
            net_flow: lookup("netFlow")?,
            fees_collected: lookup("feesCollected")?,
        })
    }

    fn snapshots(&self) -> Vec<(&'static str, &MetricSnapshot)> {
        vec![
            ("inflow", &self.inflow),
            ("outflow", &self.outflow),
            ("netFlow", &self.net_flow),
            ("feesCollected", &self.fees_collected),
        ]
    }
}

/// Market overview of the network's native asset.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOverview {
    pub price: MetricSnapshot,
    pub market_cap: MetricSnapshot,
    pub volume_24h: MetricSnapshot,
    pub circulating_supply: MetricSnapshot,
}

impl CategoryMetrics for MarketOverview {
    const CATEGORY: Category = Category::Market;
    const METRICS: &'static [&'static str] =
        &["price", "marketCap", "volume24h", "circulatingSupply"];

    fn from_snapshots<E, F>(mut lookup: F) -> Result<Self, E>
    where
        F: FnMut(&'static str) -> Result<MetricSnapshot, E>,
    {
        Ok(Self {
            price: lookup("price")?,
            market_cap: lookup("marketCap")?,
            volume_24h: lookup("volume24h")?,
            circulating_supply: lookup("circulatingSupply")?,
        })
    }

    fn snapshots(&self) -> Vec<(&'static str, &MetricSnapshot)> {
        vec![
            ("price", &self.price),
            ("marketCap", &self.market_cap),
            ("volume24h", &self.volume_24h),
            ("circulatingSupply", &self.circulating_supply),
        ]
    }
}

/// AI-derived signals. `predictions` is an opaque payload carried through untouched.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub sentiment_score: MetricSnapshot,
    pub risk_score: MetricSnapshot,
    pub anomaly_score: MetricSnapshot,
    pub insights: Vec<String>,
    pub predictions: serde_json::Value,
}

impl CategoryMetrics for AiAnalysis {
    const CATEGORY: Category = Category::Ai;
    const METRICS: &'static [&'static str] = &["sentimentScore", "riskScore", "anomalyScore"];

    fn from_snapshots<E, F>(mut lookup: F) -> Result<Self, E>
    where
        F: FnMut(&'static str) -> Result<MetricSnapshot, E>,
    {
        Ok(Self {
            sentiment_score: lookup("sentimentScore")?,
            risk_score: lookup("riskScore")?,
            anomaly_score: lookup("anomalyScore")?,
            insights: Vec::new(),
            predictions: serde_json::Value::Null,
        })
    }

    fn snapshots(&self) -> Vec<(&'static str, &MetricSnapshot)> {
        vec![
            ("sentimentScore", &self.sentiment_score),
            ("riskScore", &self.risk_score),
            ("anomalyScore", &self.anomaly_score),
        ]
    }

    fn absorb_extras(&mut self, payload: &serde_json::Map<String, serde_json::Value>) {
        if let Some(insights) = payload.get("insights").and_then(|v| v.as_array()) {
            self.insights = insights
                .iter()
                .filter_map(|insight| insight.as_str().map(str::to_string))
                .collect();
        }
        if let Some(predictions) = payload.get("predictions") {
            self.predictions = predictions.clone();
        }
    }
}

/// Complete metric set of one category for one (network, timeframe) pair.
///
/// Bundles are replaced wholesale on every fetch cycle, never patched.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBundle<M> {
    pub category: Category,
    pub network: NetworkId,
    pub timeframe: Timeframe,
    pub metrics: M,
    pub series: BTreeMap<String, Vec<MetricSeriesPoint>>,
    pub rolling_averages: BTreeMap<String, RollingAverageSet>,
    pub spikes: BTreeMap<String, SpikeDetection>,
    pub summaries: BTreeMap<String, SeriesSummary>,
    pub source: DataSource,
    pub fetched_at: DateTime<Utc>,
    pub diagnostic: Option<String>,
}

impl<M> CategoryBundle<M>
where
    M: CategoryMetrics,
{
    /// Derive rolling averages, summaries and spike classifications for every metric of the
    /// bundle.
    ///
    /// Metrics without a history series keep an all-`None` [`RollingAverageSet`], a default
    /// [`SeriesSummary`] and a non-spike entry, so the analytics maps always cover every metric
    /// name.
    pub fn with_analytics(mut self, threshold_percent: f64) -> Self {
        let mut rolling_averages = BTreeMap::new();
        let mut spikes = BTreeMap::new();
        let mut summaries = BTreeMap::new();

        for (name, snapshot) in self.metrics.snapshots() {
            let values = self
                .series
                .get(name)
                .map(|points| points.iter().map(|point| point.value).collect::<Vec<_>>())
                .unwrap_or_default();

            let averages = stats::rolling_averages(&values);
            let current = values.last().copied().or(snapshot.value);

            let detection = match (current, spike::baseline_for(&values, &averages)) {
                (Some(current), Some(baseline)) => {
                    spike::detect(current, baseline, threshold_percent)
                }
                _ => SpikeDetection::quiet(threshold_percent),
            };

            rolling_averages.insert(name.to_string(), averages);
            spikes.insert(name.to_string(), detection);
            summaries.insert(name.to_string(), stats::summary(&values));
        }

        self.rolling_averages = rolling_averages;
        self.spikes = spikes;
        self.summaries = summaries;
        self
    }

    pub fn is_fallback(&self) -> bool {
        self.source == DataSource::Fallback
    }
}
