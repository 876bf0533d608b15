//! The single validation boundary between untrusted provider payloads and the domain model.
//!
//! A category payload is a JSON object holding one snapshot object per metric name, an
//! optional `series` object of per-metric history points, and category specific extras:
//!
//! ```json
//! {
//!   "activeAddresses": { "value": 512000, "change": 1200, "changePercent": 0.23 },
//!   "transactionCount": { "value": 1100000, "trend": "up" },
//!   "gasUsed": { "value": 107000000000 },
//!   "newAddresses": { "value": 64000 },
//!   "series": { "activeAddresses": [{ "timestamp": "2026-10-01T00:00:00Z", "value": 498000 }] }
//! }
//! ```
//!
//! Everything past this module can rely on every required field being present.

use crate::{
    error::DataError,
    model::{
        CategoryBundle, CategoryMetrics, DataSource, MetricSeriesPoint, MetricSnapshot,
        NetworkId, Timeframe, Trend, normalize_series,
    },
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    value: Option<f64>,
    change: Option<f64>,
    change_percent: Option<f64>,
    trend: Option<Trend>,
    timestamp: Option<DateTime<Utc>>,
}

/// Validate a raw category payload into a live [`CategoryBundle`].
///
/// Analytics maps are left empty; see [`CategoryBundle::with_analytics`].
pub fn category_bundle<M>(
    network: &NetworkId,
    timeframe: Timeframe,
    raw: &Value,
    received_at: DateTime<Utc>,
) -> Result<CategoryBundle<M>, DataError>
where
    M: CategoryMetrics,
{
    let payload = raw.as_object().ok_or_else(|| {
        DataError::Validation(format!("{} payload is not a JSON object", M::CATEGORY))
    })?;

    let mut metrics = M::from_snapshots(|name| snapshot(payload, name, received_at))?;
    metrics.absorb_extras(payload);

    Ok(CategoryBundle {
        category: M::CATEGORY,
        network: network.clone(),
        timeframe,
        metrics,
        series: series(payload, M::METRICS)?,
        rolling_averages: BTreeMap::new(),
        spikes: BTreeMap::new(),
        summaries: BTreeMap::new(),
        source: DataSource::Live,
        fetched_at: received_at,
        diagnostic: None,
    })
}

fn snapshot(
    payload: &Map<String, Value>,
    name: &'static str,
    received_at: DateTime<Utc>,
) -> Result<MetricSnapshot, DataError> {
    let field = payload
        .get(name)
        .ok_or_else(|| DataError::Validation(format!("missing required field `{name}`")))?;

    let raw = RawSnapshot::deserialize(field)
        .map_err(|error| DataError::Validation(format!("field `{name}`: {error}")))?;

    let value = raw
        .value
        .filter(|value| value.is_finite())
        .ok_or_else(|| DataError::Validation(format!("field `{name}` has no numeric value")))?;

    let trend = raw.trend.unwrap_or_else(|| {
        raw.change_percent
            .map(Trend::from_change_percent)
            .unwrap_or_default()
    });

    Ok(MetricSnapshot {
        value: Some(value),
        change: raw.change,
        change_percent: raw.change_percent,
        trend,
        timestamp: raw.timestamp.unwrap_or(received_at),
    })
}

fn series(
    payload: &Map<String, Value>,
    metrics: &[&'static str],
) -> Result<BTreeMap<String, Vec<MetricSeriesPoint>>, DataError> {
    let Some(raw) = payload.get("series") else {
        return Ok(BTreeMap::new());
    };

    let raw = raw
        .as_object()
        .ok_or_else(|| DataError::Validation("`series` is not a JSON object".to_string()))?;

    raw.iter()
        .filter(|(name, _)| metrics.contains(&name.as_str()))
        .map(|(name, points)| {
            Vec::<MetricSeriesPoint>::deserialize(points)
                .map(|points| (name.clone(), normalize_series(points)))
                .map_err(|error| DataError::Validation(format!("series `{name}`: {error}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AiAnalysis, UsageMetrics};
    use serde_json::json;

    fn received_at() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_790_000_000, 0).unwrap()
    }

    fn usage_payload() -> Value {
        json!({
            "activeAddresses": { "value": 512000.0, "change": 1200.0, "changePercent": 0.23 },
            "transactionCount": { "value": 1100000.0, "trend": "up" },
            "gasUsed": { "value": 1.07e11, "changePercent": -3.5 },
            "newAddresses": { "value": 64000.0, "timestamp": "2026-10-01T00:00:00Z" },
            "series": {
                "activeAddresses": [
                    { "timestamp": "2026-10-02T00:00:00Z", "value": 2.0 },
                    { "timestamp": "2026-10-01T00:00:00Z", "value": 1.0 }
                ],
                "unknownMetric": [{ "timestamp": "2026-10-01T00:00:00Z", "value": 1.0 }]
            }
        })
    }

    #[test]
    fn test_valid_usage_payload() {
        let bundle = category_bundle::<UsageMetrics>(
            &NetworkId::new("ethereum"),
            Timeframe::Month,
            &usage_payload(),
            received_at(),
        )
        .unwrap();

        assert_eq!(bundle.source, DataSource::Live);
        assert_eq!(bundle.metrics.active_addresses.value, Some(512000.0));
        assert_eq!(bundle.metrics.active_addresses.trend, Trend::Stable);
        assert_eq!(bundle.metrics.transaction_count.trend, Trend::Up);
        assert_eq!(bundle.metrics.gas_used.trend, Trend::Down);
        assert_eq!(bundle.metrics.gas_used.timestamp, received_at());
        assert_ne!(bundle.metrics.new_addresses.timestamp, received_at());

        // Unknown series are dropped and known series sorted ascending
        assert_eq!(bundle.series.len(), 1);
        let values: Vec<_> = bundle.series["activeAddresses"]
            .iter()
            .map(|point| point.value)
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_invalid_payloads_are_rejected() {
        struct TestCase {
            input: Value,
            expected: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: payload not an object
                input: json!([1, 2, 3]),
                expected: "usage payload is not a JSON object",
            },
            TestCase {
                // TC1: required field missing
                input: json!({ "activeAddresses": { "value": 1.0 } }),
                expected: "missing required field `transactionCount`",
            },
            TestCase {
                // TC2: required field without a value
                input: json!({
                    "activeAddresses": { "change": 1.0 },
                    "transactionCount": { "value": 1.0 },
                    "gasUsed": { "value": 1.0 },
                    "newAddresses": { "value": 1.0 }
                }),
                expected: "field `activeAddresses` has no numeric value",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = category_bundle::<UsageMetrics>(
                &NetworkId::new("ethereum"),
                Timeframe::Month,
                &test.input,
                received_at(),
            );
            assert_eq!(
                actual,
                Err(DataError::Validation(test.expected.to_string())),
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_malformed_series_is_rejected() {
        let mut payload = usage_payload();
        payload["series"]["gasUsed"] = json!("not a series");

        let actual = category_bundle::<UsageMetrics>(
            &NetworkId::new("ethereum"),
            Timeframe::Month,
            &payload,
            received_at(),
        );

        assert!(matches!(actual, Err(DataError::Validation(_))));
    }

    #[test]
    fn test_ai_extras_are_carried_opaquely() {
        let payload = json!({
            "sentimentScore": { "value": 0.62 },
            "riskScore": { "value": 0.31 },
            "anomalyScore": { "value": 0.05 },
            "insights": ["Fee revenue rising", 7],
            "predictions": { "ensemble": { "price7d": 3150.0 } }
        });

        let bundle = category_bundle::<AiAnalysis>(
            &NetworkId::new("ethereum"),
            Timeframe::Week,
            &payload,
            received_at(),
        )
        .unwrap();

        assert_eq!(bundle.metrics.insights, vec!["Fee revenue rising".to_string()]);
        assert_eq!(bundle.metrics.predictions["ensemble"]["price7d"], json!(3150.0));
    }
}
