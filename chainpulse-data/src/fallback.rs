use crate::{
    model::{
        CategoryBundle, CategoryMetrics, DataSource, MetricSnapshot, NetworkId,
        RollingAverageSet, SpikeDetection, Timeframe,
    },
    stats::SeriesSummary,
};
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, convert::Infallible};

/// Threshold recorded on placeholder spike entries.
pub const FALLBACK_SPIKE_THRESHOLD: f64 = 0.0;

/// Build the default bundle of category `M` for `(network, timeframe)`.
///
/// Pure: the same inputs always produce an equal bundle.
pub fn synthesize<M>(network: &NetworkId, timeframe: Timeframe) -> CategoryBundle<M>
where
    M: CategoryMetrics,
{
    let Ok(metrics) = M::from_snapshots::<Infallible, _>(|_| Ok(MetricSnapshot::placeholder()));

    let rolling_averages = M::METRICS
        .iter()
        .map(|name| (name.to_string(), RollingAverageSet::default()))
        .collect();

    let spikes = M::METRICS
        .iter()
        .map(|name| {
            (
                name.to_string(),
                SpikeDetection::quiet(FALLBACK_SPIKE_THRESHOLD),
            )
        })
        .collect();

    let summaries = M::METRICS
        .iter()
        .map(|name| (name.to_string(), SeriesSummary::default()))
        .collect();

    CategoryBundle {
        category: M::CATEGORY,
        network: network.clone(),
        timeframe,
        metrics,
        series: BTreeMap::new(),
        rolling_averages,
        spikes,
        summaries,
        source: DataSource::Fallback,
        fetched_at: DateTime::<Utc>::UNIX_EPOCH,
        diagnostic: None,
    }
}

/// [`synthesize`] with the absorbed failure recorded in the diagnostic field.
pub fn synthesize_with_diagnostic<M>(
    network: &NetworkId,
    timeframe: Timeframe,
    diagnostic: impl Into<String>,
) -> CategoryBundle<M>
where
    M: CategoryMetrics,
{
    CategoryBundle {
        diagnostic: Some(diagnostic.into()),
        ..synthesize(network, timeframe)
    }
}
