//! Rolling statistics over ordered metric series.
//!
//! Windows are counted in samples, not wall-clock time: a `7d` average of a daily series is the
//! mean of its last seven points.

use crate::model::{RollingAverageSet, Trend};
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

pub const WINDOW_7D: usize = 7;
pub const WINDOW_30D: usize = 30;
pub const WINDOW_90D: usize = 90;

/// Arithmetic mean of the `window` values ending at `index`.
///
/// Returns `None` while `index < window - 1`: a partial window is never estimated.
pub fn moving_average(series: &[f64], index: usize, window: usize) -> Option<f64> {
    if window == 0 || index >= series.len() || index + 1 < window {
        return None;
    }

    let slice = &series[index + 1 - window..=index];
    Some(slice.iter().sum::<f64>() / window as f64)
}

/// Moving average aligned with every index of `series`, `None` during warm-up.
pub fn moving_average_series(series: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; series.len()];
    }

    let mut result = Vec::with_capacity(series.len());
    let mut sum = 0.0;

    for (index, value) in series.iter().enumerate() {
        sum += value;
        if index >= window {
            sum -= series[index - window];
        }
        result.push((index + 1 >= window).then(|| sum / window as f64));
    }

    result
}

/// 7/30/90 sample averages at the latest index of `series`.
pub fn rolling_averages(series: &[f64]) -> RollingAverageSet {
    let Some(last) = series.len().checked_sub(1) else {
        return RollingAverageSet::default();
    };

    RollingAverageSet {
        d7: moving_average(series, last, WINDOW_7D),
        d30: moving_average(series, last, WINDOW_30D),
        d90: moving_average(series, last, WINDOW_90D),
    }
}

/// Summary statistics of a series.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSummary {
    pub total: f64,
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub change_percent: f64,
    pub trend: Trend,
}

/// Compute [`SeriesSummary`] of `series`.
///
/// `change_percent` compares the last value against the first; a zero first value yields `0.0`
/// rather than an infinite change.
pub fn summary(series: &[f64]) -> SeriesSummary {
    let (min, max) = match series.iter().copied().minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::NoElements => return SeriesSummary::default(),
        MinMaxResult::OneElement(value) => (value, value),
        MinMaxResult::MinMax(min, max) => (min, max),
    };

    let total: f64 = series.iter().sum();
    let average = total / series.len() as f64;

    let first = series[0];
    let last = series[series.len() - 1];
    let change_percent = if first != 0.0 {
        (last - first) / first * 100.0
    } else {
        0.0
    };

    SeriesSummary {
        total,
        average,
        max,
        min,
        change_percent,
        trend: Trend::from_change_percent(change_percent),
    }
}

/// Arithmetic mean of the whole series.
pub fn mean(series: &[f64]) -> Option<f64> {
    if series.is_empty() {
        None
    } else {
        Some(series.iter().sum::<f64>() / series.len() as f64)
    }
}
