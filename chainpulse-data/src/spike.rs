use crate::{
    model::{RollingAverageSet, Severity, SpikeDetection},
    stats,
};

/// Classify `current_value` against `baseline`.
///
/// `deviation` is the percentage distance from the baseline. A spike is any deviation strictly
/// beyond `threshold_percent`; severity is banded at 2x and 4x the threshold and confidence
/// grows linearly from 0.0 at the threshold to 1.0 at the `high` band.
pub fn detect(current_value: f64, baseline: f64, threshold_percent: f64) -> SpikeDetection {
    // A zero baseline has no meaningful percentage deviation.
    if baseline == 0.0 || !baseline.is_finite() || !current_value.is_finite() {
        return SpikeDetection {
            current_value,
            baseline,
            ..SpikeDetection::quiet(threshold_percent)
        };
    }

    let deviation = (current_value - baseline) / baseline * 100.0;
    let magnitude = deviation.abs();
    let is_spike = magnitude > threshold_percent;

    let severity = if magnitude < 2.0 * threshold_percent {
        Severity::Low
    } else if magnitude < 4.0 * threshold_percent {
        Severity::Medium
    } else {
        Severity::High
    };

    let confidence = if is_spike && threshold_percent > 0.0 {
        ((magnitude - threshold_percent) / (3.0 * threshold_percent)).min(1.0)
    } else if is_spike {
        1.0
    } else {
        0.0
    };

    SpikeDetection {
        is_spike,
        severity,
        confidence,
        threshold: threshold_percent,
        current_value,
        baseline,
        deviation,
    }
}

/// Baseline for spike detection: the shortest populated rolling window, otherwise the series mean.
pub fn baseline_for(series: &[f64], rolling: &RollingAverageSet) -> Option<f64> {
    rolling.shortest().or_else(|| stats::mean(series))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_classification_boundaries() {
        struct TestCase {
            current: f64,
            expected_spike: bool,
            expected_severity: Severity,
        }

        let tests = vec![
            TestCase {
                // TC0: 4% deviation is inside a 5% threshold
                current: 104.0,
                expected_spike: false,
                expected_severity: Severity::Low,
            },
            TestCase {
                // TC1: 6% deviation is a low spike
                current: 106.0,
                expected_spike: true,
                expected_severity: Severity::Low,
            },
            TestCase {
                // TC2: 15% deviation is a medium spike
                current: 115.0,
                expected_spike: true,
                expected_severity: Severity::Medium,
            },
            TestCase {
                // TC3: 21% deviation is a high spike
                current: 121.0,
                expected_spike: true,
                expected_severity: Severity::High,
            },
            TestCase {
                // TC4: negative deviations are classified on magnitude
                current: 88.0,
                expected_spike: true,
                expected_severity: Severity::Medium,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = detect(test.current, 100.0, 5.0);
            assert_eq!(actual.is_spike, test.expected_spike, "TC{} failed", index);
            assert_eq!(actual.severity, test.expected_severity, "TC{} failed", index);
        }
    }

    #[test]
    fn test_detect_confidence_is_linear_and_capped() {
        assert_eq!(detect(104.0, 100.0, 5.0).confidence, 0.0);

        let medium = detect(112.5, 100.0, 5.0);
        assert!((medium.confidence - 0.5).abs() < 1e-9);

        assert_eq!(detect(500.0, 100.0, 5.0).confidence, 1.0);
        assert!((detect(121.0, 100.0, 5.0).deviation - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_detect_zero_baseline_is_quiet() {
        let actual = detect(10.0, 0.0, 5.0);
        assert!(!actual.is_spike);
        assert_eq!(actual.deviation, 0.0);
        assert_eq!(actual.current_value, 10.0);
    }

    #[test]
    fn test_baseline_prefers_rolling_average() {
        let series = vec![1.0, 2.0, 3.0];
        let rolling = RollingAverageSet {
            d7: None,
            d30: Some(50.0),
            d90: Some(70.0),
        };

        assert_eq!(baseline_for(&series, &rolling), Some(50.0));
        assert_eq!(baseline_for(&series, &RollingAverageSet::default()), Some(2.0));
        assert_eq!(baseline_for(&[], &RollingAverageSet::default()), None);
    }
}
