//! Sliding-window k-sigma detection over a single series.

use serde::{Deserialize, Serialize};

use crate::detect::alarm_filter;
use crate::error::DetectError;

/// Flags windows whose value grows beyond `k_sigma` deviations above the
/// trailing moving average, provided the relative growth also clears
/// `anomaly_degree_threshold`. The second condition keeps near-constant
/// series from alarming on float dust when the trailing deviation is tiny.
///
/// Raw flags are debounced with [`alarm_filter`], so only sustained runs of
/// at least `alarm_filter_window_size` windows survive. A one-off spike is
/// noise; a progressive slowdown keeps flagging as the trailing average
/// chases it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowKSigma {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_k_sigma")]
    pub k_sigma: f64,
    #[serde(default = "default_degree_threshold")]
    pub anomaly_degree_threshold: f64,
    #[serde(default = "default_alarm_window")]
    pub alarm_filter_window_size: usize,
}

impl Default for SlidingWindowKSigma {
    fn default() -> Self {
        SlidingWindowKSigma {
            window_size: default_window_size(),
            k_sigma: default_k_sigma(),
            anomaly_degree_threshold: default_degree_threshold(),
            alarm_filter_window_size: default_alarm_window(),
        }
    }
}

impl SlidingWindowKSigma {
    pub fn validate(&self, metric: &str) -> Result<(), DetectError> {
        if self.window_size < 2 {
            return Err(DetectError::invalid_config(
                format!("{}.time_detector.window_size", metric),
                "trailing window needs at least two samples",
            ));
        }
        if self.k_sigma <= 0.0 {
            return Err(DetectError::invalid_config(
                format!("{}.time_detector.k_sigma", metric),
                "sigma multiplier must be positive",
            ));
        }
        if self.anomaly_degree_threshold <= 0.0 {
            return Err(DetectError::invalid_config(
                format!("{}.time_detector.anomaly_degree_threshold", metric),
                "relative growth threshold must be positive",
            ));
        }
        if self.alarm_filter_window_size == 0 {
            return Err(DetectError::invalid_config(
                format!("{}.time_detector.alarm_filter_window_size", metric),
                "debounce window must be at least one",
            ));
        }
        Ok(())
    }

    /// Debounced per-window labels; output length equals input length.
    pub fn labels(&self, values: &[f64]) -> Vec<bool> {
        let mut raw = vec![false; values.len()];
        for i in self.window_size..values.len() {
            let window = &values[i - self.window_size..i];
            let avg = mean(window);
            let std = population_std(window, avg);
            let diff = values[i] - avg;
            if diff <= self.k_sigma * std {
                continue;
            }
            let degree = if avg > 0.0 { diff / avg } else { f64::INFINITY };
            if degree > self.anomaly_degree_threshold {
                raw[i] = true;
            }
        }
        alarm_filter(&raw, self.alarm_filter_window_size)
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

fn default_window_size() -> usize {
    5
}

fn default_k_sigma() -> f64 {
    2.0
}

fn default_degree_threshold() -> f64 {
    0.2
}

fn default_alarm_window() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_never_alarms() {
        let detector = SlidingWindowKSigma::default();
        let values = vec![3.25; 40];
        assert!(detector.labels(&values).iter().all(|&l| !l));
    }

    #[test]
    fn progressive_slowdown_is_flagged_as_a_run() {
        let detector = SlidingWindowKSigma::default();
        let mut values = vec![1.0; 6];
        values.extend([2.0, 3.0, 4.0, 5.0, 6.0]);
        let labels = detector.labels(&values);
        assert!(
            labels[6..11].iter().all(|&l| l),
            "every ramp window should alarm: {:?}",
            labels
        );
        assert!(labels[..6].iter().all(|&l| !l));
    }

    #[test]
    fn single_window_spike_is_debounced() {
        let detector = SlidingWindowKSigma::default();
        let mut values = vec![1.0; 8];
        values.extend([3.0; 5]);
        // Only the first elevated window clears k-sigma; once the spike
        // enters the trailing window the deviation explodes. One flag is
        // below the debounce run length, so nothing survives.
        let labels = detector.labels(&values);
        assert!(labels.iter().all(|&l| !l), "{:?}", labels);
    }

    #[test]
    fn spike_survives_without_debounce() {
        let detector = SlidingWindowKSigma {
            alarm_filter_window_size: 1,
            ..SlidingWindowKSigma::default()
        };
        let mut values = vec![1.0; 8];
        values.extend([3.0; 5]);
        let labels = detector.labels(&values);
        assert!(labels[8], "step onset should alarm with debounce off");
    }

    #[test]
    fn growth_below_degree_threshold_is_ignored() {
        // Deviation-free history makes any uptick clear k-sigma; the
        // relative growth gate still rejects a 5% drift.
        let detector = SlidingWindowKSigma {
            alarm_filter_window_size: 1,
            ..SlidingWindowKSigma::default()
        };
        let mut values = vec![100.0; 8];
        values.push(105.0);
        let labels = detector.labels(&values);
        assert!(!labels[8], "5% growth sits below the 20% degree threshold");
    }

    #[test]
    fn short_series_yields_no_alarms() {
        let detector = SlidingWindowKSigma::default();
        assert!(detector.labels(&[1.0, 2.0, 3.0]).iter().all(|&l| !l));
    }

    #[test]
    fn bad_parameters_fail_validation() {
        let bad = SlidingWindowKSigma {
            k_sigma: 0.0,
            ..SlidingWindowKSigma::default()
        };
        assert!(bad.validate("HcclAllGather").is_err());

        let bad = SlidingWindowKSigma {
            anomaly_degree_threshold: -0.5,
            ..SlidingWindowKSigma::default()
        };
        assert!(bad.validate("HcclAllGather").is_err());
    }
}
