//! Cross-entity comparison within a single metric window.
//!
//! Both detectors here answer the same question: given one value per entity
//! for one window, which entities sit apart from their peers? They only run
//! when a group has at least four entities; below that the notion of a
//! dominant majority is meaningless.

use serde::{Deserialize, Serialize};

use crate::error::DetectError;

/// Median of a slice; even lengths average the middle pair.
pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

// ============================================================
//  MEDIAN DEVIATION
// ============================================================

/// Flags entries whose distance from the row median exceeds a fraction of
/// the median itself. `median_floor` keeps the allowance finite when the
/// median sits at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierDataDetector {
    #[serde(default = "default_ratio_threshold")]
    pub ratio_threshold: f64,
    #[serde(default = "default_median_floor")]
    pub median_floor: f64,
}

impl Default for OutlierDataDetector {
    fn default() -> Self {
        OutlierDataDetector {
            ratio_threshold: default_ratio_threshold(),
            median_floor: default_median_floor(),
        }
    }
}

impl OutlierDataDetector {
    pub fn validate(&self, metric: &str) -> Result<(), DetectError> {
        if self.ratio_threshold <= 0.0 {
            return Err(DetectError::invalid_config(
                format!("{}.space_detector.ratio_threshold", metric),
                "deviation ratio must be positive",
            ));
        }
        if self.median_floor <= 0.0 {
            return Err(DetectError::invalid_config(
                format!("{}.space_detector.median_floor", metric),
                "median floor must be positive",
            ));
        }
        Ok(())
    }

    pub fn labels_row(&self, row: &[f64]) -> Vec<bool> {
        let m = median(row);
        let allowance = self.ratio_threshold * m.abs().max(self.median_floor);
        row.iter().map(|v| (v - m).abs() > allowance).collect()
    }
}

// ============================================================
//  ONE-DIMENSIONAL DBSCAN
// ============================================================

/// Density clustering over the sorted row: values whose gap to the next
/// member stays within eps chain into one cluster. Entities outside the
/// dominant cluster are flagged.
///
/// With `scaled` set, eps is a fraction of the row median, so the detector
/// tracks the metric's magnitude instead of needing absolute tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowDbscan {
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_scaled")]
    pub scaled: bool,
}

impl Default for SlidingWindowDbscan {
    fn default() -> Self {
        SlidingWindowDbscan {
            eps: default_eps(),
            min_samples: default_min_samples(),
            scaled: default_scaled(),
        }
    }
}

impl SlidingWindowDbscan {
    pub fn validate(&self, metric: &str) -> Result<(), DetectError> {
        if self.eps <= 0.0 {
            return Err(DetectError::invalid_config(
                format!("{}.space_detector.eps", metric),
                "eps must be positive",
            ));
        }
        if self.min_samples == 0 {
            return Err(DetectError::invalid_config(
                format!("{}.space_detector.min_samples", metric),
                "min_samples must be at least one",
            ));
        }
        Ok(())
    }

    pub fn labels_row(&self, row: &[f64]) -> Vec<bool> {
        if row.is_empty() {
            return Vec::new();
        }
        let eps = if self.scaled {
            self.eps * median(row).abs().max(1e-3)
        } else {
            self.eps
        };

        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));

        let mut clusters: Vec<Vec<usize>> = vec![vec![order[0]]];
        for pair in order.windows(2) {
            if row[pair[1]] - row[pair[0]] <= eps {
                if let Some(cluster) = clusters.last_mut() {
                    cluster.push(pair[1]);
                }
            } else {
                clusters.push(vec![pair[1]]);
            }
        }

        // Dominant cluster: the first largest one meeting min_samples.
        let mut dominant: Option<usize> = None;
        for (i, cluster) in clusters.iter().enumerate() {
            if cluster.len() < self.min_samples {
                continue;
            }
            match dominant {
                Some(best) if clusters[best].len() >= cluster.len() => {}
                _ => dominant = Some(i),
            }
        }

        let mut labels = vec![true; row.len()];
        if let Some(best) = dominant {
            for &idx in &clusters[best] {
                labels[idx] = false;
            }
        }
        labels
    }
}

fn default_ratio_threshold() -> f64 {
    0.6
}

fn default_median_floor() -> f64 {
    1e-3
}

fn default_eps() -> f64 {
    0.3
}

fn default_min_samples() -> usize {
    2
}

fn default_scaled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert!((median(&[3.0, 1.0, 2.0]) - 2.0).abs() < 1e-9);
        assert!((median(&[4.0, 1.0, 3.0, 2.0]) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn outlier_detector_flags_the_stray_entity() {
        let detector = OutlierDataDetector::default();
        let labels = detector.labels_row(&[1.0, 1.0, 1.0, 100.0]);
        assert_eq!(labels, vec![false, false, false, true]);
    }

    #[test]
    fn outlier_detector_tolerates_jitter() {
        let detector = OutlierDataDetector::default();
        let labels = detector.labels_row(&[1.0, 1.05, 0.95, 1.02]);
        assert!(labels.iter().all(|&l| !l), "few-percent spread is healthy");
    }

    #[test]
    fn outlier_detector_catches_three_fold_inflation() {
        let detector = OutlierDataDetector::default();
        let labels = detector.labels_row(&[1.0, 1.1, 0.9, 3.0]);
        assert_eq!(labels, vec![false, false, false, true]);
    }

    #[test]
    fn dbscan_flags_values_outside_dominant_cluster() {
        let detector = SlidingWindowDbscan::default();
        let labels = detector.labels_row(&[1.0, 1.0, 1.0, 100.0]);
        assert_eq!(labels, vec![false, false, false, true]);
    }

    #[test]
    fn dbscan_scaled_eps_follows_magnitude() {
        let detector = SlidingWindowDbscan::default();
        // Median 5.05: eps = 1.515, so the tight cluster holds together
        // while 15 stays isolated.
        let labels = detector.labels_row(&[5.0, 5.1, 4.9, 15.0]);
        assert_eq!(labels, vec![false, false, false, true]);
    }

    #[test]
    fn dbscan_identical_values_form_one_healthy_cluster() {
        let detector = SlidingWindowDbscan::default();
        let labels = detector.labels_row(&[2.0, 2.0, 2.0, 2.0]);
        assert!(labels.iter().all(|&l| !l));
    }

    #[test]
    fn dbscan_without_any_dense_cluster_flags_everything() {
        let detector = SlidingWindowDbscan {
            eps: 0.1,
            min_samples: 2,
            scaled: false,
        };
        let labels = detector.labels_row(&[1.0, 5.0, 20.0, 80.0]);
        assert!(labels.iter().all(|&l| l));
    }

    #[test]
    fn zero_eps_fails_validation() {
        let bad = SlidingWindowDbscan {
            eps: 0.0,
            ..SlidingWindowDbscan::default()
        };
        assert!(bad.validate("HcclAllGather").is_err());
    }
}
