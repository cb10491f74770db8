//! Anomaly detectors and the result model they share.
//!
//! Detection runs along two independent views of the same windowed series:
//!
//! - temporal: each entity's series compared against its own recent past,
//! - spatial: all entities of a group compared against each other per window.
//!
//! Entities are usually ranks; the group-slow pre-pass compares whole
//! groups instead, so the result model is generic over both.

pub mod ksigma;
pub mod spatial;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::MetricSeries;
use crate::error::DetectError;

pub use ksigma::SlidingWindowKSigma;
pub use spatial::{OutlierDataDetector, SlidingWindowDbscan};

// ============================================================
//  ENTITIES AND LOCATIONS
// ============================================================

/// What a detected series belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Entity {
    Rank(u32),
    Group(Vec<u32>),
}

impl Entity {
    pub fn as_rank(&self) -> Option<u32> {
        match self {
            Entity::Rank(rank) => Some(*rank),
            Entity::Group(_) => None,
        }
    }

    pub fn group_ranks(&self) -> Option<&[u32]> {
        match self {
            Entity::Rank(_) => None,
            Entity::Group(ranks) => Some(ranks),
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Rank(rank) => write!(f, "{}", rank),
            Entity::Group(ranks) => {
                write!(f, "[")?;
                for (i, rank) in ranks.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", rank)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Per-window verdicts for one entity and metric; both vectors share a length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyLocation {
    pub timestamps: Vec<f64>,
    pub labels: Vec<bool>,
}

impl AnomalyLocation {
    pub fn flagged(&self) -> usize {
        self.labels.iter().filter(|&&l| l).count()
    }

    pub fn any(&self) -> bool {
        self.labels.iter().any(|&l| l)
    }
}

/// Which view produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MethodKind {
    Time,
    Space,
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodKind::Time => write!(f, "TIME"),
            MethodKind::Space => write!(f, "SPACE"),
        }
    }
}

/// Outcome of one detection round over one group and derived metric.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub metric_name: String,
    pub anomaly_devices: Vec<Entity>,
    pub anomaly_locations: BTreeMap<Entity, BTreeMap<String, AnomalyLocation>>,
    pub method_types: BTreeMap<Entity, BTreeMap<String, MethodKind>>,
    pub group_data: BTreeMap<Entity, MetricSeries>,
}

impl DetectionResult {
    pub fn empty(metric: &str) -> Self {
        DetectionResult {
            metric_name: metric.to_string(),
            ..DetectionResult::default()
        }
    }

    pub fn is_anomalous(&self) -> bool {
        !self.anomaly_devices.is_empty()
    }
}

// ============================================================
//  DETECTOR DISPATCH
// ============================================================

/// Temporal detector selection, tagged like the original registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimeDetectorConfig {
    #[serde(rename = "SlidingWindowKSigmaDetector")]
    SlidingWindowKSigma(SlidingWindowKSigma),
}

impl TimeDetectorConfig {
    pub fn validate(&self, metric: &str) -> Result<(), DetectError> {
        match self {
            TimeDetectorConfig::SlidingWindowKSigma(cfg) => cfg.validate(metric),
        }
    }

    /// Debounced per-window labels for one entity's series.
    pub fn labels(&self, series: &MetricSeries) -> Vec<bool> {
        match self {
            TimeDetectorConfig::SlidingWindowKSigma(cfg) => cfg.labels(&series.values),
        }
    }
}

/// Spatial detector selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpaceDetectorConfig {
    #[serde(rename = "OuterDataDetector")]
    OutlierData(OutlierDataDetector),
    #[serde(rename = "SlidingWindowDBSCAN")]
    SlidingWindowDbscan(SlidingWindowDbscan),
}

impl SpaceDetectorConfig {
    pub fn validate(&self, metric: &str) -> Result<(), DetectError> {
        match self {
            SpaceDetectorConfig::OutlierData(cfg) => cfg.validate(metric),
            SpaceDetectorConfig::SlidingWindowDbscan(cfg) => cfg.validate(metric),
        }
    }

    /// Labels every `rows[window][entity]` cell, preserving the shape.
    pub fn labels(&self, rows: &[Vec<f64>]) -> Vec<Vec<bool>> {
        rows.iter()
            .map(|row| match self {
                SpaceDetectorConfig::OutlierData(cfg) => cfg.labels_row(row),
                SpaceDetectorConfig::SlidingWindowDbscan(cfg) => cfg.labels_row(row),
            })
            .collect()
    }
}

// ============================================================
//  DEBOUNCE
// ============================================================

/// Keeps only alarm runs at least `window` labels long.
///
/// Every full-length run of set labels is copied to the output; isolated
/// flags and short bursts disappear.
pub fn alarm_filter(labels: &[bool], window: usize) -> Vec<bool> {
    let mut out = vec![false; labels.len()];
    if window == 0 || labels.len() < window {
        return out;
    }
    for i in window..=labels.len() {
        let run = &labels[i - window..i];
        if run.iter().all(|&l| l) {
            for slot in &mut out[i - window..i] {
                *slot = true;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_display_matches_report_keys() {
        assert_eq!(Entity::Rank(7).to_string(), "7");
        assert_eq!(Entity::Group(vec![0, 1, 2]).to_string(), "[0, 1, 2]");
    }

    #[test]
    fn alarm_filter_drops_short_bursts() {
        let labels = [false, true, true, false, true, false];
        let out = alarm_filter(&labels, 3);
        assert!(out.iter().all(|&l| !l), "bursts shorter than the window must vanish");
    }

    #[test]
    fn alarm_filter_keeps_full_runs() {
        let labels = [false, true, true, true, true, false];
        let out = alarm_filter(&labels, 4);
        assert_eq!(out, vec![false, true, true, true, true, false]);
    }

    #[test]
    fn alarm_filter_keeps_overlong_runs_whole() {
        let labels = [true, true, true, true, true, true];
        let out = alarm_filter(&labels, 5);
        assert!(out.iter().all(|&l| l), "every label of a long run survives");
    }

    #[test]
    fn alarm_filter_window_one_is_identity() {
        let labels = [true, false, true];
        assert_eq!(alarm_filter(&labels, 1), labels.to_vec());
    }

    #[test]
    fn alarm_filter_short_input_is_all_clear() {
        let labels = [true, true];
        assert!(alarm_filter(&labels, 5).iter().all(|&l| !l));
    }

    #[test]
    fn detector_configs_deserialize_by_registry_name() {
        let time: TimeDetectorConfig = serde_json::from_str(
            r#"{"type": "SlidingWindowKSigmaDetector", "window_size": 8}"#,
        )
        .unwrap();
        let TimeDetectorConfig::SlidingWindowKSigma(cfg) = &time;
        assert_eq!(cfg.window_size, 8);
        assert!((cfg.k_sigma - 2.0).abs() < 1e-9, "unset fields keep defaults");

        let space: SpaceDetectorConfig =
            serde_json::from_str(r#"{"type": "SlidingWindowDBSCAN"}"#).unwrap();
        assert!(matches!(space, SpaceDetectorConfig::SlidingWindowDbscan(_)));

        let outer: SpaceDetectorConfig =
            serde_json::from_str(r#"{"type": "OuterDataDetector"}"#).unwrap();
        assert!(matches!(outer, SpaceDetectorConfig::OutlierData(_)));
    }
}
