//! Windowed aggregation of operator durations into metric series.
//!
//! For one `(group, operator)` pair on one rank, occurrences are reduced to
//! `(start_ms, duration_ms)` rows, the warmup fifth is discarded, and the
//! remainder is bucketed into fixed-width windows anchored at the earliest
//! surviving start. Each configured reducer turns a window into one point,
//! producing one derived series per reducer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AggregationSpec, ReducerSpec};
use crate::error::DetectError;
use crate::trace::OpRecord;

/// A derived metric series, timestamps in epoch milliseconds.
///
/// Timestamps are strictly increasing; both vectors always share a length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub timestamps: Vec<f64>,
    pub values: Vec<f64>,
}

impl MetricSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================
//  REDUCERS
// ============================================================

/// How one window of durations collapses into a single point.
#[derive(Debug, Clone, PartialEq)]
pub enum Reducer {
    Mean,
    Percentile { q: f64 },
    Max,
    Min,
}

impl Reducer {
    /// Resolves a configured reducer, rejecting unknown functions and
    /// out-of-range parameters.
    pub fn resolve(spec: &ReducerSpec) -> Result<Reducer, DetectError> {
        match spec.func.as_str() {
            "mean" => Ok(Reducer::Mean),
            "max" => Ok(Reducer::Max),
            "min" => Ok(Reducer::Min),
            "percentile" => {
                let q = spec.func_params.get("q").copied().ok_or_else(|| {
                    DetectError::invalid_config("aggregation.funcs", "percentile requires param q")
                })?;
                if !(0.0..=100.0).contains(&q) {
                    return Err(DetectError::invalid_config(
                        "aggregation.funcs",
                        format!("percentile q out of range: {}", q),
                    ));
                }
                Ok(Reducer::Percentile { q })
            }
            other => Err(DetectError::invalid_config(
                "aggregation.funcs",
                format!("unknown aggregation func: {}", other),
            )),
        }
    }

    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Max => values.iter().copied().fold(f64::MIN, f64::max),
            Reducer::Min => values.iter().copied().fold(f64::MAX, f64::min),
            Reducer::Percentile { q } => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                percentile_sorted(&sorted, *q)
            }
        }
    }
}

/// Linear-interpolated percentile over an ascending slice.
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q / 100.0 * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

// ============================================================
//  AGGREGATOR
// ============================================================

/// Applies one metric's aggregation spec to per-rank operator records.
#[derive(Debug, Clone)]
pub struct Aggregator {
    window_ms: f64,
    reducers: Vec<(String, Reducer)>,
}

impl Aggregator {
    /// With a single reducer the derived series keeps the metric name; with
    /// several, each gets a `metric!func_param-value` suffix so rounds stay
    /// distinguishable.
    pub fn from_spec(metric: &str, spec: &AggregationSpec) -> Result<Self, DetectError> {
        if spec.funcs.is_empty() {
            return Err(DetectError::invalid_config(
                "aggregation.funcs",
                "at least one reducer required",
            ));
        }
        let mut reducers = Vec::with_capacity(spec.funcs.len());
        for func in &spec.funcs {
            let reducer = Reducer::resolve(func)?;
            let name = if spec.funcs.len() == 1 {
                metric.to_string()
            } else {
                let mut label = format!("{}!{}", metric, func.func);
                for (key, value) in &func.func_params {
                    label.push_str(&format!("_{}-{}", key, value));
                }
                label
            };
            if !reducers.iter().any(|(n, _)| n == &name) {
                reducers.push((name, reducer));
            }
        }
        Ok(Aggregator {
            window_ms: spec.during_s as f64 * 1000.0,
            reducers,
        })
    }

    pub fn derived_names(&self) -> Vec<String> {
        self.reducers.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Builds every derived series for one rank, keeping reducer order.
    pub fn series(&self, records: &[OpRecord], group: &str, op: &str) -> Vec<(String, MetricSeries)> {
        let mut rows: Vec<(f64, f64)> = records
            .iter()
            .filter(|r| r.group == group && r.op == op)
            .map(|r| {
                let start_ms = r.start_ns as f64 / 1e6;
                let during_ms = (r.end_ns - r.start_ns).abs() as f64 / 1e6;
                (start_ms, during_ms)
            })
            .collect();

        // Launch and connection setup dominate the first iterations; drop
        // the leading fifth before windowing.
        let cut = rows.len() / 5;
        let rows = rows.split_off(cut);

        let mut buckets: BTreeMap<i64, (f64, Vec<f64>)> = BTreeMap::new();
        if let Some(min_start) = rows
            .iter()
            .map(|(start, _)| *start)
            .min_by(f64::total_cmp)
        {
            for (start, during) in &rows {
                let window = ((start - min_start) / self.window_ms).floor() as i64 + 1;
                let bucket = buckets.entry(window).or_insert((f64::INFINITY, Vec::new()));
                bucket.0 = bucket.0.min(*start);
                bucket.1.push(*during);
            }
        }

        self.reducers
            .iter()
            .map(|(name, reducer)| {
                let mut series = MetricSeries::default();
                for (ts, values) in buckets.values() {
                    series.timestamps.push(*ts);
                    series.values.push(reducer.apply(values));
                }
                (name.clone(), series)
            })
            .collect()
    }
}
