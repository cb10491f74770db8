//! Configuration surfaces for the detection pipeline.
//!
//! Two documents drive a run: the metric config, mapping each observed
//! metric to its aggregation and detector settings, and the job config,
//! holding lane toggles, topology overrides and reporting knobs. Both are
//! strict JSON: unknown fields are rejected at load time, and every
//! numeric knob is validated before the pipeline starts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::Reducer;
use crate::detect::{SpaceDetectorConfig, TimeDetectorConfig};
use crate::error::DetectError;
use crate::perception::PerceptionConfig;
use crate::topology::TopologyMap;
use crate::trace::ops;

// ============================================================
//  METRIC CONFIG
// ============================================================

/// Which job subsystem a metric's anomalies implicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyCategory {
    Compute,
    Network,
    Storage,
}

impl Default for AnomalyCategory {
    fn default() -> Self {
        AnomalyCategory::Compute
    }
}

/// One window reducer, e.g. `{"func": "percentile", "func_params": {"q": 90}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReducerSpec {
    #[serde(default = "default_func")]
    pub func: String,
    #[serde(default)]
    pub func_params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationSpec {
    #[serde(default = "default_during_s")]
    pub during_s: u64,
    #[serde(default)]
    pub funcs: Vec<ReducerSpec>,
}

/// Full per-metric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    pub aggregation: AggregationSpec,
    #[serde(rename = "type", default)]
    pub category: AnomalyCategory,
    #[serde(default)]
    pub time_detector: Option<TimeDetectorConfig>,
    #[serde(default)]
    pub space_detector: Option<SpaceDetectorConfig>,
}

impl MetricSpec {
    fn validate(&self, metric: &str) -> Result<(), DetectError> {
        if self.aggregation.during_s == 0 {
            return Err(DetectError::invalid_config(
                format!("{}.aggregation.during_s", metric),
                "window width must be at least one second",
            ));
        }
        if self.aggregation.funcs.is_empty() {
            return Err(DetectError::invalid_config(
                format!("{}.aggregation.funcs", metric),
                "at least one reducer required",
            ));
        }
        for func in &self.aggregation.funcs {
            Reducer::resolve(func)?;
        }
        if let Some(time) = &self.time_detector {
            time.validate(metric)?;
        }
        if let Some(space) = &self.space_detector {
            space.validate(metric)?;
        }
        Ok(())
    }
}

/// Metric name to settings, the top-level shape of the metric config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricConfig(pub BTreeMap<String, MetricSpec>);

impl MetricConfig {
    pub fn load(path: &str) -> Result<Self, DetectError> {
        let text = std::fs::read_to_string(path).map_err(|e| DetectError::io(path, &e))?;
        let config: MetricConfig =
            serde_json::from_str(&text).map_err(|e| DetectError::parse(path, &e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        for (metric, spec) in &self.0 {
            spec.validate(metric)?;
        }
        Ok(())
    }

    pub fn get(&self, metric: &str) -> Option<&MetricSpec> {
        self.0.get(metric)
    }

    /// Looks a derived series name up under its base metric, so
    /// `HcclAllGather!percentile_q-90` resolves to `HcclAllGather`.
    pub fn base_spec(&self, derived: &str) -> Option<&MetricSpec> {
        let base = derived.split('!').next().unwrap_or(derived);
        self.0.get(base)
    }

    pub fn category_of(&self, derived: &str) -> AnomalyCategory {
        self.base_spec(derived)
            .map(|spec| spec.category)
            .unwrap_or_default()
    }
}

// ============================================================
//  JOB CONFIG
// ============================================================

/// Which detection lanes run for this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectToggles {
    #[serde(default = "default_true")]
    pub enable_cal: bool,
    #[serde(default)]
    pub enable_op_launch: bool,
    #[serde(default)]
    pub enable_comm: bool,
}

impl Default for DetectToggles {
    fn default() -> Self {
        DetectToggles {
            enable_cal: true,
            enable_op_launch: false,
            enable_comm: false,
        }
    }
}

/// The metric each lane watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailSlowOps {
    #[serde(default = "default_cal_op")]
    pub cal_slow: String,
    #[serde(default = "default_launch_op")]
    pub op_launch_slow: String,
    #[serde(default = "default_comm_op")]
    pub comm_slow: String,
}

impl Default for FailSlowOps {
    fn default() -> Self {
        FailSlowOps {
            cal_slow: default_cal_op(),
            op_launch_slow: default_launch_op(),
            comm_slow: default_comm_op(),
        }
    }
}

/// Per-job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Known topology; when any axis is present, reconstruction from the
    /// trace is skipped.
    #[serde(default)]
    pub hccl_domain: TopologyMap,
    #[serde(default)]
    pub enable_detect_type: DetectToggles,
    #[serde(default)]
    pub fail_slow_ops: FailSlowOps,
    #[serde(default = "default_max_normal")]
    pub max_num_normal_results: usize,
    /// Attach windowed series values to report records.
    #[serde(default)]
    pub record_kpi: bool,
    /// Rank groups known to sit on degraded hardware; fed to voting as
    /// prior evidence alongside detected slow groups.
    #[serde(default)]
    pub known_slow_groups: Vec<Vec<u32>>,
    #[serde(default)]
    pub perception: PerceptionConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            hccl_domain: TopologyMap::default(),
            enable_detect_type: DetectToggles::default(),
            fail_slow_ops: FailSlowOps::default(),
            max_num_normal_results: default_max_normal(),
            record_kpi: false,
            known_slow_groups: Vec::new(),
            perception: PerceptionConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn load(path: &str) -> Result<Self, DetectError> {
        let text = std::fs::read_to_string(path).map_err(|e| DetectError::io(path, &e))?;
        let config: JobConfig =
            serde_json::from_str(&text).map_err(|e| DetectError::parse(path, &e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        for (i, group) in self.known_slow_groups.iter().enumerate() {
            if group.is_empty() {
                return Err(DetectError::invalid_config(
                    format!("known_slow_groups[{}]", i),
                    "a slow group cannot be empty",
                ));
            }
        }
        self.perception.validate()?;
        Ok(())
    }
}

// ============================================================
//  DEFAULTS
// ============================================================

fn default_func() -> String {
    "mean".to_string()
}

fn default_during_s() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cal_op() -> String {
    ops::ALL_GATHER.to_string()
}

fn default_launch_op() -> String {
    format!("{}_launch", ops::ALL_GATHER)
}

fn default_comm_op() -> String {
    ops::BATCH_SEND_RECV.to_string()
}

fn default_max_normal() -> usize {
    10
}
