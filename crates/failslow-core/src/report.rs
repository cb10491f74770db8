//! Externally consumed detection reports.
//!
//! The report shape is fixed by downstream consumers: camelCase keys,
//! numeric result codes, one record per device with string object ids.
//! Abnormal records may carry their windowed series so an operator can see
//! what the detector saw; healthy peers are attached for comparison, capped
//! and the overflow listed as omitted.

use serde::{Serialize, Serializer};
use tracing::warn;

use crate::aggregate::MetricSeries;
use crate::config::{AnomalyCategory, JobConfig, MetricConfig};
use crate::detect::{AnomalyLocation, DetectionResult, Entity, MethodKind};
use crate::error::DetectError;

// ============================================================
//  REPORT SHAPE
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Normal,
    Anomaly,
}

impl ResultCode {
    pub fn code(&self) -> u16 {
        match self {
            ResultCode::Normal => 200,
            ResultCode::Anomaly => 201,
        }
    }
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

/// One windowed sample on a report record.
///
/// Serialized as `{"<timestamp>": "<value>"}` with an extra `abnormal` 0/1
/// field on abnormal records.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiPoint {
    pub timestamp: f64,
    pub value: f64,
    pub abnormal: Option<bool>,
}

impl Serialize for KpiPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(&self.timestamp.to_string(), &self.value.to_string())?;
        if let Some(abnormal) = self.abnormal {
            map.serialize_entry("abnormal", &u8::from(abnormal))?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub object_id: String,
    pub server_ip: String,
    pub device_info: String,
    pub kpi_id: String,
    pub method_type: MethodKind,
    pub kpi_data: Vec<KpiPoint>,
    pub rela_ids: Vec<i64>,
    pub omitted_devices: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetectResult {
    pub timestamp: i64,
    pub result_code: ResultCode,
    pub compute: bool,
    pub network: bool,
    pub storage: bool,
    pub abnormal_detail: Vec<NodeRecord>,
    pub normal_detail: Vec<NodeRecord>,
    pub error_msg: String,
}

impl JobDetectResult {
    pub fn normal(timestamp: i64) -> Self {
        JobDetectResult {
            timestamp,
            result_code: ResultCode::Normal,
            compute: false,
            network: false,
            storage: false,
            abnormal_detail: Vec::new(),
            normal_detail: Vec::new(),
            error_msg: String::new(),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String, DetectError> {
        serde_json::to_string_pretty(self).map_err(|e| DetectError::parse("report", &e))
    }
}

// ============================================================
//  RESPONSE BUILDER
// ============================================================

/// Folds detection results into one externally visible report.
pub struct ResponseBuilder<'a> {
    metric_config: &'a MetricConfig,
    max_num_normal_results: usize,
    record_kpi: bool,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(metric_config: &'a MetricConfig, job: &JobConfig) -> Self {
        ResponseBuilder {
            metric_config,
            max_num_normal_results: job.max_num_normal_results,
            record_kpi: job.record_kpi,
        }
    }

    /// A failed fold is logged and the remaining results still land in the
    /// report; one malformed result must not hide the others.
    pub fn build(&self, timestamp: i64, results: &[DetectionResult]) -> JobDetectResult {
        let mut report = JobDetectResult::normal(timestamp);
        for result in results {
            if !result.is_anomalous() {
                continue;
            }
            if let Err(err) = self.fold(&mut report, result) {
                warn!(
                    metric = %result.metric_name,
                    error = %err,
                    "failed to fold detection result into report"
                );
            }
        }
        report
    }

    fn fold(&self, report: &mut JobDetectResult, result: &DetectionResult) -> Result<(), DetectError> {
        report.result_code = ResultCode::Anomaly;
        match self.metric_config.category_of(&result.metric_name) {
            AnomalyCategory::Compute => report.compute = true,
            AnomalyCategory::Network => report.network = true,
            AnomalyCategory::Storage => report.storage = true,
        }

        // Healthy peers are resolved once per result, triggered by the
        // first spatially flagged device: only a spatial verdict names a
        // peer population worth attaching.
        let mut keep: Vec<Entity> = Vec::new();
        let mut omitted: Vec<i64> = Vec::new();
        let mut peers_resolved = false;

        for entity in &result.anomaly_devices {
            let location = result
                .anomaly_locations
                .get(entity)
                .and_then(|by_metric| by_metric.get(&result.metric_name))
                .ok_or_else(|| {
                    DetectError::data_missing(format!(
                        "anomaly location for device {} metric {}",
                        entity, result.metric_name
                    ))
                })?;
            let method = result
                .method_types
                .get(entity)
                .and_then(|by_metric| by_metric.get(&result.metric_name))
                .copied()
                .unwrap_or(MethodKind::Time);

            if method == MethodKind::Space && !peers_resolved {
                let healthy: Vec<&Entity> = result
                    .group_data
                    .keys()
                    .filter(|peer| !result.anomaly_devices.contains(peer))
                    .collect();
                keep = healthy
                    .iter()
                    .take(self.max_num_normal_results)
                    .map(|peer| (*peer).clone())
                    .collect();
                omitted = healthy
                    .iter()
                    .skip(self.max_num_normal_results)
                    .filter_map(|peer| peer.as_rank().map(i64::from))
                    .collect();
                peers_resolved = true;
            }

            let kpi_data = if self.record_kpi {
                result
                    .group_data
                    .get(entity)
                    .map(|series| kpi_points(series, Some(location)))
                    .unwrap_or_default()
            } else {
                Vec::new()
            };

            report.abnormal_detail.push(NodeRecord {
                object_id: entity.to_string(),
                server_ip: "localhost".to_string(),
                device_info: format!("rank_{}", entity),
                kpi_id: result.metric_name.clone(),
                method_type: method,
                kpi_data,
                rela_ids: keep.iter().filter_map(|p| p.as_rank().map(i64::from)).collect(),
                omitted_devices: omitted.clone(),
            });
        }

        for peer in &keep {
            let kpi_data = if self.record_kpi {
                result
                    .group_data
                    .get(peer)
                    .map(|series| kpi_points(series, None))
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            report.normal_detail.push(NodeRecord {
                object_id: peer.to_string(),
                server_ip: "localhost".to_string(),
                device_info: format!("rank_{}", peer),
                kpi_id: result.metric_name.clone(),
                method_type: MethodKind::Space,
                kpi_data,
                rela_ids: Vec::new(),
                omitted_devices: Vec::new(),
            });
        }

        Ok(())
    }
}

/// Pairs a series with its labels positionally; labels always cover a
/// prefix of the series.
fn kpi_points(series: &MetricSeries, location: Option<&AnomalyLocation>) -> Vec<KpiPoint> {
    (0..series.len())
        .map(|i| KpiPoint {
            timestamp: series.timestamps[i],
            value: series.values[i],
            abnormal: location.map(|loc| loc.labels.get(i).copied().unwrap_or(false)),
        })
        .collect()
}
