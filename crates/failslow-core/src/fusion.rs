//! Fused temporal and spatial detection for one group and metric.
//!
//! The temporal view asks "did this entity get slower than its own past",
//! the spatial view asks "does this entity sit apart from its peers right
//! now". Fusion lets the spatial verdict override the temporal one in both
//! directions: a spatial flag promotes an entity even when its own history
//! looks smooth, and a clean spatial row demotes a temporal alarm that every
//! peer shares. A slowdown hitting the whole group alike is real but it is
//! not a straggler, and this stage is only hunting stragglers.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::aggregate::MetricSeries;
use crate::detect::{
    AnomalyLocation, DetectionResult, Entity, MethodKind, SpaceDetectorConfig, TimeDetectorConfig,
};

/// Minimum entity count for the spatial view; below this a majority is
/// statistically meaningless.
pub const MIN_SPACE_ENTITIES: usize = 4;

/// One fused detection pass over a group's per-entity series.
pub struct GroupAnomalyDetector<'a> {
    pub metric: String,
    pub time: Option<&'a TimeDetectorConfig>,
    pub space: Option<&'a SpaceDetectorConfig>,
}

impl GroupAnomalyDetector<'_> {
    /// `min_len` is the shortest series any entity produced; zero means at
    /// least one entity had no usable windows and the round is abandoned.
    pub fn detect(&self, min_len: usize, data: BTreeMap<Entity, MetricSeries>) -> DetectionResult {
        let mut result = DetectionResult::empty(&self.metric);
        if min_len == 0 {
            warn!(metric = %self.metric, "an entity produced no windows, skipping round");
            result.group_data = data;
            return result;
        }
        let Some(time) = self.time else {
            debug!(metric = %self.metric, "no temporal detector configured, skipping round");
            result.group_data = data;
            return result;
        };

        // Temporal verdict per entity over its full series.
        let mut time_locations: BTreeMap<Entity, AnomalyLocation> = BTreeMap::new();
        for (entity, series) in &data {
            time_locations.insert(
                entity.clone(),
                AnomalyLocation {
                    timestamps: series.timestamps.clone(),
                    labels: time.labels(series),
                },
            );
        }

        // Spatial verdict over the aligned window matrix.
        let mut space_locations: BTreeMap<Entity, AnomalyLocation> = BTreeMap::new();
        if let Some(space) = self.space {
            if data.len() >= MIN_SPACE_ENTITIES {
                let aligned = data.values().map(MetricSeries::len).min().unwrap_or(0);
                let entities: Vec<&Entity> = data.keys().collect();
                let rows: Vec<Vec<f64>> = (0..aligned)
                    .map(|w| entities.iter().map(|e| data[*e].values[w]).collect())
                    .collect();
                let labels = space.labels(&rows);
                for (col, entity) in entities.iter().enumerate() {
                    let series = &data[*entity];
                    space_locations.insert(
                        (*entity).clone(),
                        AnomalyLocation {
                            timestamps: series.timestamps[..aligned].to_vec(),
                            labels: (0..aligned).map(|w| labels[w][col]).collect(),
                        },
                    );
                }
            }
        }

        // Fuse: the spatial verdict replaces the temporal one wherever it
        // exists, clearing shared slowdowns and keeping true stragglers.
        for (entity, time_loc) in time_locations {
            let (location, method) = match space_locations.remove(&entity) {
                Some(space_loc) => (space_loc, MethodKind::Space),
                None => (time_loc, MethodKind::Time),
            };
            if location.any() {
                result.anomaly_devices.push(entity.clone());
            }
            result
                .anomaly_locations
                .entry(entity.clone())
                .or_default()
                .insert(self.metric.clone(), location);
            result
                .method_types
                .entry(entity)
                .or_default()
                .insert(self.metric.clone(), method);
        }

        result.group_data = data;
        result
    }
}
