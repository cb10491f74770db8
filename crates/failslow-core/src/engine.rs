//! Detection engine: wires traces, topology and detectors into lanes.
//!
//! Three lanes run over one job, each watching a different failure
//! surface:
//!
//! - cal: device execution time of a compute-adjacent collective,
//! - op-launch: host dispatch latency of the same collective,
//! - comm: point-to-point traffic on pipeline edges, voted across rounds
//!   with a group-level pre-pass supplying priors.
//!
//! Group analyses are independent, so they fan out over a small worker
//! pool; one failed group is logged and dropped without taking the run
//! down.

use std::collections::BTreeMap;

use chrono::Utc;
use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, MetricSeries};
use crate::catalog::CommGroupCatalog;
use crate::config::{JobConfig, MetricConfig};
use crate::detect::{DetectionResult, Entity};
use crate::error::DetectError;
use crate::fusion::GroupAnomalyDetector;
use crate::report::{JobDetectResult, ResponseBuilder};
use crate::topology::{TopologyMap, TopologyReconstructor, is_continuous, is_same_rank_set};
use crate::trace::{TraceSet, TraceStore, ops};
use crate::voting::{RootCauseVoter, merge_rounds, slow_group_priors};

/// The communication lane needs enough ranks for voting to mean anything.
const MIN_COMM_RANKS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneKind {
    Device,
    Launch,
}

/// One group analysis unit: a communicator, the ranks to compare and the
/// metric driving aggregation.
#[derive(Debug, Clone)]
struct GroupJob {
    metric: String,
    comm_name: String,
    ranks: Vec<u32>,
    lane: LaneKind,
}

pub struct SlowNodeEngine {
    metric_config: MetricConfig,
    job_config: JobConfig,
    store: TraceStore,
    catalog: CommGroupCatalog,
    topology: TopologyMap,
    ranks: Vec<u32>,
}

impl SlowNodeEngine {
    pub fn new(
        metric_config: MetricConfig,
        job_config: JobConfig,
        traces: &TraceSet,
    ) -> Result<Self, DetectError> {
        metric_config.validate()?;
        job_config.validate()?;

        let store = TraceStore::build(traces);
        if store.is_empty() {
            warn!("trace set holds no ranks; detection will report an empty normal result");
        }
        let ranks = store.ranks();
        let catalog = CommGroupCatalog::scan(&store);
        let topology = if job_config.hccl_domain.is_empty() {
            TopologyReconstructor::new(&catalog, &ranks).reconstruct()
        } else {
            info!("topology supplied by config, skipping reconstruction");
            job_config.hccl_domain.clone()
        };
        info!(
            ranks = ranks.len(),
            groups = catalog.len(),
            tp_size = topology.tp_size(),
            dp_size = topology.dp_size(),
            pp_size = topology.pp_size(),
            "detection engine ready"
        );

        Ok(SlowNodeEngine {
            metric_config,
            job_config,
            store,
            catalog,
            topology,
            ranks,
        })
    }

    pub fn topology(&self) -> &TopologyMap {
        &self.topology
    }

    /// Runs every enabled lane and folds the outcomes into one report.
    pub fn detect(&self) -> JobDetectResult {
        let mut results: Vec<DetectionResult> = Vec::new();
        let toggles = &self.job_config.enable_detect_type;
        let lane_ops = &self.job_config.fail_slow_ops;

        if toggles.enable_cal {
            results.extend(self.detect_axis_lane(&lane_ops.cal_slow, LaneKind::Device));
        }
        if toggles.enable_op_launch {
            results.extend(self.detect_axis_lane(&lane_ops.op_launch_slow, LaneKind::Launch));
        }
        if toggles.enable_comm {
            if self.ranks.len() >= MIN_COMM_RANKS {
                results.extend(self.detect_comm_slow(&lane_ops.comm_slow));
            } else {
                info!(
                    ranks = self.ranks.len(),
                    "job below communication lane threshold, skipping"
                );
            }
        }

        ResponseBuilder::new(&self.metric_config, &self.job_config)
            .build(Utc::now().timestamp(), &results)
    }

    // ============================================================
    //  LANES
    // ============================================================

    /// Groups the cal and op-launch lanes compare within: tensor groups,
    /// or data groups when tensor parallelism is trivial.
    fn axis_targets(&self) -> Vec<Vec<u32>> {
        if self.topology.tp_size() == 1 {
            self.topology.dp.clone()
        } else {
            self.topology.tp.clone()
        }
    }

    /// Cal and op-launch share everything but the lane they read.
    fn detect_axis_lane(&self, metric: &str, lane: LaneKind) -> Vec<DetectionResult> {
        let targets = self.axis_targets();
        let mut jobs = Vec::new();
        for target in &targets {
            for comm in self.catalog.groups() {
                if is_same_rank_set(&comm.sorted_ranks(), target) && is_continuous(target) {
                    jobs.push(GroupJob {
                        metric: metric.to_string(),
                        comm_name: comm.name.clone(),
                        ranks: target.clone(),
                        lane,
                    });
                }
            }
        }
        debug!(metric, jobs = jobs.len(), "axis lane assembled");
        self.run_jobs(&jobs).into_iter().flatten().collect()
    }

    /// Pipeline-edge traffic, voted per send group across reducer rounds.
    fn detect_comm_slow(&self, metric: &str) -> Vec<DetectionResult> {
        let mut priors: Vec<Vec<u32>> = Vec::new();
        match self.detect_group_slow() {
            Ok(Some(group_result)) => priors.extend(slow_group_priors(&group_result)),
            Ok(None) => debug!("group-slow pre-pass produced no comparison"),
            Err(err) => warn!(error = %err, "group-slow pre-pass failed"),
        }
        priors.extend(self.job_config.known_slow_groups.iter().cloned());

        let jobs = self.send_group_jobs(metric);
        debug!(metric, jobs = jobs.len(), priors = priors.len(), "communication lane assembled");
        let mut results = Vec::new();
        for (job, rounds) in jobs.iter().zip(self.run_jobs(&jobs)) {
            if rounds.is_empty() {
                continue;
            }
            let voter = RootCauseVoter {
                group_ranks: &job.ranks,
                priors: &priors,
            };
            let candidates = voter.vote(&rounds);
            if let Some(merged) = merge_rounds(&rounds, &candidates) {
                results.push(merged);
            }
        }
        results
    }

    fn send_group_jobs(&self, metric: &str) -> Vec<GroupJob> {
        let mut jobs = Vec::new();
        for pp_group in &self.topology.pp {
            for comm in self.catalog.groups() {
                if comm.has_op(metric) && is_same_rank_set(&comm.sorted_ranks(), pp_group) {
                    jobs.push(GroupJob {
                        metric: metric.to_string(),
                        comm_name: comm.name.clone(),
                        ranks: pp_group.clone(),
                        lane: LaneKind::Device,
                    });
                }
            }
        }
        jobs
    }

    /// Compares whole groups against each other: each axis group collapses
    /// to one mean series, and the spatial detector hunts for a group that
    /// lags its siblings. The flagged groups become voting priors.
    fn detect_group_slow(&self) -> Result<Option<DetectionResult>, DetectError> {
        let (metric, targets) = if self.topology.tp_size() == 1 {
            (ops::ALL_REDUCE.to_string(), &self.topology.dp)
        } else {
            (ops::ALL_GATHER.to_string(), &self.topology.tp)
        };
        let Some(spec) = self.metric_config.get(&metric) else {
            warn!(metric, "no metric config for group-slow comparison");
            return Ok(None);
        };
        let aggregator = Aggregator::from_spec(&metric, &spec.aggregation)?;

        let mut data: BTreeMap<Entity, MetricSeries> = BTreeMap::new();
        let mut min_len = usize::MAX;
        for target in targets {
            for comm in self.catalog.groups() {
                if !(is_same_rank_set(&comm.sorted_ranks(), target) && is_continuous(target)) {
                    continue;
                }
                let mut member_series = Vec::new();
                for &rank in target {
                    let Some(records) = self.store.device_lane(rank) else {
                        continue;
                    };
                    let mut derived = aggregator.series(records, &comm.name, &metric);
                    if !derived.is_empty() {
                        member_series.push(derived.swap_remove(0).1);
                    }
                }
                let merged = mean_merge(&member_series);
                min_len = min_len.min(merged.len());
                data.insert(Entity::Group(target.clone()), merged);
            }
        }
        if data.is_empty() {
            return Ok(None);
        }
        if min_len == usize::MAX {
            min_len = 0;
        }

        let detector = GroupAnomalyDetector {
            metric,
            time: spec.time_detector.as_ref(),
            space: spec.space_detector.as_ref(),
        };
        Ok(Some(detector.detect(min_len, data)))
    }

    // ============================================================
    //  GROUP ANALYSIS
    // ============================================================

    /// One detection round per derived metric for one group.
    fn analyze_group(&self, job: &GroupJob) -> Result<Vec<DetectionResult>, DetectError> {
        let spec = self.metric_config.get(&job.metric).ok_or_else(|| {
            DetectError::data_missing(format!("metric config entry for {}", job.metric))
        })?;
        let aggregator = Aggregator::from_spec(&job.metric, &spec.aggregation)?;
        // The op-launch metric carries a suffix; rows are filtered by the
        // underlying operator name.
        let filter_op = job.metric.split('_').next().unwrap_or(&job.metric);

        let mut per_rank: Vec<(u32, Vec<(String, MetricSeries)>)> = Vec::new();
        let mut min_len = usize::MAX;
        for &rank in &job.ranks {
            let records = match job.lane {
                LaneKind::Device => self.store.device_lane(rank),
                LaneKind::Launch => self.store.launch_lane(rank),
            };
            let Some(records) = records else {
                warn!(rank, group = %job.comm_name, "rank absent from trace store");
                min_len = 0;
                continue;
            };
            let derived = aggregator.series(records, &job.comm_name, filter_op);
            let len = derived.first().map(|(_, s)| s.len()).unwrap_or(0);
            min_len = min_len.min(len);
            per_rank.push((rank, derived));
        }
        if per_rank.is_empty() || min_len == usize::MAX {
            min_len = 0;
        }

        let mut rounds = Vec::new();
        for name in aggregator.derived_names() {
            let mut data = BTreeMap::new();
            for (rank, derived) in &per_rank {
                if let Some((_, series)) = derived.iter().find(|(n, _)| n == &name) {
                    data.insert(Entity::Rank(*rank), series.clone());
                }
            }
            let detector = GroupAnomalyDetector {
                metric: name,
                time: spec.time_detector.as_ref(),
                space: spec.space_detector.as_ref(),
            };
            rounds.push(detector.detect(min_len, data));
        }
        Ok(rounds)
    }

    /// Fans group jobs over a bounded worker pool; output stays aligned
    /// with the input order and failed jobs come back empty.
    fn run_jobs(&self, jobs: &[GroupJob]) -> Vec<Vec<DetectionResult>> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(jobs.len());

        let mut slots: Vec<Vec<DetectionResult>> = jobs.iter().map(|_| Vec::new()).collect();
        if workers <= 1 {
            for (idx, job) in jobs.iter().enumerate() {
                match self.analyze_group(job) {
                    Ok(rounds) => slots[idx] = rounds,
                    Err(err) => {
                        warn!(group = %job.comm_name, error = %err, "group analysis failed")
                    }
                }
            }
            return slots;
        }

        let (job_tx, job_rx) = bounded::<(usize, &GroupJob)>(jobs.len());
        let (result_tx, result_rx) = bounded(jobs.len());
        for pair in jobs.iter().enumerate() {
            if job_tx.send(pair).is_err() {
                break;
            }
        }
        drop(job_tx);

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("failslow-group-{}", worker))
                    .spawn_scoped(scope, move || {
                        // The job queue is fully loaded and closed, so recv
                        // drains it and ends cleanly.
                        while let Ok((idx, job)) = job_rx.recv() {
                            if result_tx.send((idx, self.analyze_group(job))).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(err) = spawned {
                    warn!(worker, error = %err, "worker thread failed to start");
                }
            }
        });
        drop(result_tx);

        for (idx, outcome) in result_rx.try_iter() {
            match outcome {
                Ok(rounds) => slots[idx] = rounds,
                Err(err) => {
                    warn!(group = %jobs[idx].comm_name, error = %err, "group analysis failed")
                }
            }
        }
        slots
    }
}

/// Row-wise mean across member series, truncated to the shortest.
fn mean_merge(series_list: &[MetricSeries]) -> MetricSeries {
    let Some(first) = series_list.first() else {
        return MetricSeries::default();
    };
    let len = series_list.iter().map(MetricSeries::len).min().unwrap_or(0);
    MetricSeries {
        timestamps: first.timestamps[..len].to_vec(),
        values: (0..len)
            .map(|i| {
                series_list.iter().map(|s| s.values[i]).sum::<f64>() / series_list.len() as f64
            })
            .collect(),
    }
}
