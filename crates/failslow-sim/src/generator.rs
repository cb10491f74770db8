//! Synthetic per-rank traces with controlled slow-rank injection.
//!
//! The generator reproduces the observable signature the detection lanes
//! consume: collective kernels report the executing rank's own device
//! time, so a slow rank inflates only its rows, while pipeline send/recv
//! pairs block on the peer and inflate for both ends. Every stream opens
//! with a job-wide broadcast, matching the synchronization preamble real
//! jobs emit before step work.
//!
//! Latencies are log-normal around per-operator baselines; group members
//! share exact start timestamps so aggregation windows line up across
//! ranks. A fixed seed yields a byte-identical trace.

use std::collections::BTreeMap;

use failslow_core::error::DetectError;
use failslow_core::trace::{EventSource, OpEvent, TraceSet, ops};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, LogNormal};
use tracing::debug;

use crate::topology::SimTopology;

const NS_PER_MS: f64 = 1_000_000.0;

// Step-relative start offsets, one slot per operator family.
const ALL_GATHER_OFFSET_NS: i64 = 10_000_000;
const REDUCE_SCATTER_OFFSET_NS: i64 = 30_000_000;
const ALL_REDUCE_OFFSET_NS: i64 = 50_000_000;
const SEND_RECV_OFFSET_NS: i64 = 70_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowMode {
    /// Jump straight to `factor` at `from_step` and hold it.
    Step,
    /// Accelerate toward `factor`, reaching it at the last step.
    Ramp,
}

/// One injected degradation.
#[derive(Debug, Clone)]
pub struct SlowRank {
    pub rank: u32,
    pub factor: f64,
    pub from_step: usize,
    pub mode: SlowMode,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub topology: SimTopology,
    pub steps: usize,
    pub step_interval_ms: u64,
    pub jitter_sigma: f64,
    pub launch_gap_ms: f64,
    pub seed: u64,
    pub slow_ranks: Vec<SlowRank>,
}

impl GeneratorConfig {
    pub fn new(topology: SimTopology) -> Self {
        GeneratorConfig {
            topology,
            steps: 25,
            step_interval_ms: 1000,
            jitter_sigma: 0.02,
            launch_gap_ms: 0.4,
            seed: 427,
            slow_ranks: Vec::new(),
        }
    }
}

fn base_latency_ms(op: &str) -> f64 {
    match op {
        ops::ALL_GATHER => 2.0,
        ops::REDUCE_SCATTER => 1.6,
        ops::ALL_REDUCE => 2.4,
        ops::BATCH_SEND_RECV => 1.2,
        ops::BROADCAST => 0.5,
        _ => 1.0,
    }
}

pub struct TraceGenerator {
    cfg: GeneratorConfig,
    rng: StdRng,
    jitter: LogNormal<f64>,
}

impl TraceGenerator {
    pub fn new(cfg: GeneratorConfig) -> Result<Self, DetectError> {
        if cfg.steps == 0 {
            return Err(DetectError::invalid_config("steps", "need at least one step"));
        }
        if cfg.step_interval_ms == 0 {
            return Err(DetectError::invalid_config(
                "step_interval_ms",
                "step interval must be positive",
            ));
        }
        if !cfg.jitter_sigma.is_finite() || cfg.jitter_sigma < 0.0 {
            return Err(DetectError::invalid_config(
                "jitter_sigma",
                "jitter sigma must be finite and non-negative",
            ));
        }
        if !cfg.launch_gap_ms.is_finite() || cfg.launch_gap_ms < 0.0 {
            return Err(DetectError::invalid_config(
                "launch_gap_ms",
                "launch gap must be finite and non-negative",
            ));
        }
        for slow in &cfg.slow_ranks {
            if slow.rank as usize >= cfg.topology.world_size() {
                return Err(DetectError::invalid_config(
                    "slow_ranks.rank",
                    format!("rank {} outside a {}-rank job", slow.rank, cfg.topology.world_size()),
                ));
            }
            if !slow.factor.is_finite() || slow.factor < 1.0 {
                return Err(DetectError::invalid_config(
                    "slow_ranks.factor",
                    "slowdown factor must be at least 1.0",
                ));
            }
            if slow.from_step >= cfg.steps {
                return Err(DetectError::invalid_config(
                    "slow_ranks.from_step",
                    format!("from_step {} past the last step {}", slow.from_step, cfg.steps - 1),
                ));
            }
            debug!(
                rank = slow.rank,
                factor = slow.factor,
                from_step = slow.from_step,
                mode = ?slow.mode,
                "slow rank injection configured"
            );
        }
        let jitter = LogNormal::new(0.0, cfg.jitter_sigma)
            .map_err(|err| DetectError::invalid_config("jitter_sigma", err.to_string()))?;
        let rng = StdRng::seed_from_u64(cfg.seed);
        Ok(TraceGenerator { cfg, rng, jitter })
    }

    pub fn generate(&mut self) -> TraceSet {
        let world = self.cfg.topology.world_size() as u32;
        let mut streams: BTreeMap<u32, Vec<OpEvent>> =
            (0..world).map(|rank| (rank, Vec::new())).collect();
        let mut next_id: BTreeMap<u32, u64> = (0..world).map(|rank| (rank, 1)).collect();

        // Job-wide synchronization broadcast ahead of any step work.
        let everyone: Vec<u32> = (0..world).collect();
        self.emit_collective(&mut streams, &mut next_id, &everyone, ops::BROADCAST, "sync_world", 0, 0);

        let interval_ns = self.cfg.step_interval_ms as i64 * 1_000_000;
        let tp_groups = self.cfg.topology.tp_groups();
        let dp_groups = self.cfg.topology.dp_groups();
        let pp_pairs = self.cfg.topology.pp_pairs();

        for step in 0..self.cfg.steps {
            let step_base = interval_ns * (step as i64 + 1);
            for (i, group) in tp_groups.iter().enumerate() {
                if group.len() < 2 {
                    continue;
                }
                let name = format!("tp_cg_{}", i);
                self.emit_collective(
                    &mut streams,
                    &mut next_id,
                    group,
                    ops::ALL_GATHER,
                    &name,
                    step,
                    step_base + ALL_GATHER_OFFSET_NS,
                );
                self.emit_collective(
                    &mut streams,
                    &mut next_id,
                    group,
                    ops::REDUCE_SCATTER,
                    &name,
                    step,
                    step_base + REDUCE_SCATTER_OFFSET_NS,
                );
            }
            for (i, group) in dp_groups.iter().enumerate() {
                if group.len() < 2 {
                    continue;
                }
                self.emit_collective(
                    &mut streams,
                    &mut next_id,
                    group,
                    ops::ALL_REDUCE,
                    &format!("dp_cg_{}", i),
                    step,
                    step_base + ALL_REDUCE_OFFSET_NS,
                );
            }
            for (i, pair) in pp_pairs.iter().enumerate() {
                self.emit_pair(
                    &mut streams,
                    &mut next_id,
                    pair,
                    &format!("pp_pair_{}", i),
                    step,
                    step_base + SEND_RECV_OFFSET_NS,
                );
            }
        }

        TraceSet { ranks: streams }
    }

    /// Per-member device time: each rank reports its own kernel span.
    fn emit_collective(
        &mut self,
        streams: &mut BTreeMap<u32, Vec<OpEvent>>,
        next_id: &mut BTreeMap<u32, u64>,
        group: &[u32],
        op: &str,
        name: &str,
        step: usize,
        start_ns: i64,
    ) {
        let base = base_latency_ms(op);
        for &rank in group {
            let mult = self.slow_multiplier(rank, step);
            self.emit_rank_op(streams, next_id, rank, op, name, start_ns, base * mult);
        }
    }

    /// Send/recv blocks on the peer, so the pair shares the slowest
    /// member's inflation.
    fn emit_pair(
        &mut self,
        streams: &mut BTreeMap<u32, Vec<OpEvent>>,
        next_id: &mut BTreeMap<u32, u64>,
        pair: &[u32],
        name: &str,
        step: usize,
        start_ns: i64,
    ) {
        let base = base_latency_ms(ops::BATCH_SEND_RECV);
        let mult = pair
            .iter()
            .map(|&rank| self.slow_multiplier(rank, step))
            .fold(1.0f64, f64::max);
        for &rank in pair {
            self.emit_rank_op(
                streams,
                next_id,
                rank,
                ops::BATCH_SEND_RECV,
                name,
                start_ns,
                base * mult,
            );
        }
    }

    fn emit_rank_op(
        &mut self,
        streams: &mut BTreeMap<u32, Vec<OpEvent>>,
        next_id: &mut BTreeMap<u32, u64>,
        rank: u32,
        op: &str,
        name: &str,
        start_ns: i64,
        duration_ms: f64,
    ) {
        let Some(stream) = streams.get_mut(&rank) else {
            return;
        };
        let id_slot = next_id.entry(rank).or_insert(1);
        let op_id = *id_slot;
        *id_slot += 1;

        let duration_ns = (duration_ms * self.jitter.sample(&mut self.rng) * NS_PER_MS) as i64;
        let host_ns = start_ns - (self.cfg.launch_gap_ms * NS_PER_MS) as i64;
        let device_id = rank % 8;

        stream.push(OpEvent {
            op_id,
            kind: 0,
            source: EventSource::Host,
            name: Some(format!("comm:{},{},f16,8192", op, name)),
            timestamp_ns: host_ns,
            device_id,
        });
        for ts in [start_ns, start_ns + duration_ns.max(1)] {
            stream.push(OpEvent {
                op_id,
                kind: 0,
                source: EventSource::Device,
                name: None,
                timestamp_ns: ts,
                device_id,
            });
        }
    }

    fn slow_multiplier(&self, rank: u32, step: usize) -> f64 {
        let mut mult: f64 = 1.0;
        for slow in &self.cfg.slow_ranks {
            if slow.rank != rank || step < slow.from_step {
                continue;
            }
            let m = match slow.mode {
                SlowMode::Step => slow.factor,
                SlowMode::Ramp => {
                    let span = (self.cfg.steps - slow.from_step) as f64;
                    let progress = (step - slow.from_step + 1) as f64 / span;
                    1.0 + (slow.factor - 1.0) * progress * progress
                }
            };
            mult = mult.max(m);
        }
        mult
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use failslow_core::trace::TraceStore;

    fn config(slow_ranks: Vec<SlowRank>) -> GeneratorConfig {
        let topology = SimTopology::new(4, 1, 2).unwrap();
        let mut cfg = GeneratorConfig::new(topology);
        cfg.slow_ranks = slow_ranks;
        cfg
    }

    fn mean_duration_ms(store: &TraceStore, rank: u32, op: &str) -> f64 {
        let records = store.device_lane(rank).unwrap();
        let durations: Vec<f64> = records
            .iter()
            .filter(|r| r.op == op)
            .map(|r| (r.end_ns - r.start_ns) as f64 / NS_PER_MS)
            .collect();
        assert!(!durations.is_empty(), "rank {} has no {} records", rank, op);
        durations.iter().sum::<f64>() / durations.len() as f64
    }

    #[test]
    fn identical_seeds_give_identical_traces() {
        let a = TraceGenerator::new(config(vec![])).unwrap().generate();
        let b = TraceGenerator::new(config(vec![])).unwrap().generate();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap(),
            "a fixed seed must reproduce the trace byte for byte"
        );
    }

    #[test]
    fn stream_shape_matches_the_job_layout() {
        // tp 4, dp 1, pp 2: per step each rank runs all-gather,
        // reduce-scatter and one send/recv pair; data groups are
        // singletons and emit nothing.
        let set = TraceGenerator::new(config(vec![])).unwrap().generate();
        assert_eq!(set.ranks.len(), 8);
        let events = &set.ranks[&0];
        let expected_ops = 1 + 25 * 3;
        assert_eq!(events.len(), expected_ops * 3, "three events per operation");
    }

    #[test]
    fn slow_rank_inflates_only_its_own_collective_rows() {
        let slow = SlowRank {
            rank: 5,
            factor: 4.0,
            from_step: 0,
            mode: SlowMode::Step,
        };
        let set = TraceGenerator::new(config(vec![slow])).unwrap().generate();
        let store = TraceStore::build(&set);

        let slow_mean = mean_duration_ms(&store, 5, ops::ALL_GATHER);
        let peer_mean = mean_duration_ms(&store, 4, ops::ALL_GATHER);
        assert!(
            slow_mean > 3.0 * peer_mean,
            "rank 5 all-gather should run about 4x its peer: {} vs {}",
            slow_mean,
            peer_mean
        );
    }

    #[test]
    fn send_recv_pairs_inflate_both_ends() {
        let slow = SlowRank {
            rank: 5,
            factor: 4.0,
            from_step: 0,
            mode: SlowMode::Step,
        };
        let set = TraceGenerator::new(config(vec![slow])).unwrap().generate();
        let store = TraceStore::build(&set);

        // Rank 1 is rank 5's pipeline peer and is otherwise healthy.
        let peer_pair = mean_duration_ms(&store, 1, ops::BATCH_SEND_RECV);
        let outsider_pair = mean_duration_ms(&store, 2, ops::BATCH_SEND_RECV);
        assert!(
            peer_pair > 3.0 * outsider_pair,
            "the blocked peer should see the same inflation: {} vs {}",
            peer_pair,
            outsider_pair
        );
        let peer_gather = mean_duration_ms(&store, 1, ops::ALL_GATHER);
        assert!(
            peer_gather < 3.0,
            "the peer's own kernels stay at baseline: {}",
            peer_gather
        );
    }

    #[test]
    fn ramp_mode_grows_into_the_factor() {
        let slow = SlowRank {
            rank: 0,
            factor: 6.0,
            from_step: 19,
            mode: SlowMode::Ramp,
        };
        let set = TraceGenerator::new(config(vec![slow])).unwrap().generate();
        let store = TraceStore::build(&set);
        let records: Vec<f64> = store
            .device_lane(0)
            .unwrap()
            .iter()
            .filter(|r| r.op == ops::ALL_GATHER)
            .map(|r| (r.end_ns - r.start_ns) as f64 / NS_PER_MS)
            .collect();
        assert_eq!(records.len(), 25);
        assert!(records[18] < 2.2, "before from_step the rank is healthy");
        assert!(
            records[24] > 11.0,
            "the last step reaches the full factor: {}",
            records[24]
        );
        assert!(
            records[21] > records[20] && records[23] > records[22],
            "the ramp grows monotonically"
        );
    }

    #[test]
    fn invalid_injections_are_rejected() {
        let bad_rank = SlowRank {
            rank: 64,
            factor: 2.0,
            from_step: 0,
            mode: SlowMode::Step,
        };
        assert!(TraceGenerator::new(config(vec![bad_rank])).is_err());

        let bad_factor = SlowRank {
            rank: 0,
            factor: 0.5,
            from_step: 0,
            mode: SlowMode::Step,
        };
        assert!(TraceGenerator::new(config(vec![bad_factor])).is_err());

        let late_start = SlowRank {
            rank: 0,
            factor: 2.0,
            from_step: 25,
            mode: SlowMode::Step,
        };
        assert!(TraceGenerator::new(config(vec![late_start])).is_err());
    }
}
