//! Megatron-style rank layouts for synthetic jobs.
//!
//! Rank numbering is tensor-fastest: consecutive ranks share a tensor
//! group, ranks `tp_size` apart within one pipeline stage share a data
//! group, and ranks `tp_size * dp_size` apart form a pipeline chain.

use failslow_core::error::DetectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTopology {
    pub tp_size: usize,
    pub dp_size: usize,
    pub pp_size: usize,
}

impl SimTopology {
    pub fn new(tp_size: usize, dp_size: usize, pp_size: usize) -> Result<Self, DetectError> {
        for (axis, size) in [
            ("tp_size", tp_size),
            ("dp_size", dp_size),
            ("pp_size", pp_size),
        ] {
            if size == 0 {
                return Err(DetectError::invalid_config(
                    axis,
                    "parallelism sizes must be at least one",
                ));
            }
        }
        Ok(SimTopology {
            tp_size,
            dp_size,
            pp_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.tp_size * self.dp_size * self.pp_size
    }

    pub fn rank(&self, stage: usize, dp_i: usize, tp_i: usize) -> u32 {
        (stage * self.tp_size * self.dp_size + dp_i * self.tp_size + tp_i) as u32
    }

    /// Consecutive blocks of `tp_size` ranks, one per (stage, data slot).
    pub fn tp_groups(&self) -> Vec<Vec<u32>> {
        let mut groups = Vec::new();
        for stage in 0..self.pp_size {
            for dp_i in 0..self.dp_size {
                groups.push(
                    (0..self.tp_size)
                        .map(|tp_i| self.rank(stage, dp_i, tp_i))
                        .collect(),
                );
            }
        }
        groups
    }

    /// Ranks at the same tensor slot within one stage, stride `tp_size`.
    pub fn dp_groups(&self) -> Vec<Vec<u32>> {
        let mut groups = Vec::new();
        for stage in 0..self.pp_size {
            for tp_i in 0..self.tp_size {
                groups.push(
                    (0..self.dp_size)
                        .map(|dp_i| self.rank(stage, dp_i, tp_i))
                        .collect(),
                );
            }
        }
        groups
    }

    /// One chain per (data slot, tensor slot), stride `tp_size * dp_size`.
    pub fn pp_chains(&self) -> Vec<Vec<u32>> {
        let mut chains = Vec::new();
        for dp_i in 0..self.dp_size {
            for tp_i in 0..self.tp_size {
                chains.push(
                    (0..self.pp_size)
                        .map(|stage| self.rank(stage, dp_i, tp_i))
                        .collect(),
                );
            }
        }
        chains
    }

    /// Adjacent-stage send/recv pairs along every pipeline chain.
    pub fn pp_pairs(&self) -> Vec<Vec<u32>> {
        let mut pairs = Vec::new();
        for chain in self.pp_chains() {
            for window in chain.windows(2) {
                pairs.push(window.to_vec());
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers_world_once(groups: &[Vec<u32>], world: usize) -> bool {
        let mut seen = vec![0usize; world];
        for group in groups {
            for &rank in group {
                seen[rank as usize] += 1;
            }
        }
        seen.iter().all(|&n| n == 1)
    }

    #[test]
    fn zero_axis_is_rejected() {
        assert!(SimTopology::new(4, 0, 2).is_err());
        assert!(SimTopology::new(1, 1, 1).is_ok());
    }

    #[test]
    fn tensor_groups_are_consecutive_blocks() {
        let topo = SimTopology::new(4, 2, 2).unwrap();
        let tp = topo.tp_groups();
        assert_eq!(tp[0], vec![0, 1, 2, 3]);
        assert_eq!(tp[1], vec![4, 5, 6, 7]);
        assert_eq!(tp[2], vec![8, 9, 10, 11]);
        assert_eq!(tp[3], vec![12, 13, 14, 15]);
    }

    #[test]
    fn data_groups_stride_by_tensor_size_within_a_stage() {
        let topo = SimTopology::new(4, 2, 2).unwrap();
        let dp = topo.dp_groups();
        assert_eq!(dp[0], vec![0, 4]);
        assert_eq!(dp[3], vec![3, 7]);
        assert_eq!(dp[4], vec![8, 12], "second stage starts its own data groups");
    }

    #[test]
    fn pipeline_chains_stride_by_stage_span() {
        let topo = SimTopology::new(4, 2, 2).unwrap();
        let chains = topo.pp_chains();
        assert_eq!(chains[0], vec![0, 8]);
        assert_eq!(chains[7], vec![7, 15]);
        assert_eq!(topo.pp_pairs().len(), 8, "one pair per chain for two stages");
    }

    #[test]
    fn every_axis_partitions_the_world() {
        for (tp, dp, pp) in [(4, 2, 2), (2, 3, 2), (1, 4, 2), (8, 1, 1)] {
            let topo = SimTopology::new(tp, dp, pp).unwrap();
            let world = topo.world_size();
            assert!(
                covers_world_once(&topo.tp_groups(), world),
                "tp axis must partition {}x{}x{}",
                tp,
                dp,
                pp
            );
            assert!(covers_world_once(&topo.dp_groups(), world));
            assert!(covers_world_once(&topo.pp_chains(), world));
        }
    }

    #[test]
    fn deeper_pipelines_pair_every_adjacent_stage() {
        let topo = SimTopology::new(2, 1, 4).unwrap();
        let pairs = topo.pp_pairs();
        // Two chains, three adjacent pairs each.
        assert_eq!(pairs.len(), 6);
        assert_eq!(pairs[0], vec![0, 2]);
        assert_eq!(pairs[1], vec![2, 4]);
        assert_eq!(pairs[2], vec![4, 6]);
    }
}
