//! Parallelism topology reconstruction from communication groups.
//!
//! The operator mix of a group betrays which parallelism axis it serves:
//! point-to-point traffic only appears on pipeline edges, reduce-scatter
//! mixed with other collectives is the tensor-parallel signature, and a
//! bare all-reduce stream is data parallelism. Reconstruction classifies
//! every cataloged group, fills unclaimed axes with per-rank singletons,
//! and finally cross-checks the data-parallel axis against the job size,
//! regenerating it when the observed groups cannot be right.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::CommGroupCatalog;
use crate::trace::ops;

// ============================================================
//  RANK SET HELPERS
// ============================================================

/// True when both slices contain the same ranks, order ignored.
pub fn is_same_rank_set(a: &[u32], b: &[u32]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left = a.to_vec();
    let mut right = b.to_vec();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}

/// True when the ranks form one consecutive run, e.g. `[4, 5, 6, 7]`.
pub fn is_continuous(ranks: &[u32]) -> bool {
    let mut sorted = ranks.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).all(|pair| pair[1] == pair[0] + 1)
}

fn subset_of(a: &[u32], b: &[u32]) -> bool {
    a.iter().all(|rank| b.contains(rank))
}

// ============================================================
//  TOPOLOGY MAP
// ============================================================

/// Rank groups per parallelism axis.
///
/// Also the shape of the `hccl_domain` config override, which bypasses
/// reconstruction entirely when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyMap {
    #[serde(default)]
    pub tp: Vec<Vec<u32>>,
    #[serde(default)]
    pub dp: Vec<Vec<u32>>,
    #[serde(default)]
    pub pp: Vec<Vec<u32>>,
    #[serde(default)]
    pub ep: Vec<Vec<u32>>,
}

impl TopologyMap {
    pub fn is_empty(&self) -> bool {
        self.tp.is_empty() && self.dp.is_empty() && self.pp.is_empty() && self.ep.is_empty()
    }

    pub fn tp_size(&self) -> usize {
        self.tp.first().map_or(0, Vec::len)
    }

    pub fn dp_size(&self) -> usize {
        self.dp.first().map_or(0, Vec::len)
    }

    pub fn pp_size(&self) -> usize {
        self.pp.first().map_or(0, Vec::len)
    }
}

// ============================================================
//  RECONSTRUCTION
// ============================================================

/// Derives a [`TopologyMap`] from the cataloged groups of one job.
pub struct TopologyReconstructor<'a> {
    catalog: &'a CommGroupCatalog,
    ranks: &'a [u32],
}

/// Inserts a rank group into an axis, collapsing subset noise.
///
/// A new group already covered by an existing one is dropped; a new group
/// covering an existing one replaces the first such entry; otherwise it is
/// appended.
fn add_group_ranks(axis: &mut Vec<Vec<u32>>, new: Vec<u32>) {
    if axis.iter().any(|existing| subset_of(&new, existing)) {
        return;
    }
    if let Some(slot) = axis.iter().position(|existing| subset_of(existing, &new)) {
        axis[slot] = new;
        return;
    }
    axis.push(new);
}

impl<'a> TopologyReconstructor<'a> {
    /// `ranks` must be the sorted list of all ranks observed in the job.
    pub fn new(catalog: &'a CommGroupCatalog, ranks: &'a [u32]) -> Self {
        TopologyReconstructor { catalog, ranks }
    }

    pub fn reconstruct(&self) -> TopologyMap {
        let mut topo = TopologyMap::default();

        for group in self.catalog.groups() {
            let ranks = group.sorted_ranks();
            let op_names: Vec<&str> = group
                .ops
                .iter()
                .map(|(name, _)| name.as_str())
                .filter(|name| *name != ops::BROADCAST)
                .collect();
            if op_names.is_empty() {
                continue;
            }

            let p2p = [ops::SEND, ops::RECEIVE, ops::BATCH_SEND_RECV];
            if op_names.iter().any(|name| p2p.contains(name)) {
                add_group_ranks(&mut topo.pp, ranks);
            } else if op_names.contains(&ops::REDUCE_SCATTER) && op_names.len() > 1 {
                add_group_ranks(&mut topo.tp, ranks);
            } else if op_names == [ops::ALL_REDUCE] {
                add_group_ranks(&mut topo.dp, ranks);
            } else {
                debug!(
                    group = %group.name,
                    ops = ?op_names,
                    "operator mix matches no parallelism axis"
                );
            }
        }

        // Axes with no evidence degrade to per-rank singletons so sizes
        // stay well defined for the consistency check below.
        let singletons: Vec<Vec<u32>> = self.ranks.iter().map(|&r| vec![r]).collect();
        for axis in [&mut topo.tp, &mut topo.dp, &mut topo.pp, &mut topo.ep] {
            if axis.is_empty() {
                *axis = singletons.clone();
            }
        }

        self.reconcile_dp(&mut topo);
        topo
    }

    /// Validates the data-parallel axis against the job size and rebuilds
    /// it when the observed groups are incomplete or inconsistent.
    fn reconcile_dp(&self, topo: &mut TopologyMap) {
        let total = self.ranks.len();
        if total == 0 {
            warn!("no ranks observed, skipping data-parallel reconciliation");
            return;
        }
        let pp_size = topo.pp_size();
        let tp_size = topo.tp_size();
        if pp_size == 0 || tp_size == 0 {
            warn!(pp_size, tp_size, "pipeline or tensor axis missing, keeping observed dp groups");
            return;
        }
        let real_dp = total / pp_size / tp_size;
        if real_dp == 0 {
            warn!(
                total,
                pp_size, tp_size, "axis sizes exceed job size, keeping observed dp groups"
            );
            return;
        }

        let dp_size = topo.dp_size();
        let uniform = topo.dp.iter().all(|g| g.len() == dp_size);
        if uniform && dp_size == real_dp {
            return;
        }

        debug!(
            observed = dp_size,
            expected = real_dp,
            "data-parallel groups inconsistent with job size, regenerating"
        );
        // Ranks at the same tensor slot within one pipeline stage block form
        // a dp group; striding by tp size inside each stage keeps the axis a
        // partition of the job.
        let stage_span = tp_size * real_dp;
        let num_groups = total / real_dp;
        let mut rebuilt = Vec::with_capacity(num_groups);
        for g in 0..num_groups {
            let stage = g / tp_size;
            let offset = g % tp_size;
            let base = stage * stage_span + offset;
            let members: Vec<u32> = (0..real_dp)
                .filter_map(|k| self.ranks.get(base + k * tp_size).copied())
                .collect();
            rebuilt.push(members);
        }
        topo.dp = rebuilt;
    }
}
