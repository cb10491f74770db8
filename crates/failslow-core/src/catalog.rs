//! Discovery of communication groups from per-rank operator tables.
//!
//! Every rank only sees its own operator stream, so a group is assembled
//! incrementally: the first rank that mentions a group contributes its
//! operator histogram, later ranks only extend the member list. Groups whose
//! first occurrence sits at slot zero of a rank's table are ignored; that
//! slot is the framework's job-wide time-sync broadcast and would otherwise
//! masquerade as a group spanning every rank.

use std::collections::BTreeMap;

use smallvec::{SmallVec, smallvec};
use tracing::debug;

use crate::trace::{OpRecord, TraceStore};

/// One discovered communication group.
///
/// `ops` keeps the operator histogram of the first rank that mentioned the
/// group, in first-observed order.
#[derive(Debug, Clone)]
pub struct CommGroup {
    pub name: String,
    pub ranks: SmallVec<[u32; 8]>,
    pub ops: Vec<(String, u64)>,
}

impl CommGroup {
    pub fn has_op(&self, op: &str) -> bool {
        self.ops.iter().any(|(name, _)| name == op)
    }

    pub fn sorted_ranks(&self) -> Vec<u32> {
        let mut ranks: Vec<u32> = self.ranks.to_vec();
        ranks.sort_unstable();
        ranks
    }

    fn distinct_ops(&self) -> usize {
        self.ops.len()
    }

    fn first_op_count(&self) -> u64 {
        self.ops.first().map(|(_, count)| *count).unwrap_or(0)
    }
}

/// All communication groups observed in a job, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct CommGroupCatalog {
    groups: Vec<CommGroup>,
}

struct GroupSketch {
    name: String,
    first_index: usize,
    ops: Vec<(String, u64)>,
}

/// Summarizes one rank's device lane into per-group sketches.
fn sketch_rank(records: &[OpRecord]) -> Vec<GroupSketch> {
    let mut sketches: Vec<GroupSketch> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for (slot, rec) in records.iter().enumerate() {
        let at = *index.entry(rec.group.clone()).or_insert_with(|| {
            sketches.push(GroupSketch {
                name: rec.group.clone(),
                first_index: slot,
                ops: Vec::new(),
            });
            sketches.len() - 1
        });
        let sketch = &mut sketches[at];
        match sketch.ops.iter_mut().find(|(op, _)| op == &rec.op) {
            Some((_, count)) => *count += 1,
            None => sketch.ops.push((rec.op.clone(), 1)),
        }
    }
    sketches
}

impl CommGroupCatalog {
    /// Scans every rank's device lane and assembles the catalog.
    pub fn scan(store: &TraceStore) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut by_name: BTreeMap<String, CommGroup> = BTreeMap::new();

        for rank in store.ranks() {
            let Some(records) = store.device_lane(rank) else {
                continue;
            };
            for sketch in sketch_rank(records) {
                if sketch.first_index == 0 {
                    debug!(
                        rank,
                        group = %sketch.name,
                        "skipping slot-zero group, treated as job-wide time sync"
                    );
                    continue;
                }
                match by_name.get_mut(&sketch.name) {
                    Some(group) => {
                        if !group.ranks.contains(&rank) {
                            group.ranks.push(rank);
                        }
                    }
                    None => {
                        order.push(sketch.name.clone());
                        by_name.insert(
                            sketch.name.clone(),
                            CommGroup {
                                name: sketch.name,
                                ranks: smallvec![rank],
                                ops: sketch.ops,
                            },
                        );
                    }
                }
            }
        }

        // Distinct group names can describe the same rank set, typically a
        // communicator that was torn down and rebuilt. Keep the richer one:
        // more distinct operators, then the higher count of its lead operator.
        let mut groups: Vec<CommGroup> = Vec::new();
        for name in order {
            let Some(candidate) = by_name.remove(&name) else {
                continue;
            };
            let key = candidate.sorted_ranks();
            match groups.iter_mut().find(|g| g.sorted_ranks() == key) {
                Some(existing) => {
                    let richer = candidate.distinct_ops() > existing.distinct_ops()
                        || (candidate.distinct_ops() == existing.distinct_ops()
                            && candidate.first_op_count() > existing.first_op_count());
                    if richer {
                        *existing = candidate;
                    }
                }
                None => groups.push(candidate),
            }
        }

        CommGroupCatalog { groups }
    }

    /// Wraps an already assembled group list, e.g. from a config override.
    pub fn from_groups(groups: Vec<CommGroup>) -> Self {
        CommGroupCatalog { groups }
    }

    pub fn groups(&self) -> &[CommGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
