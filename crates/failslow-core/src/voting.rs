//! Root-cause voting across detection rounds.
//!
//! A slow rank on a pipeline edge drags its neighbors with it: the
//! collective finishes late for everyone in the group. One round therefore
//! flags several ranks, and a single round can point at the wrong one.
//! Voting runs the same group through every derived metric round, scores
//! each rank by how consistently it was flagged, and only keeps ranks that
//! were flagged every time while a neighbor was flagged at least half the
//! time. Prior evidence, slow groups detected upstream or configured by the
//! operator, then narrows the candidates further.

use std::collections::BTreeMap;

use tracing::debug;

use crate::detect::{DetectionResult, Entity, MethodKind};

/// Votes over detection rounds for one communication group.
pub struct RootCauseVoter<'a> {
    /// Group members in topology order; neighbor support follows this order.
    pub group_ranks: &'a [u32],
    /// Rank groups known or detected to be slow; empty means no priors.
    pub priors: &'a [Vec<u32>],
}

impl RootCauseVoter<'_> {
    /// Fraction of rounds that flagged each rank, in group order.
    pub fn anomaly_scores(&self, rounds: &[DetectionResult]) -> Vec<(u32, f64)> {
        if rounds.is_empty() {
            return self.group_ranks.iter().map(|&r| (r, 0.0)).collect();
        }
        self.group_ranks
            .iter()
            .map(|&rank| {
                let hits = rounds
                    .iter()
                    .filter(|round| round.anomaly_devices.contains(&Entity::Rank(rank)))
                    .count();
                (rank, hits as f64 / rounds.len() as f64)
            })
            .collect()
    }

    /// Ranks flagged in every round with a half-flagged neighbor.
    fn candidates(&self, scores: &[(u32, f64)]) -> Vec<u32> {
        let mut out = Vec::new();
        for (idx, &(rank, score)) in scores.iter().enumerate() {
            if score < 1.0 {
                continue;
            }
            let prev_support = idx > 0 && scores[idx - 1].1 >= 0.5;
            let next_support = idx + 1 < scores.len() && scores[idx + 1].1 >= 0.5;
            if prev_support || next_support {
                out.push(rank);
            }
        }
        out
    }

    /// Keeps candidates that belong to a prior slow group. When the
    /// intersection is empty the original candidates stand; priors refine,
    /// they never veto outright.
    fn apply_priors(&self, candidates: Vec<u32>) -> Vec<u32> {
        if self.priors.is_empty() {
            return candidates;
        }
        let filtered: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|rank| self.priors.iter().any(|group| group.contains(rank)))
            .collect();
        if filtered.is_empty() {
            candidates
        } else {
            filtered
        }
    }

    /// Full vote: scores, neighbor-supported candidates, prior refinement.
    pub fn vote(&self, rounds: &[DetectionResult]) -> Vec<u32> {
        let scores = self.anomaly_scores(rounds);
        let candidates = self.candidates(&scores);
        debug!(?scores, ?candidates, "voted over detection rounds");
        self.apply_priors(candidates)
    }
}

/// Collapses per-reducer rounds into one result keyed by the base metric.
///
/// Labels are OR-merged per rank, the first round contributes timestamps,
/// provenance and series data, and the voted candidates become the
/// anomaly devices. Returns `None` only when there are no rounds at all.
pub fn merge_rounds(rounds: &[DetectionResult], candidates: &[u32]) -> Option<DetectionResult> {
    let first = rounds.first()?;
    let base = base_metric(&first.metric_name).to_string();

    let mut merged = DetectionResult::empty(&base);
    merged.group_data = first.group_data.clone();
    merged.anomaly_devices = candidates.iter().map(|&r| Entity::Rank(r)).collect();

    for round in rounds {
        for (entity, locations) in &round.anomaly_locations {
            for (metric, location) in locations {
                let key = base_metric(metric).to_string();
                let slot = merged
                    .anomaly_locations
                    .entry(entity.clone())
                    .or_default()
                    .entry(key.clone());
                use std::collections::btree_map::Entry;
                match slot {
                    Entry::Vacant(v) => {
                        v.insert(location.clone());
                    }
                    Entry::Occupied(mut o) => {
                        let existing = o.get_mut();
                        let common = existing.labels.len().min(location.labels.len());
                        for i in 0..common {
                            existing.labels[i] = existing.labels[i] || location.labels[i];
                        }
                    }
                }
                merged
                    .method_types
                    .entry(entity.clone())
                    .or_default()
                    .entry(key)
                    .or_insert_with(|| {
                        round
                            .method_types
                            .get(entity)
                            .and_then(|m| m.get(metric))
                            .copied()
                            .unwrap_or(MethodKind::Time)
                    });
            }
        }
    }

    Some(merged)
}

fn base_metric(metric: &str) -> &str {
    metric.split('!').next().unwrap_or(metric)
}

/// Collects the rank groups of entities flagged by a group-level result,
/// for use as voting priors.
pub fn slow_group_priors(group_result: &DetectionResult) -> Vec<Vec<u32>> {
    group_result
        .anomaly_devices
        .iter()
        .filter_map(|entity| entity.group_ranks().map(<[u32]>::to_vec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AnomalyLocation;

    fn round(metric: &str, flagged: &[u32], all: &[u32], labels: &[bool]) -> DetectionResult {
        let mut result = DetectionResult::empty(metric);
        for &rank in all {
            let active = flagged.contains(&rank);
            let loc = AnomalyLocation {
                timestamps: (0..labels.len()).map(|i| i as f64).collect(),
                labels: labels.iter().map(|&l| l && active).collect(),
            };
            result
                .anomaly_locations
                .entry(Entity::Rank(rank))
                .or_default()
                .insert(metric.to_string(), loc);
            result
                .method_types
                .entry(Entity::Rank(rank))
                .or_default()
                .insert(metric.to_string(), MethodKind::Space);
            if active {
                result.anomaly_devices.push(Entity::Rank(rank));
            }
        }
        result
    }

    fn rounds_with_scores() -> Vec<DetectionResult> {
        // Over ranks [0, 1, 2, 3]: rank 0 flagged 3/3, rank 1 flagged 2/3,
        // rank 2 flagged 1/3, rank 3 never.
        let all = [0, 1, 2, 3];
        let labels = [true, true, true];
        vec![
            round("m!mean", &[0, 1, 2], &all, &labels),
            round("m!percentile_q-90", &[0, 1], &all, &labels),
            round("m!max", &[0], &all, &labels),
        ]
    }

    #[test]
    fn scores_follow_group_order() {
        let voter = RootCauseVoter {
            group_ranks: &[0, 1, 2, 3],
            priors: &[],
        };
        let scores = voter.anomaly_scores(&rounds_with_scores());
        let values: Vec<f64> = scores.iter().map(|(_, s)| *s).collect();
        assert!((values[0] - 1.0).abs() < 1e-9);
        assert!((values[1] - 2.0 / 3.0).abs() < 1e-9);
        assert!((values[2] - 1.0 / 3.0).abs() < 1e-9);
        assert!(values[3].abs() < 1e-9);
    }

    #[test]
    fn candidate_needs_perfect_score_and_neighbor_support() {
        let voter = RootCauseVoter {
            group_ranks: &[0, 1, 2, 3],
            priors: &[],
        };
        assert_eq!(voter.vote(&rounds_with_scores()), vec![0]);
    }

    #[test]
    fn neighbor_at_two_thirds_backs_the_unanimous_rank() {
        let all = [5, 6, 7];
        let labels = [true];
        let rounds = vec![
            round("m!mean", &[6, 7], &all, &labels),
            round("m!percentile_q-90", &[6], &all, &labels),
            round("m!max", &[6, 7], &all, &labels),
        ];
        let voter = RootCauseVoter {
            group_ranks: &[5, 6, 7],
            priors: &[],
        };

        let scores = voter.anomaly_scores(&rounds);
        assert!(scores[0].1.abs() < 1e-9);
        assert!((scores[1].1 - 1.0).abs() < 1e-9);
        assert!((scores[2].1 - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(voter.vote(&rounds), vec![6]);
    }

    #[test]
    fn perfect_score_without_neighbor_support_is_rejected() {
        let all = [0, 1, 2];
        let labels = [true];
        let rounds = vec![
            round("m!mean", &[0, 2], &all, &labels),
            round("m!max", &[0, 2], &all, &labels),
        ];
        let voter = RootCauseVoter {
            group_ranks: &[0, 1, 2],
            priors: &[],
        };
        assert!(
            voter.vote(&rounds).is_empty(),
            "isolated unanimity with silent neighbors is not a root cause"
        );
    }

    #[test]
    fn both_flagged_neighbors_yield_one_entry_each() {
        let all = [4, 5];
        let labels = [true];
        let rounds = vec![round("m", &[4, 5], &all, &labels)];
        let voter = RootCauseVoter {
            group_ranks: &[4, 5],
            priors: &[],
        };
        assert_eq!(voter.vote(&rounds), vec![4, 5]);
    }

    #[test]
    fn priors_refine_but_never_veto() {
        let all = [4, 5];
        let labels = [true];
        let rounds = vec![round("m", &[4, 5], &all, &labels)];

        let priors = vec![vec![5, 6]];
        let voter = RootCauseVoter {
            group_ranks: &[4, 5],
            priors: &priors,
        };
        assert_eq!(voter.vote(&rounds), vec![5], "prior membership picks the root");

        let unrelated = vec![vec![30, 31]];
        let voter = RootCauseVoter {
            group_ranks: &[4, 5],
            priors: &unrelated,
        };
        assert_eq!(
            voter.vote(&rounds),
            vec![4, 5],
            "an empty intersection keeps the original candidates"
        );
    }

    #[test]
    fn merge_strips_derived_suffixes_and_ors_labels() {
        let all = [0, 1];
        let a = round("m!mean", &[0], &all, &[true, false, false]);
        let b = round("m!percentile_q-90", &[0], &all, &[false, true, false]);
        let merged = merge_rounds(&[a, b], &[0]).unwrap();

        assert_eq!(merged.metric_name, "m");
        assert_eq!(merged.anomaly_devices, vec![Entity::Rank(0)]);
        let loc = &merged.anomaly_locations[&Entity::Rank(0)]["m"];
        assert_eq!(loc.labels, vec![true, true, false]);
        assert_eq!(merged.method_types[&Entity::Rank(0)]["m"], MethodKind::Space);
    }

    #[test]
    fn single_round_merges_naturally() {
        let all = [0, 1];
        let only = round("m", &[1], &all, &[true]);
        let merged = merge_rounds(std::slice::from_ref(&only), &[1]).unwrap();
        assert_eq!(merged.anomaly_devices, vec![Entity::Rank(1)]);
        assert!(merge_rounds(&[], &[1]).is_none());
    }

    #[test]
    fn group_entities_become_priors() {
        let mut result = DetectionResult::empty("HcclAllGather");
        result.anomaly_devices.push(Entity::Group(vec![6, 7]));
        result.anomaly_devices.push(Entity::Rank(2));
        assert_eq!(slow_group_priors(&result), vec![vec![6, 7]]);
    }
}
