//! Assignment of cluster centroids to known persons.
//!
//! Every person is scored by its best-matching prototype. The top person is
//! accepted only if it clears both the (possibly raised) threshold and the
//! top-2 margin; otherwise a new person is minted. A near tie between two
//! persons therefore yields a new identity rather than a merge.

use crate::config::MatchConfig;
use crate::prototypes;
use crate::types::{ClusterCandidate, ClusterId, PersonRecord, Registry};
use crate::vector::{is_well_formed, normalize, similarity, MIN_SIMILARITY};
use serde::Serialize;
use std::collections::BTreeMap;

/// Best score of one person against a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonScore {
    /// Position of the person in `Registry::persons`.
    pub index: usize,
    pub number: u32,
    pub score: f32,
}

/// How a cluster ended up with its person number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Matched an existing person.
    Matched { score: f32, runner_up: f32 },
    /// A new person was minted for this cluster.
    Created,
}

/// Final decision for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub cluster_id: ClusterId,
    pub person: u32,
    #[serde(flatten)]
    pub outcome: MatchOutcome,
}

/// Result of matching one batch of candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchReport {
    /// One entry per assigned cluster, in input order.
    pub assignments: Vec<Assignment>,
    /// Clusters dropped because their centroid was missing or malformed,
    /// or because no person number was left to mint.
    pub skipped: Vec<ClusterId>,
}

impl MatchReport {
    /// `cluster_id → person number` for every assigned cluster.
    pub fn assignment_map(&self) -> BTreeMap<ClusterId, u32> {
        self.assignments
            .iter()
            .map(|a| (a.cluster_id.clone(), a.person))
            .collect()
    }

    pub fn matched_count(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| matches!(a.outcome, MatchOutcome::Matched { .. }))
            .count()
    }

    /// Person numbers minted during this batch, in allocation order.
    pub fn created(&self) -> Vec<u32> {
        self.assignments
            .iter()
            .filter(|a| a.outcome == MatchOutcome::Created)
            .map(|a| a.person)
            .collect()
    }
}

/// Score every person with a signature against a normalized query.
///
/// Sorted best first; equal scores keep registry order.
pub fn score_persons(registry: &Registry, query: &[f32]) -> Vec<PersonScore> {
    let mut scores: Vec<PersonScore> = registry
        .persons
        .iter()
        .enumerate()
        .filter_map(|(index, p)| {
            best_score(p, query).map(|score| PersonScore {
                index,
                number: p.number,
                score,
            })
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores
}

/// A person's score is its best prototype, not an average across poses.
fn best_score(person: &PersonRecord, query: &[f32]) -> Option<f32> {
    person
        .signatures()
        .iter()
        .map(|sig| similarity(&normalize(sig), query))
        .reduce(f32::max)
}

/// Threshold-and-margin matcher over a person registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityMatcher {
    config: MatchConfig,
}

impl SimilarityMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self {
            config: config.clamped(),
        }
    }

    /// Decide whether a normalized query matches an existing person.
    ///
    /// Returns the winner's index in `registry.persons` with its score and
    /// the runner-up score, or `None` when a new person should be minted.
    pub fn decide(&self, registry: &Registry, query: &[f32]) -> Option<(usize, f32, f32)> {
        let scores = score_persons(registry, query);
        let top = scores.first()?;
        let runner_up = scores.get(1).map_or(MIN_SIMILARITY, |s| s.score);

        let floor = registry
            .persons
            .get(top.index)
            .and_then(|p| p.custom_threshold)
            .unwrap_or(f32::NEG_INFINITY);
        let threshold = self.config.match_threshold.max(floor);

        let accepted = top.score >= threshold && top.score - runner_up >= self.config.top2_margin;
        tracing::debug!(
            person = top.number,
            score = top.score,
            runner_up,
            threshold,
            accepted,
            "best candidate"
        );
        accepted.then_some((top.index, top.score, runner_up))
    }

    /// Assign each candidate, in order, to a person in `registry`.
    ///
    /// Matched persons get the observation folded in; unmatched clusters mint
    /// a person numbered above both `disk_max` (highest person folder on disk)
    /// and every number already in the registry. Once `u32::MAX` is taken,
    /// unmatched clusters are skipped instead. The registry is live
    /// throughout, so a later candidate may match a person minted earlier in
    /// the same batch.
    pub fn assign(
        &self,
        registry: &mut Registry,
        candidates: &[ClusterCandidate],
        disk_max: u32,
    ) -> MatchReport {
        let mut report = MatchReport::default();
        let mut running_max = disk_max.max(registry.max_number());

        for candidate in candidates {
            let Some(raw) = candidate
                .centroid
                .as_deref()
                .filter(|c| is_usable(c, registry.dimension()))
            else {
                tracing::warn!(cluster = %candidate.id, "skipping cluster with missing or malformed centroid");
                report.skipped.push(candidate.id.clone());
                continue;
            };
            let query = normalize(raw);

            let decision = if registry.has_signatures() {
                self.decide(registry, &query)
            } else {
                None
            };

            let assignment = match decision {
                Some((index, score, runner_up)) => {
                    let person = &mut registry.persons[index];
                    prototypes::update(person, &query, self.config.k_max, self.config.ema_alpha);
                    Assignment {
                        cluster_id: candidate.id.clone(),
                        person: person.number,
                        outcome: MatchOutcome::Matched { score, runner_up },
                    }
                }
                None => {
                    let Some(number) = running_max.checked_add(1) else {
                        tracing::warn!(
                            cluster = %candidate.id,
                            "skipping cluster: person numbers exhausted"
                        );
                        report.skipped.push(candidate.id.clone());
                        continue;
                    };
                    running_max = number;
                    registry.persons.push(PersonRecord::seeded(running_max, query));
                    Assignment {
                        cluster_id: candidate.id.clone(),
                        person: running_max,
                        outcome: MatchOutcome::Created,
                    }
                }
            };
            tracing::debug!(
                cluster = %assignment.cluster_id,
                person = assignment.person,
                outcome = ?assignment.outcome,
                "cluster assigned"
            );
            report.assignments.push(assignment);
        }

        tracing::info!(
            candidates = candidates.len(),
            matched = report.matched_count(),
            created = report.created().len(),
            skipped = report.skipped.len(),
            persons = registry.len(),
            "batch matched"
        );
        report
    }
}

fn is_usable(centroid: &[f32], dimension: Option<usize>) -> bool {
    is_well_formed(centroid) && dimension.map_or(true, |d| d == centroid.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(number: u32, proto: Vec<f32>) -> PersonRecord {
        PersonRecord::seeded(number, normalize(&proto))
    }

    fn candidate(id: &str, centroid: Vec<f32>) -> ClusterCandidate {
        ClusterCandidate {
            id: ClusterId::from(id),
            centroid: Some(centroid),
            image_paths: vec![format!("{id}.jpg")],
        }
    }

    fn config(threshold: f32, margin: f32) -> MatchConfig {
        MatchConfig {
            match_threshold: threshold,
            top2_margin: margin,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_registry_mints_person_one() {
        let mut reg = Registry::new();
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(&mut reg, &[candidate("c1", vec![3.0, 4.0])], 0);

        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.assignments[0].person, 1);
        assert_eq!(report.assignments[0].outcome, MatchOutcome::Created);
        let p = reg.get(1).unwrap();
        assert_eq!(p.observation_count, 1);
        assert_eq!(p.prototypes.len(), 1);
        assert!((p.prototypes[0][0] - 0.6).abs() < 1e-6);
        assert!((p.prototypes[0][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_single_person_confident_match() {
        let mut reg = Registry::new();
        reg.persons.push(person(1, vec![1.0, 0.0]));
        let matcher = SimilarityMatcher::new(config(0.52, 0.08));
        let report = matcher.assign(&mut reg, &[candidate("c", vec![0.95, 0.31])], 1);

        assert_eq!(report.assignment_map().get(&ClusterId::from("c")), Some(&1));
        match report.assignments[0].outcome {
            MatchOutcome::Matched { score, runner_up } => {
                assert!((score - 0.95).abs() < 0.01);
                assert_eq!(runner_up, MIN_SIMILARITY);
            }
            MatchOutcome::Created => panic!("expected a match"),
        }
        let p = reg.get(1).unwrap();
        assert_eq!(p.observation_count, 2);
        assert_eq!(p.prototypes.len(), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_ambiguous_pair_mints_new_person() {
        let mut reg = Registry::new();
        reg.persons.push(person(1, vec![1.0, 0.0]));
        reg.persons.push(person(2, vec![0.0, 1.0]));
        let matcher = SimilarityMatcher::new(config(0.52, 0.08));
        let report = matcher.assign(&mut reg, &[candidate("c", vec![0.70, 0.68])], 2);

        assert_eq!(report.assignments[0].person, 3);
        assert_eq!(report.assignments[0].outcome, MatchOutcome::Created);
        assert_eq!(reg.get(1).unwrap().observation_count, 1);
        assert_eq!(reg.get(2).unwrap().observation_count, 1);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_margin_law_holds_across_gaps() {
        // Both persons clear the threshold but sit close to the query axis.
        for gap_deg in [0.5f32, 1.0, 2.0, 3.0] {
            let a = (45.0f32 - gap_deg).to_radians();
            let b = (45.0f32 + 2.0 * gap_deg).to_radians();
            let mut reg = Registry::new();
            reg.persons.push(person(1, vec![a.cos(), a.sin()]));
            reg.persons.push(person(2, vec![b.cos(), b.sin()]));
            let query = normalize(&[1.0, 1.0]);
            let scores = score_persons(&reg, &query);
            assert!(scores[0].score >= 0.52);
            assert!(scores[0].score - scores[1].score < 0.08);

            let matcher = SimilarityMatcher::new(config(0.52, 0.08));
            let report = matcher.assign(&mut reg, &[candidate("x", vec![1.0, 1.0])], 0);
            assert_eq!(report.assignments[0].outcome, MatchOutcome::Created);
        }
    }

    #[test]
    fn test_custom_threshold_only_raises_bar() {
        let mut reg = Registry::new();
        let mut p = person(1, vec![1.0, 0.0]);
        p.custom_threshold = Some(0.99);
        reg.persons.push(p);
        let matcher = SimilarityMatcher::new(config(0.52, 0.08));
        let report = matcher.assign(&mut reg, &[candidate("c", vec![0.95, 0.31])], 0);
        assert_eq!(report.assignments[0].outcome, MatchOutcome::Created);

        // A custom threshold below the global one does not lower it.
        let mut reg = Registry::new();
        let mut p = person(1, vec![1.0, 0.0]);
        p.custom_threshold = Some(0.1);
        reg.persons.push(p);
        let matcher = SimilarityMatcher::new(config(0.9, 0.0));
        let report = matcher.assign(&mut reg, &[candidate("c", vec![0.8, 0.6])], 0);
        assert_eq!(report.assignments[0].outcome, MatchOutcome::Created);
    }

    #[test]
    fn test_match_through_any_prototype() {
        let mut reg = Registry::new();
        let mut p = person(1, vec![1.0, 0.0, 0.0]);
        p.prototypes.push(vec![0.0, 0.0, 1.0]);
        reg.persons.push(p);
        reg.persons.push(person(2, vec![0.0, 1.0, 0.0]));
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(&mut reg, &[candidate("c", vec![0.05, 0.0, 1.0])], 2);
        assert_eq!(report.assignments[0].person, 1);
    }

    #[test]
    fn test_running_average_used_without_prototypes() {
        let mut reg = Registry::new();
        let mut p = person(4, vec![1.0, 0.0]);
        p.prototypes.clear();
        reg.persons.push(p);
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(&mut reg, &[candidate("c", vec![1.0, 0.01])], 0);
        assert_eq!(report.assignments[0].person, 4);
        assert_eq!(reg.get(4).unwrap().prototypes.len(), 1);
    }

    #[test]
    fn test_malformed_candidates_skipped() {
        let mut reg = Registry::new();
        reg.persons.push(person(1, vec![1.0, 0.0]));
        let before = reg.clone();
        let candidates = vec![
            ClusterCandidate { id: "none".into(), centroid: None, image_paths: vec![] },
            candidate("empty", vec![]),
            candidate("nan", vec![f32::NAN, 1.0]),
            candidate("dim", vec![1.0, 0.0, 0.0]),
        ];
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(&mut reg, &candidates, 1);
        assert!(report.assignments.is_empty());
        assert_eq!(report.skipped.len(), 4);
        assert_eq!(reg, before);
    }

    #[test]
    fn test_same_batch_can_match_new_person() {
        let mut reg = Registry::new();
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(
            &mut reg,
            &[candidate("a", vec![1.0, 0.0]), candidate("b", vec![0.98, 0.05])],
            0,
        );
        assert_eq!(report.assignments[0].person, 1);
        assert_eq!(report.assignments[1].person, 1);
        assert!(matches!(report.assignments[1].outcome, MatchOutcome::Matched { .. }));
        assert_eq!(reg.get(1).unwrap().observation_count, 2);
    }

    #[test]
    fn test_numbers_start_above_disk_and_registry() {
        let mut reg = Registry::new();
        reg.persons.push(person(5, vec![1.0, 0.0]));
        let matcher = SimilarityMatcher::new(MatchConfig::default());

        let report = matcher.assign(&mut reg, &[candidate("a", vec![0.0, 1.0])], 3);
        assert_eq!(report.assignments[0].person, 6);

        let report = matcher.assign(&mut reg, &[candidate("b", vec![-1.0, 0.0])], 9);
        assert_eq!(report.assignments[0].person, 10);
    }

    #[test]
    fn test_monotonic_numbering_across_batches() {
        let mut reg = Registry::new();
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let mut seen = Vec::new();
        for batch in 0..4 {
            let angle = (batch as f32 * 90.0).to_radians();
            let report = matcher.assign(
                &mut reg,
                &[candidate(&format!("c{batch}"), vec![angle.cos(), angle.sin()])],
                0,
            );
            seen.extend(report.created());
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_exhausted_numbers_skip_instead_of_wrapping() {
        let mut reg = Registry::new();
        reg.persons.push(person(1, vec![1.0, 0.0]));
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(
            &mut reg,
            &[candidate("new", vec![0.0, 1.0]), candidate("known", vec![1.0, 0.02])],
            u32::MAX,
        );

        assert_eq!(report.skipped, vec![ClusterId::from("new")]);
        assert_eq!(report.assignment_map().get(&ClusterId::from("known")), Some(&1));
        assert_eq!(reg.len(), 1);
        assert!(reg.persons.iter().all(|p| p.number > 0));
    }

    #[test]
    fn test_exhausted_numbers_from_registry_max() {
        let mut reg = Registry::new();
        reg.persons.push(person(u32::MAX, vec![1.0, 0.0]));
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let report = matcher.assign(&mut reg, &[candidate("c", vec![-1.0, 0.0])], 0);
        assert!(report.assignments.is_empty());
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_duplicate_numbers_update_the_scoring_record() {
        // A hand-edited registry may repeat a number; the record that scored
        // is the one that absorbs the observation.
        let mut reg = Registry::new();
        reg.persons.push(person(3, vec![0.0, 1.0]));
        reg.persons.push(person(3, vec![1.0, 0.0]));
        let matcher = SimilarityMatcher::new(MatchConfig {
            top2_margin: 0.0,
            ..Default::default()
        });
        let report = matcher.assign(&mut reg, &[candidate("c", vec![1.0, 0.05])], 3);

        assert_eq!(report.assignments[0].person, 3);
        assert_eq!(reg.persons[0].observation_count, 1);
        assert_eq!(reg.persons[0].prototypes.len(), 1);
        assert_eq!(reg.persons[1].observation_count, 2);
        assert_eq!(reg.persons[1].prototypes.len(), 2);
    }

    #[test]
    fn test_scores_carry_registry_index() {
        let mut reg = Registry::new();
        reg.persons.push(person(9, vec![0.0, 1.0]));
        reg.persons.push(person(2, vec![1.0, 0.0]));
        let scores = score_persons(&reg, &[1.0, 0.0]);
        assert_eq!(scores[0].index, 1);
        assert_eq!(scores[0].number, 2);
        assert_eq!(scores[1].index, 0);
    }

    #[test]
    fn test_deterministic_assignments() {
        let mut base = Registry::new();
        base.persons.push(person(1, vec![1.0, 0.0, 0.0]));
        base.persons.push(person(2, vec![0.0, 1.0, 0.0]));
        let candidates = vec![
            candidate("a", vec![0.9, 0.1, 0.0]),
            candidate("b", vec![0.0, 0.0, 1.0]),
            candidate("c", vec![0.1, 0.9, 0.2]),
            candidate("d", vec![0.0, 0.1, 0.95]),
        ];
        let matcher = SimilarityMatcher::new(MatchConfig::default());

        let mut r1 = base.clone();
        let mut r2 = base.clone();
        let a = matcher.assign(&mut r1, &candidates, 2);
        let b = matcher.assign(&mut r2, &candidates, 2);
        assert_eq!(a.assignment_map(), b.assignment_map());
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_prototypes_bounded_after_many_matches() {
        let mut reg = Registry::new();
        reg.persons.push(person(1, vec![1.0, 0.0, 0.0]));
        let matcher = SimilarityMatcher::new(MatchConfig::default());
        let candidates: Vec<_> = (0..30)
            .map(|i| {
                let t = i as f32 * 0.01;
                candidate(&i.to_string(), vec![1.0, t, -t])
            })
            .collect();
        matcher.assign(&mut reg, &candidates, 1);
        let p = reg.get(1).unwrap();
        assert_eq!(p.observation_count, 31);
        assert!(p.prototypes.len() <= MatchConfig::default().k_max);
    }
}
