//! Bounded, diversity-preserving maintenance of a person's prototype set.
//!
//! Each accepted observation is appended as a new prototype. Once the set
//! outgrows `k_max` it is reduced by greedy farthest-point selection, so the
//! kept poses stay spread out (lighting, angle) instead of collapsing onto
//! near-duplicates. A slow EMA tracks a single-vector summary alongside.

use crate::types::PersonRecord;
use crate::vector::{euclidean_distance, mean, normalize, similarity};

/// Fold one confirmed observation into `record`.
///
/// Appends the normalized observation, trims the prototype set back to
/// `k_max` if needed, moves the running average towards the observation
/// with weight `1 - ema_alpha`, and bumps the observation count.
pub fn update(record: &mut PersonRecord, observed: &[f32], k_max: usize, ema_alpha: f32) {
    let observed = normalize(observed);

    record.prototypes.push(observed.clone());
    if record.prototypes.len() > k_max {
        let before = record.prototypes.len();
        record.prototypes = select_diverse(std::mem::take(&mut record.prototypes), k_max);
        tracing::trace!(
            person = record.number,
            before,
            after = record.prototypes.len(),
            "prototype set reduced"
        );
    }

    let previous = record
        .running_average
        .as_deref()
        .or_else(|| record.prototypes.first().map(Vec::as_slice))
        .map(normalize)
        .unwrap_or_else(|| observed.clone());

    let blended: Vec<f32> = previous
        .iter()
        .zip(observed.iter())
        .map(|(p, o)| ema_alpha * p + (1.0 - ema_alpha) * o)
        .collect();
    record.running_average = Some(normalize(&blended));

    record.observation_count += 1;
}

/// Keep `k` mutually distant prototypes out of `prototypes`.
///
/// Seeds with the prototype farthest (Euclidean) from the set's mean, then
/// repeatedly adds the one whose minimum cosine distance to the kept set is
/// largest. Ties resolve to the lowest index. If candidates run out before
/// `k` are chosen, leftovers fill the remaining slots in index order. The
/// result always holds exactly `min(k, prototypes.len())` unit vectors.
pub fn select_diverse(prototypes: Vec<Vec<f32>>, k: usize) -> Vec<Vec<f32>> {
    let x: Vec<Vec<f32>> = prototypes.iter().map(|v| normalize(v)).collect();
    let target = k.min(x.len());
    if x.len() <= k {
        return x;
    }

    let Some(center) = mean(&x) else {
        return x;
    };

    let seed = argmax(x.iter().map(|v| euclidean_distance(v, &center)));
    let mut keep: Vec<usize> = seed.into_iter().collect();

    while keep.len() < target {
        let candidates = (0..x.len()).map(|i| {
            if keep.contains(&i) {
                f32::NEG_INFINITY
            } else {
                let nearest = keep
                    .iter()
                    .map(|&j| similarity(&x[i], &x[j]))
                    .fold(f32::NEG_INFINITY, f32::max);
                1.0 - nearest
            }
        });
        match argmax(candidates) {
            Some(i) if !keep.contains(&i) => keep.push(i),
            _ => break,
        }
    }

    fill_leftovers(&mut keep, x.len(), target);
    keep.into_iter().map(|i| x[i].clone()).collect()
}

/// Top `keep` up to `target` indices with unused ones from `0..available`,
/// in index order.
fn fill_leftovers(keep: &mut Vec<usize>, available: usize, target: usize) {
    for i in 0..available {
        if keep.len() >= target {
            break;
        }
        if !keep.contains(&i) {
            keep.push(i);
        }
    }
}

/// Index of the first maximal finite value. `NaN` and `-inf` never win.
fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.enumerate() {
        if v.is_nan() || v == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
