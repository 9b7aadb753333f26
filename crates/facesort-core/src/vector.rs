//! Vector math over plain `f32` slices — normalization and cosine similarity.
//!
//! Every stored signature is kept unit-length, so cosine similarity reduces
//! to a dot product of already-normalized vectors.

/// Added to the norm before dividing so a zero vector normalizes to zero
/// instead of producing NaN.
pub const NORM_EPSILON: f32 = 1e-12;

/// Score assigned to a degenerate (NaN) comparison. It is the lowest
/// possible cosine similarity, so a corrupt vector never wins a match.
pub const MIN_SIMILARITY: f32 = -1.0;

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length: `v / (‖v‖ + ε)`.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v) + NORM_EPSILON;
    v.iter().map(|x| x / norm).collect()
}

/// Cosine similarity of two normalized vectors, in [-1, 1].
///
/// NaN results are coerced to [`MIN_SIMILARITY`].
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    if dot.is_nan() {
        MIN_SIMILARITY
    } else {
        dot
    }
}

/// Euclidean distance between two vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Component-wise mean of a set of equal-length vectors.
///
/// Returns `None` for an empty set.
pub fn mean(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut acc = vec![0.0f32; first.len()];
    for v in vectors {
        for (a, x) in acc.iter_mut().zip(v.iter()) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in &mut acc {
        *a /= n;
    }
    Some(acc)
}

/// A vector is usable as a centroid if it is non-empty and fully finite.
pub fn is_well_formed(v: &[f32]) -> bool {
    !v.is_empty() && v.iter().all(|x| x.is_finite())
}
