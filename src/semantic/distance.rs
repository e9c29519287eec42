//! Pure numeric functions over embedding vectors.
//!
//! Every function that takes two vectors requires them to have the same
//! length; a mismatch is reported as [`DistanceError::InvalidArgument`]
//! instead of silently truncating to the shorter one.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Errors raised by the distance functions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DistanceError {
    #[error("Invalid argument: vector lengths differ ({left} vs {right})")]
    InvalidArgument { left: usize, right: usize },
}

/// Distance semantics used for scoring and for the backing-store index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFunction {
    Cosine,
    L2,
    InnerProduct,
}

impl Display for DistanceFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistanceFunction::Cosine => "cosine",
            DistanceFunction::L2 => "l2",
            DistanceFunction::InnerProduct => "inner_product",
        };
        write!(f, "{name}")
    }
}

fn check_lengths(a: &[f32], b: &[f32]) -> Result<(), DistanceError> {
    if a.len() != b.len() {
        return Err(DistanceError::InvalidArgument {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in [-1, 1].
///
/// Returns 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
    check_lengths(a, b)?;

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot(a, b) / (norm_a * norm_b))
}

/// Euclidean distance. Smaller is more similar.
pub fn l2_distance(a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
    check_lengths(a, b)?;

    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt())
}

/// Raw dot product. Larger is more similar.
///
/// pgvector's `<#>` operator reports the negated value; [`score`] follows that
/// orientation for the `distance` half of the pair.
pub fn inner_product(a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
    check_lengths(a, b)?;
    Ok(dot(a, b))
}

/// Scale `v` to unit length. Zero vectors are returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Compute the `(similarity, distance)` pair for one candidate.
///
/// - cosine: `distance = 1 - similarity`
/// - l2: `similarity = 1 / (1 + distance)`
/// - inner product: `distance = -similarity`
pub fn score(
    function: DistanceFunction,
    query: &[f32],
    candidate: &[f32],
) -> Result<(f32, f32), DistanceError> {
    match function {
        DistanceFunction::Cosine => {
            let similarity = cosine_similarity(query, candidate)?;
            Ok((similarity, 1.0 - similarity))
        }
        DistanceFunction::L2 => {
            let distance = l2_distance(query, candidate)?;
            Ok((1.0 / (1.0 + distance), distance))
        }
        DistanceFunction::InnerProduct => {
            let similarity = inner_product(query, candidate)?;
            Ok((similarity, -similarity))
        }
    }
}
