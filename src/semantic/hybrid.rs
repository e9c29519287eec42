//! Hybrid ranking: merges keyword hits and vector hits into one list.
//!
//! Two fusion modes are available:
//! - `Weighted`: `score = kw * keyword_score + vw * vector_score`, missing
//!   scores count as 0. Weights are used as given, never normalised.
//! - `ReciprocalRank`: weighted RRF over the two rank lists,
//!   `score = kw / (k + rank_kw) + vw / (k + rank_vec)`.
//!
//! Both sort by score descending with ties broken by ascending id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::semantic::lexical::KeywordHit;
use crate::semantic::record::{ContentId, Metadata, SearchResult};

/// RRF constant (standard value from literature).
/// Higher k reduces the impact of high-ranking items.
const RRF_K: f32 = 60.0;

pub const DEFAULT_KEYWORD_WEIGHT: f32 = 0.3;
pub const DEFAULT_VECTOR_WEIGHT: f32 = 0.7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    #[default]
    Weighted,
    ReciprocalRank,
}

/// One fused hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridResult {
    pub id: ContentId,
    pub score: f32,
    /// Raw keyword score (None if not in keyword results)
    pub keyword_score: Option<f32>,
    /// Raw vector similarity (None if not in vector results)
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl HybridResult {
    fn new(id: ContentId) -> Self {
        Self {
            id,
            score: 0.0,
            keyword_score: None,
            vector_score: None,
            metadata: None,
        }
    }
}

fn keep_max(slot: &mut Option<f32>, score: f32) {
    *slot = Some(slot.map_or(score, |current| current.max(score)));
}

/// Merge by the weighted sum of raw scores.
///
/// An id repeated inside one input keeps its best score.
pub fn combine(
    keyword_results: &[KeywordHit],
    vector_results: &[SearchResult],
    keyword_weight: f32,
    vector_weight: f32,
    limit: usize,
) -> Vec<HybridResult> {
    let mut merged: HashMap<ContentId, HybridResult> = HashMap::new();

    for hit in keyword_results {
        let entry = merged
            .entry(hit.id.clone())
            .or_insert_with(|| HybridResult::new(hit.id.clone()));
        keep_max(&mut entry.keyword_score, hit.text_score);
    }

    for hit in vector_results {
        let entry = merged
            .entry(hit.id.clone())
            .or_insert_with(|| HybridResult::new(hit.id.clone()));
        keep_max(&mut entry.vector_score, hit.similarity);
        if entry.metadata.is_none() {
            entry.metadata = hit.metadata.clone();
        }
    }

    for result in merged.values_mut() {
        result.score = keyword_weight * result.keyword_score.unwrap_or(0.0)
            + vector_weight * result.vector_score.unwrap_or(0.0);
    }

    finish(merged, limit)
}

/// Merge by weighted Reciprocal Rank Fusion over the input orders.
///
/// Inputs are expected best-first; only the first occurrence of an id in
/// each list counts.
pub fn rrf_fusion(
    keyword_results: &[KeywordHit],
    vector_results: &[SearchResult],
    keyword_weight: f32,
    vector_weight: f32,
    limit: usize,
) -> Vec<HybridResult> {
    let mut merged: HashMap<ContentId, HybridResult> = HashMap::new();

    let mut rank = 0usize;
    for hit in keyword_results {
        let entry = merged
            .entry(hit.id.clone())
            .or_insert_with(|| HybridResult::new(hit.id.clone()));
        if entry.keyword_score.is_some() {
            continue;
        }
        rank += 1;
        entry.keyword_score = Some(hit.text_score);
        entry.score += keyword_weight / (RRF_K + rank as f32);
    }

    let mut rank = 0usize;
    for hit in vector_results {
        let entry = merged
            .entry(hit.id.clone())
            .or_insert_with(|| HybridResult::new(hit.id.clone()));
        if entry.vector_score.is_some() {
            continue;
        }
        rank += 1;
        entry.vector_score = Some(hit.similarity);
        entry.metadata = hit.metadata.clone();
        entry.score += vector_weight / (RRF_K + rank as f32);
    }

    finish(merged, limit)
}

pub fn fuse(
    mode: FusionMode,
    keyword_results: &[KeywordHit],
    vector_results: &[SearchResult],
    keyword_weight: f32,
    vector_weight: f32,
    limit: usize,
) -> Vec<HybridResult> {
    match mode {
        FusionMode::Weighted => combine(
            keyword_results,
            vector_results,
            keyword_weight,
            vector_weight,
            limit,
        ),
        FusionMode::ReciprocalRank => rrf_fusion(
            keyword_results,
            vector_results,
            keyword_weight,
            vector_weight,
            limit,
        ),
    }
}

fn finish(merged: HashMap<ContentId, HybridResult>, limit: usize) -> Vec<HybridResult> {
    let mut results: Vec<HybridResult> = merged.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(id: &str, score: f32) -> KeywordHit {
        KeywordHit {
            id: id.into(),
            text_score: score,
        }
    }

    fn vec_hit(id: &str, similarity: f32) -> SearchResult {
        SearchResult {
            id: id.into(),
            similarity,
            distance: 1.0 - similarity,
            metadata: None,
        }
    }

    #[test]
    fn test_combine_empty_inputs() {
        assert!(combine(&[], &[], 0.3, 0.7, 10).is_empty());
    }

    #[test]
    fn test_combine_present_in_both_scores_highest() {
        let keyword = vec![kw("both", 1.0), kw("kw-only", 1.0)];
        let vector = vec![vec_hit("both", 1.0), vec_hit("vec-only", 1.0)];

        let results = combine(&keyword, &vector, 0.3, 0.7, 10);

        assert_eq!(results[0].id.as_str(), "both");
        assert!((results[0].score - 1.0).abs() < 1e-6);

        let vec_only = results.iter().find(|r| r.id.as_str() == "vec-only").unwrap();
        let kw_only = results.iter().find(|r| r.id.as_str() == "kw-only").unwrap();
        assert!((vec_only.score - 0.7).abs() < 1e-6);
        assert!((kw_only.score - 0.3).abs() < 1e-6);
        assert!(results[0].score > vec_only.score);
    }

    #[test]
    fn test_combine_weights_not_normalised() {
        let results = combine(&[kw("a", 1.0)], &[vec_hit("a", 1.0)], 2.0, 3.0, 10);
        assert!((results[0].score - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_combine_ties_break_by_id() {
        let vector = vec![vec_hit("c", 0.5), vec_hit("a", 0.5), vec_hit("b", 0.5)];
        let results = combine(&[], &vector, 0.3, 0.7, 10);

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_combine_truncates_and_dedups() {
        let keyword = vec![kw("a", 0.2), kw("a", 0.9), kw("b", 0.1)];
        let vector = vec![vec_hit("c", 0.1)];

        let results = combine(&keyword, &vector, 1.0, 1.0, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id.as_str(), "a");
        assert_eq!(results[0].keyword_score, Some(0.9));
    }

    #[test]
    fn test_combine_keeps_vector_metadata() {
        let mut hit = vec_hit("a", 0.9);
        let mut metadata = Metadata::new();
        metadata.insert("title".to_string(), serde_json::json!("Groceries"));
        hit.metadata = Some(metadata.clone());

        let results = combine(&[kw("a", 0.5)], &[hit], 0.5, 0.5, 10);
        assert_eq!(results[0].metadata, Some(metadata));
    }

    #[test]
    fn test_rrf_both_rankings_boost() {
        let keyword = vec![kw("1", 0.9), kw("3", 0.8)];
        let vector = vec![vec_hit("1", 0.9), vec_hit("2", 0.8)];

        let results = rrf_fusion(&keyword, &vector, 0.5, 0.5, 10);

        assert_eq!(results[0].id.as_str(), "1");
        // 0.5/61 + 0.5/61 = 1.0/61
        let expected_score = 1.0 / (RRF_K + 1.0);
        assert!((results[0].score - expected_score).abs() < 0.0001);
    }

    #[test]
    fn test_rrf_weight_favors_vector() {
        // Vector: 1 > 2, keyword: 2 > 1
        let keyword = vec![kw("2", 1.0), kw("1", 0.5)];
        let vector = vec![vec_hit("1", 0.9), vec_hit("2", 0.8)];

        let results = rrf_fusion(&keyword, &vector, 0.2, 0.8, 10);
        assert_eq!(results[0].id.as_str(), "1");

        let results = rrf_fusion(&keyword, &vector, 0.8, 0.2, 10);
        assert_eq!(results[0].id.as_str(), "2");
    }

    #[test]
    fn test_fuse_dispatches_on_mode() {
        let keyword = vec![kw("a", 1.0)];
        let weighted = fuse(FusionMode::Weighted, &keyword, &[], 0.3, 0.7, 10);
        let rrf = fuse(FusionMode::ReciprocalRank, &keyword, &[], 0.3, 0.7, 10);

        assert!((weighted[0].score - 0.3).abs() < 1e-6);
        assert!((rrf[0].score - 0.3 / 61.0).abs() < 1e-6);
    }
}
