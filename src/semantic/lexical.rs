//! Keyword scoring for hybrid search.
//!
//! Matches query terms against the `title`, `content` and `tags` metadata of
//! every registered row. Content matches are weighted inversely to content
//! length so long notes do not win on surface area alone.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::semantic::backend::{BackendError, ContentRow, VectorBackend};
use crate::semantic::record::ContentId;

/// A keyword hit with a text score in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordHit {
    pub id: ContentId,
    pub text_score: f32,
}

/// Source of keyword hits for the hybrid ranker.
#[async_trait]
pub trait KeywordSearch: Send + Sync {
    /// Best-first hits for `text`, at most `limit` of them.
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<KeywordHit>, BackendError>;
}

/// Keyword search over row metadata held by a [`VectorBackend`].
pub struct LexicalKeywordSearch {
    backend: Arc<dyn VectorBackend>,
}

impl LexicalKeywordSearch {
    pub fn new(backend: Arc<dyn VectorBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl KeywordSearch for LexicalKeywordSearch {
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<KeywordHit>, BackendError> {
        let rows = self.backend.scan(false).await?;
        let mut hits = score_rows(text, &rows);
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Score rows against `query`. Sorted by score descending, ties by id.
/// Rows without a single matching term are dropped.
pub fn score_rows(query: &str, rows: &[ContentRow]) -> Vec<KeywordHit> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return vec![];
    }

    let raw: Vec<(ContentId, f32)> = rows
        .iter()
        .filter_map(|row| {
            let fields = NoteFields::from_row(row);
            let (matched_terms, total_hits) = count_matches(&query_terms, &fields);
            if matched_terms == 0 {
                return None;
            }
            // rows covering more of the query come first
            let coverage = matched_terms as f32 / query_terms.len() as f32;
            Some((row.id.clone(), total_hits * coverage))
        })
        .collect();

    let max = raw.iter().map(|(_, score)| *score).fold(0.0f32, f32::max);
    if max <= 0.0 {
        return vec![];
    }

    let mut hits: Vec<KeywordHit> = raw
        .into_iter()
        .map(|(id, score)| KeywordHit {
            id,
            text_score: score / max,
        })
        .collect();

    hits.sort_by(|a, b| {
        b.text_score
            .partial_cmp(&a.text_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits
}

struct NoteFields {
    title: String,
    content: String,
    content_len: usize,
    tags: Vec<String>,
}

impl NoteFields {
    fn from_row(row: &ContentRow) -> Self {
        let text = |key: &str| {
            row.metadata
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let content = text("content");
        let tags = row
            .metadata
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            title: text("title").to_lowercase(),
            content_len: content.chars().count(),
            content: content.to_lowercase(),
            tags,
        }
    }
}

/// Tokenize query into lowercase terms.
/// Filters out very short terms (1 char) and common stop words.
fn tokenize(query: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at",
        "to", "for", "of", "with", "by", "from", "as", "and", "or", "but", "not", "no", "so",
        "if", "then",
    ];

    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect();
    terms.dedup();
    terms
}

/// Content at or below this many characters gets full weight.
const CONTENT_LENGTH_BASELINE: f32 = 100.0;

/// `1 / (1 + ln(len / baseline))` above the baseline, 1.0 otherwise.
fn content_length_weight(len: usize) -> f32 {
    if len <= CONTENT_LENGTH_BASELINE as usize {
        return 1.0;
    }
    1.0 / (1.0 + (len as f32 / CONTENT_LENGTH_BASELINE).ln())
}

/// Returns (unique terms matched, weighted hits).
fn count_matches(query_terms: &[String], fields: &NoteFields) -> (usize, f32) {
    let content_weight = content_length_weight(fields.content_len);

    let mut matched_terms = 0;
    let mut total_hits: f32 = 0.0;

    for term in query_terms {
        let mut term_hits: f32 = 0.0;

        if fields.title.contains(term.as_str()) {
            term_hits += 2.0;
        }

        if fields.content.contains(term.as_str()) {
            term_hits += content_weight;
        }

        // exact tag or hierarchy prefix ("work" matches "work/meetings")
        for tag in &fields.tags {
            if tag == term || tag.starts_with(&format!("{term}/")) {
                term_hits += 3.0;
            }
        }

        if term_hits > 0.0 {
            matched_terms += 1;
            total_hits += term_hits;
        }
    }

    (matched_terms, total_hits)
}
