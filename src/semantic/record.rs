//! Core data model: content ids, stored vector records and search results.

use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque per-record metadata, persisted as a JSON object.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Identifier of the content record that owns a vector.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId(String);

impl Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ContentId(s.to_string()))
    }
}

impl Deref for ContentId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for ContentId {
    fn from(fr: &str) -> Self {
        ContentId(fr.to_string())
    }
}

impl From<String> for ContentId {
    fn from(fr: String) -> Self {
        ContentId(fr)
    }
}

impl From<ContentId> for String {
    fn from(fr: ContentId) -> Self {
        fr.0
    }
}

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An embedded content record as returned by `get`.
///
/// Records without a vector ("not embedded yet") are never materialised as a
/// `VectorRecord`; they only exist as rows in the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: ContentId,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A single hit from a similarity search.
///
/// `similarity` and `distance` always come from the same distance function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: ContentId,
    pub similarity: f32,
    pub distance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl SearchResult {
    /// Ordering used everywhere results are ranked: similarity descending,
    /// then id ascending.
    pub fn rank_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .similarity
            .partial_cmp(&self.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}
