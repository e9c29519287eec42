//! Error taxonomy for the vector subsystem.
//!
//! Validation failures (`DimensionMismatch`, `InvalidParameter`) are always
//! raised before any I/O. Backing-store failures carry the operation name and
//! the id they concerned so the caller can retry them.

use crate::semantic::backend::BackendError;
use crate::semantic::cache::CacheError;
use crate::semantic::distance::DistanceError;
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::record::ContentId;

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Dimension mismatch{}: expected {expected}, got {actual}", fmt_id(.id))]
    DimensionMismatch {
        id: Option<ContentId>,
        expected: usize,
        actual: usize,
    },

    #[error("Record not found: {0}")]
    RecordNotFound(ContentId),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Backing store error during {operation}{}: {source}", fmt_id(.id))]
    BackingStore {
        operation: &'static str,
        id: Option<ContentId>,
        #[source]
        source: BackendError,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

fn fmt_id(id: &Option<ContentId>) -> String {
    id.as_ref()
        .map(|id| format!(" for '{id}'"))
        .unwrap_or_default()
}

impl VectorError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn backing_store(
        operation: &'static str,
        id: Option<&ContentId>,
        source: BackendError,
    ) -> Self {
        Self::BackingStore {
            operation,
            id: id.cloned(),
            source,
        }
    }

    /// Errors the caller caused and should not retry unchanged.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. } | Self::InvalidParameter { .. } | Self::RecordNotFound(_)
        )
    }

    /// Transient failures that the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackingStore { .. })
    }
}

impl From<DistanceError> for VectorError {
    fn from(err: DistanceError) -> Self {
        match err {
            DistanceError::InvalidArgument { left, right } => Self::DimensionMismatch {
                id: None,
                expected: left,
                actual: right,
            },
        }
    }
}
