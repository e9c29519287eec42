//! Backing store for the persisted vector column.
//!
//! Each row is owned by a content record: `(id, vector?, processed,
//! timestamps, metadata)`. Rows are created by the content layer
//! ([`VectorBackend::register`]); this subsystem only writes and clears the
//! vector half of a row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::semantic::record::{ContentId, Metadata, VectorRecord};
use crate::semantic::storage::{VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction aborted, no row for '{0}'")]
    MissingRow(ContentId),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] VectorStorageError),

    #[error("Background task failed: {0}")]
    Join(String),
}

/// A content row as persisted by the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRow {
    pub id: ContentId,
    pub vector: Option<Vec<f32>>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ContentRow {
    pub fn new(id: ContentId, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id,
            vector: None,
            processed: false,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.processed && self.vector.is_some()
    }

    /// `None` for rows that have not been embedded.
    pub fn into_record(self) -> Option<VectorRecord> {
        if !self.processed {
            return None;
        }
        let vector = self.vector?;
        Some(VectorRecord {
            id: self.id,
            vector,
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self.metadata,
        })
    }

    fn write_vector(&mut self, vector: Vec<f32>, metadata: Option<Metadata>) {
        self.vector = Some(vector);
        self.processed = true;
        self.updated_at = Utc::now();
        if let Some(metadata) = metadata {
            self.metadata = metadata;
        }
    }

    fn clear_vector(&mut self) {
        self.vector = None;
        self.processed = false;
        self.updated_at = Utc::now();
    }
}

/// One write inside an all-or-nothing unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    Upsert {
        id: ContentId,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    },
    Clear {
        id: ContentId,
    },
}

impl BackendOp {
    pub fn id(&self) -> &ContentId {
        match self {
            BackendOp::Upsert { id, .. } | BackendOp::Clear { id } => id,
        }
    }
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create the owning content row if it does not exist yet.
    async fn register(&self, id: &ContentId, metadata: Metadata) -> Result<(), BackendError>;

    /// Overwrite the vector of an existing row. `Ok(false)` if no row exists.
    async fn upsert_vector(
        &self,
        id: &ContentId,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    ) -> Result<bool, BackendError>;

    /// Clear vector and processed flag. `Ok(false)` if no row exists.
    async fn clear_vector(&self, id: &ContentId) -> Result<bool, BackendError>;

    async fn fetch(&self, id: &ContentId) -> Result<Option<ContentRow>, BackendError>;

    /// Rows in id order; `embedded_only` drops rows without a vector.
    async fn scan(&self, embedded_only: bool) -> Result<Vec<ContentRow>, BackendError>;

    async fn count_embedded(&self) -> Result<usize, BackendError>;

    /// Apply every op or none of them.
    async fn apply_atomic(&self, ops: Vec<BackendOp>) -> Result<(), BackendError>;
}

/// In-process backing store with optional snapshot persistence.
pub struct MemoryBackend {
    rows: RwLock<BTreeMap<ContentId, ContentRow>>,
    snapshot: Option<Snapshot>,
}

struct Snapshot {
    storage: VectorStorage,
    fingerprint: [u8; 32],
    dimensions: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            snapshot: None,
        }
    }

    /// Load rows from `storage` if the file exists.
    ///
    /// A snapshot written by a different embedding model or an unsupported
    /// format version is discarded and the store starts empty.
    pub fn open(
        storage: VectorStorage,
        fingerprint: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, BackendError> {
        let rows = if storage.exists() {
            match storage.load(&fingerprint, dimensions) {
                Ok(rows) => {
                    log::info!("Loaded {} rows from {}", rows.len(), storage.path().display());
                    rows
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("Embedding model changed, starting with an empty store");
                    Vec::new()
                }
                Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                    log::warn!("Snapshot version {file_ver} unsupported, starting with an empty store");
                    Vec::new()
                }
                Err(e) => {
                    log::error!("Failed to load snapshot: {e}");
                    return Err(e.into());
                }
            }
        } else {
            log::info!("No snapshot at {}, starting fresh", storage.path().display());
            Vec::new()
        };

        Ok(Self {
            rows: RwLock::new(rows.into_iter().map(|row| (row.id.clone(), row)).collect()),
            snapshot: Some(Snapshot {
                storage,
                fingerprint,
                dimensions,
            }),
        })
    }

    /// Write all rows to the snapshot file. No-op for purely in-memory stores.
    pub async fn flush(&self) -> Result<(), BackendError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };

        let rows: Vec<ContentRow> = self.rows.read().await.values().cloned().collect();
        let storage = snapshot.storage.clone();
        let fingerprint = snapshot.fingerprint;
        let dimensions = snapshot.dimensions;

        let count = rows.len();
        tokio::task::spawn_blocking(move || storage.save(&rows, &fingerprint, dimensions))
            .await
            .map_err(|e| BackendError::Join(e.to_string()))??;

        log::info!("Saved {count} rows to snapshot");
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn register(&self, id: &ContentId, metadata: Metadata) -> Result<(), BackendError> {
        let mut rows = self.rows.write().await;
        rows.entry(id.clone())
            .and_modify(|row| row.metadata = metadata.clone())
            .or_insert_with(|| ContentRow::new(id.clone(), metadata));
        Ok(())
    }

    async fn upsert_vector(
        &self,
        id: &ContentId,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    ) -> Result<bool, BackendError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(id) {
            Some(row) => {
                row.write_vector(vector, metadata);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_vector(&self, id: &ContentId) -> Result<bool, BackendError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(id) {
            Some(row) => {
                row.clear_vector();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fetch(&self, id: &ContentId) -> Result<Option<ContentRow>, BackendError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn scan(&self, embedded_only: bool) -> Result<Vec<ContentRow>, BackendError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| !embedded_only || row.is_embedded())
            .cloned()
            .collect())
    }

    async fn count_embedded(&self) -> Result<usize, BackendError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.is_embedded())
            .count())
    }

    async fn apply_atomic(&self, ops: Vec<BackendOp>) -> Result<(), BackendError> {
        let mut rows = self.rows.write().await;

        // every target must exist before anything is written
        if let Some(missing) = ops.iter().find(|op| !rows.contains_key(op.id())) {
            return Err(BackendError::MissingRow(missing.id().clone()));
        }

        for op in ops {
            match op {
                BackendOp::Upsert {
                    id,
                    vector,
                    metadata,
                } => {
                    if let Some(row) = rows.get_mut(&id) {
                        row.write_vector(vector, metadata);
                    }
                }
                BackendOp::Clear { id } => {
                    if let Some(row) = rows.get_mut(&id) {
                        row.clear_vector();
                    }
                }
            }
        }
        Ok(())
    }
}
