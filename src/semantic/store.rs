//! `VectorRecordStore`: validated CRUD over the vector column.
//!
//! Every write checks `len == D` and finiteness before touching the backing
//! store, and cosine deployments persist unit vectors.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::semantic::backend::{BackendError, BackendOp, VectorBackend};
use crate::semantic::distance::{normalize, DistanceFunction};
use crate::semantic::error::VectorError;
use crate::semantic::index_config::IndexConfigManager;
use crate::semantic::record::{ContentId, Metadata, VectorRecord};

const DEFAULT_CHUNK_SIZE: usize = 10;
const DEFAULT_MAX_PARALLEL: usize = 4;
const DEFAULT_DELAY_MS: u64 = 100;
const DEFAULT_SCAN_BATCH_SIZE: usize = 1_000;

/// Throttling for [`VectorRecordStore::batch`] and candidate scans.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Ops per chunk; chunks run one after another.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Ops in flight at once inside a chunk.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Pause between chunks, for downstream rate limits.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Candidates scored between cancellation points during search.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_parallel: DEFAULT_MAX_PARALLEL,
            delay_ms: DEFAULT_DELAY_MS,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_scan_batch_size() -> usize {
    DEFAULT_SCAN_BATCH_SIZE
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Store {
        id: ContentId,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    },
    Update {
        id: ContentId,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    },
    Delete {
        id: ContentId,
    },
}

impl BatchOp {
    pub fn id(&self) -> &ContentId {
        match self {
            BatchOp::Store { id, .. } | BatchOp::Update { id, .. } | BatchOp::Delete { id } => id,
        }
    }
}

/// Per-item outcome of a non-transactional batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: Vec<ContentId>,
    pub failed: Vec<(ContentId, VectorError)>,
}

impl BatchResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct VectorRecordStore {
    config: Arc<IndexConfigManager>,
    backend: Arc<dyn VectorBackend>,
    batch: BatchConfig,
}

impl VectorRecordStore {
    pub fn new(
        config: Arc<IndexConfigManager>,
        backend: Arc<dyn VectorBackend>,
        batch: BatchConfig,
    ) -> Self {
        Self {
            config,
            backend,
            batch,
        }
    }

    pub fn backend(&self) -> &Arc<dyn VectorBackend> {
        &self.backend
    }

    pub fn batch_config(&self) -> &BatchConfig {
        &self.batch
    }

    /// Validate `vector` for `id` and bring it into the persisted form.
    ///
    /// Runs before any I/O.
    pub fn prepare(&self, id: &ContentId, vector: &[f32]) -> Result<Vec<f32>, VectorError> {
        let config = self.config.get_config();
        if vector.len() != config.dimensions {
            return Err(VectorError::DimensionMismatch {
                id: Some(id.clone()),
                expected: config.dimensions,
                actual: vector.len(),
            });
        }
        if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
            return Err(VectorError::invalid(
                "vector",
                format!("element {pos} of '{id}' is not finite"),
            ));
        }

        Ok(match config.distance_function {
            DistanceFunction::Cosine => normalize(vector),
            DistanceFunction::L2 | DistanceFunction::InnerProduct => vector.to_vec(),
        })
    }

    /// Create the owning row for `id`; stands in for the content layer.
    pub async fn register(&self, id: &ContentId, metadata: Metadata) -> Result<(), VectorError> {
        self.backend
            .register(id, metadata)
            .await
            .map_err(|e| VectorError::backing_store("register", Some(id), e))
    }

    /// Write the vector of an existing row, overwriting any previous one.
    pub async fn store(
        &self,
        id: &ContentId,
        vector: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<(), VectorError> {
        self.write("store", id, vector, metadata).await
    }

    /// Same contract as [`store`](Self::store), logged as a re-embedding.
    pub async fn update(
        &self,
        id: &ContentId,
        vector: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<(), VectorError> {
        self.write("update", id, vector, metadata).await
    }

    async fn write(
        &self,
        operation: &'static str,
        id: &ContentId,
        vector: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<(), VectorError> {
        let prepared = self.prepare(id, vector)?;

        let written = self
            .backend
            .upsert_vector(id, prepared, metadata)
            .await
            .map_err(|e| VectorError::backing_store(operation, Some(id), e))?;
        if !written {
            return Err(VectorError::RecordNotFound(id.clone()));
        }

        log::debug!("{operation}: vector written for '{id}'");
        Ok(())
    }

    /// Clear the vector and processed flag. The owning row stays.
    pub async fn delete(&self, id: &ContentId) -> Result<(), VectorError> {
        let cleared = self
            .backend
            .clear_vector(id)
            .await
            .map_err(|e| VectorError::backing_store("delete", Some(id), e))?;
        if !cleared {
            return Err(VectorError::RecordNotFound(id.clone()));
        }

        log::debug!("delete: vector cleared for '{id}'");
        Ok(())
    }

    /// `None` when the row is missing or not embedded.
    pub async fn get(&self, id: &ContentId) -> Result<Option<VectorRecord>, VectorError> {
        let row = self
            .backend
            .fetch(id)
            .await
            .map_err(|e| VectorError::backing_store("get", Some(id), e))?;
        Ok(row.and_then(|row| row.into_record()))
    }

    /// All embedded records, in one backing-store query.
    pub async fn scan_embedded(&self) -> Result<Vec<VectorRecord>, VectorError> {
        let rows = self
            .backend
            .scan(true)
            .await
            .map_err(|e| VectorError::backing_store("scan", None, e))?;
        Ok(rows.into_iter().filter_map(|row| row.into_record()).collect())
    }

    pub async fn count_embedded(&self) -> Result<usize, VectorError> {
        self.backend
            .count_embedded()
            .await
            .map_err(|e| VectorError::backing_store("count", None, e))
    }

    async fn apply(&self, op: &BatchOp) -> Result<(), VectorError> {
        match op {
            BatchOp::Store {
                id,
                vector,
                metadata,
            } => self.store(id, vector, metadata.clone()).await,
            BatchOp::Update {
                id,
                vector,
                metadata,
            } => self.update(id, vector, metadata.clone()).await,
            BatchOp::Delete { id } => self.delete(id).await,
        }
    }

    /// Run every op independently. A failed op never rolls back the others.
    ///
    /// Ops are processed in chunks of `chunk_size` with at most
    /// `max_parallel` in flight, pausing `delay_ms` between chunks.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> BatchResult {
        let mut result = BatchResult::default();
        let chunk_size = self.batch.chunk_size.max(1);
        let max_parallel = self.batch.max_parallel.max(1);
        let total_chunks = ops.len().div_ceil(chunk_size);

        for (chunk_idx, chunk) in ops.chunks(chunk_size).enumerate() {
            for group in chunk.chunks(max_parallel) {
                let outcomes = join_all(group.iter().map(|op| self.apply(op))).await;

                for (op, outcome) in group.iter().zip(outcomes) {
                    match outcome {
                        Ok(()) => result.succeeded.push(op.id().clone()),
                        Err(e) => {
                            log::warn!("Batch item '{}' failed: {e}", op.id());
                            result.failed.push((op.id().clone(), e));
                        }
                    }
                }
            }

            if chunk_idx + 1 < total_chunks && self.batch.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.batch.delay_ms)).await;
            }
        }

        log::info!(
            "Batch finished: {} succeeded, {} failed",
            result.succeeded.len(),
            result.failed.len()
        );
        result
    }

    /// All ops or none: validated up front, then applied as one unit of work.
    pub async fn batch_transactional(&self, ops: Vec<BatchOp>) -> Result<usize, VectorError> {
        let count = ops.len();
        let mut prepared = Vec::with_capacity(count);
        for op in ops {
            prepared.push(match op {
                BatchOp::Store {
                    id,
                    vector,
                    metadata,
                }
                | BatchOp::Update {
                    id,
                    vector,
                    metadata,
                } => {
                    let vector = self.prepare(&id, &vector)?;
                    BackendOp::Upsert {
                        id,
                        vector,
                        metadata,
                    }
                }
                BatchOp::Delete { id } => BackendOp::Clear { id },
            });
        }

        match self.backend.apply_atomic(prepared).await {
            Ok(()) => {
                log::info!("Transactional batch of {count} ops committed");
                Ok(count)
            }
            Err(BackendError::MissingRow(id)) => {
                log::warn!("Transactional batch rolled back, no row for '{id}'");
                Err(VectorError::RecordNotFound(id))
            }
            Err(e) => {
                log::warn!("Transactional batch rolled back: {e}");
                Err(VectorError::backing_store("batch_transactional", None, e))
            }
        }
    }
}
