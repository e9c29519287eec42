//! Cross-module scenarios: orchestrator, cache, store and backend together.

mod search;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::semantic::{
    BackendError, BackendOp, BatchConfig, ContentId, ContentRow, DistanceFunction,
    HashingEmbedder, IndexConfig, IndexConfigManager, LexicalKeywordSearch, MemoryBackend,
    Metadata, SearchCache, SimilaritySearchOrchestrator, StatementTarget, VectorBackend,
    VectorRecordStore,
};

/// Memory backend that counts candidate scans and can hold one scan after
/// it has read its rows.
#[derive(Default)]
pub(crate) struct CountingBackend {
    inner: MemoryBackend,
    scans: AtomicUsize,
    hold: AtomicBool,
    held: Notify,
    release: Notify,
}

impl CountingBackend {
    pub(crate) fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// The next candidate scan parks until [`release_scan`](Self::release_scan).
    pub(crate) fn hold_next_scan(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held scan has read its rows.
    pub(crate) async fn scan_held(&self) {
        self.held.notified().await;
    }

    pub(crate) fn release_scan(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl VectorBackend for CountingBackend {
    async fn register(&self, id: &ContentId, metadata: Metadata) -> Result<(), BackendError> {
        self.inner.register(id, metadata).await
    }

    async fn upsert_vector(
        &self,
        id: &ContentId,
        vector: Vec<f32>,
        metadata: Option<Metadata>,
    ) -> Result<bool, BackendError> {
        self.inner.upsert_vector(id, vector, metadata).await
    }

    async fn clear_vector(&self, id: &ContentId) -> Result<bool, BackendError> {
        self.inner.clear_vector(id).await
    }

    async fn fetch(&self, id: &ContentId) -> Result<Option<ContentRow>, BackendError> {
        self.inner.fetch(id).await
    }

    async fn scan(&self, embedded_only: bool) -> Result<Vec<ContentRow>, BackendError> {
        if !embedded_only {
            return self.inner.scan(false).await;
        }
        self.scans.fetch_add(1, Ordering::SeqCst);
        let rows = self.inner.scan(true).await?;
        if self.hold.swap(false, Ordering::SeqCst) {
            self.held.notify_one();
            self.release.notified().await;
        }
        Ok(rows)
    }

    async fn count_embedded(&self) -> Result<usize, BackendError> {
        self.inner.count_embedded().await
    }

    async fn apply_atomic(&self, ops: Vec<BackendOp>) -> Result<(), BackendError> {
        self.inner.apply_atomic(ops).await
    }
}

pub(crate) const TTL: Duration = Duration::from_secs(60);

pub(crate) fn orchestrator(
    dimensions: usize,
    distance_function: DistanceFunction,
) -> (SimilaritySearchOrchestrator, Arc<CountingBackend>) {
    let backend = Arc::new(CountingBackend::default());
    let manager = Arc::new(
        IndexConfigManager::new(
            IndexConfig::new(dimensions, distance_function),
            StatementTarget::default(),
        )
        .unwrap(),
    );
    let batch = BatchConfig {
        delay_ms: 0,
        scan_batch_size: 2,
        ..BatchConfig::default()
    };
    let store = VectorRecordStore::new(manager.clone(), backend.clone(), batch);
    let keyword = Arc::new(LexicalKeywordSearch::new(backend.clone()));
    let service = SimilaritySearchOrchestrator::new(
        manager,
        store,
        SearchCache::new(100, TTL),
        keyword,
        Arc::new(HashingEmbedder::new(dimensions)),
    );
    (service, backend)
}

/// Register `id` with a title and store `vector` for it.
pub(crate) async fn put(
    service: &SimilaritySearchOrchestrator,
    id: &str,
    title: &str,
    vector: &[f32],
) {
    let id = ContentId::from(id);
    let mut metadata = Metadata::new();
    metadata.insert("title".to_string(), serde_json::json!(title));
    service.register(&id, metadata).await.unwrap();
    service.store_vector(&id, vector, None).await.unwrap();
}
