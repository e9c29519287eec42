//! Similarity search orchestration.
//!
//! Each `similarity_search` call walks
//! `Validate -> CacheLookup -> (hit: return) | (miss: Fetch -> Score ->
//! FilterByThreshold -> FilterByMetadata -> Sort -> Truncate -> CacheStore)`.
//! Cache failures are logged and the search continues uncached.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;

use crate::semantic::cache::{search_cache_key, CacheStats, SearchCache};
use crate::semantic::distance::{normalize, score, DistanceFunction};
use crate::semantic::embeddings::EmbeddingProvider;
use crate::semantic::error::VectorError;
use crate::semantic::hybrid::{
    fuse, FusionMode, HybridResult, DEFAULT_KEYWORD_WEIGHT, DEFAULT_VECTOR_WEIGHT,
};
use crate::semantic::index_config::{IndexConfig, IndexConfigManager, IndexConfigUpdate};
use crate::semantic::lexical::KeywordSearch;
use crate::semantic::preprocess::{content_hash, preprocess_content};
use crate::semantic::record::{ContentId, Metadata, SearchResult, VectorRecord};
use crate::semantic::store::{BatchOp, BatchResult, VectorRecordStore};

/// Metadata key holding the hash of the text a vector was computed from.
pub const CONTENT_HASH_KEY: &str = "content_hash";

/// Metadata key naming the provider that produced the stored vector.
pub const EMBEDDING_MODEL_KEY: &str = "embedding_model";

const DEFAULT_LIMIT: usize = 10;

/// Options for [`SimilaritySearchOrchestrator::similarity_search`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// Minimum similarity, inclusive, in [0, 1].
    pub threshold: f32,
    /// Exact-match metadata filters. An array value in the metadata matches
    /// when it contains the filter value.
    pub filters: BTreeMap<String, Value>,
    pub include_metadata: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            threshold: 0.0,
            filters: BTreeMap::new(),
            include_metadata: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub keyword_weight: f32,
    pub vector_weight: f32,
    pub limit: usize,
    pub fusion: FusionMode,
    /// Similarity threshold applied to the vector side.
    pub threshold: f32,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            keyword_weight: DEFAULT_KEYWORD_WEIGHT,
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            limit: DEFAULT_LIMIT,
            fusion: FusionMode::default(),
            threshold: 0.0,
        }
    }
}

/// Result of [`SimilaritySearchOrchestrator::embed_content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedOutcome {
    Embedded,
    /// Stored vector already matches the content hash.
    Unchanged,
    /// Title and body are both blank; nothing was written.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// `None` when the cache could not report.
    pub cache: Option<CacheStats>,
    pub embedded_records: usize,
    pub provider: String,
    pub degraded: bool,
    pub index: IndexConfig,
}

pub struct SimilaritySearchOrchestrator {
    config: Arc<IndexConfigManager>,
    store: VectorRecordStore,
    cache: Arc<SearchCache<Vec<SearchResult>>>,
    keyword: Arc<dyn KeywordSearch>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SimilaritySearchOrchestrator {
    pub fn new(
        config: Arc<IndexConfigManager>,
        store: VectorRecordStore,
        cache: SearchCache<Vec<SearchResult>>,
        keyword: Arc<dyn KeywordSearch>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            cache: Arc::new(cache),
            keyword,
            embedder,
        }
    }

    pub fn index_config(&self) -> &Arc<IndexConfigManager> {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    fn invalidate_cache(&self, reason: &str) {
        if let Err(e) = self.cache.clear() {
            log::warn!("Failed to clear search cache after {reason}: {e}");
        }
    }

    pub async fn register(&self, id: &ContentId, metadata: Metadata) -> Result<(), VectorError> {
        self.store.register(id, metadata).await?;
        self.invalidate_cache("register");
        Ok(())
    }

    pub async fn store_vector(
        &self,
        id: &ContentId,
        vector: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<(), VectorError> {
        self.store.store(id, vector, metadata).await?;
        self.invalidate_cache("store");
        Ok(())
    }

    pub async fn update_vector(
        &self,
        id: &ContentId,
        vector: &[f32],
        metadata: Option<Metadata>,
    ) -> Result<(), VectorError> {
        self.store.update(id, vector, metadata).await?;
        self.invalidate_cache("update");
        Ok(())
    }

    pub async fn delete_vector(&self, id: &ContentId) -> Result<(), VectorError> {
        self.store.delete(id).await?;
        self.invalidate_cache("delete");
        Ok(())
    }

    pub async fn get_vector(&self, id: &ContentId) -> Result<Option<VectorRecord>, VectorError> {
        self.store.get(id).await
    }

    pub async fn batch(&self, ops: Vec<BatchOp>) -> BatchResult {
        let result = self.store.batch(ops).await;
        if !result.succeeded.is_empty() {
            self.invalidate_cache("batch");
        }
        result
    }

    pub async fn batch_transactional(&self, ops: Vec<BatchOp>) -> Result<usize, VectorError> {
        let applied = self.store.batch_transactional(ops).await?;
        self.invalidate_cache("transactional batch");
        Ok(applied)
    }

    /// Embed a note's text and store the vector, unless the stored vector was
    /// computed from the same text by the same provider.
    pub async fn embed_content(
        &self,
        id: &ContentId,
        title: &str,
        body: &str,
    ) -> Result<EmbedOutcome, VectorError> {
        let Some(content) = preprocess_content(title, body) else {
            log::debug!("Nothing to embed for '{id}'");
            return Ok(EmbedOutcome::Empty);
        };
        let hash = format!("{:016x}", content_hash(title, body));

        let row = self
            .store
            .backend()
            .fetch(id)
            .await
            .map_err(|e| VectorError::backing_store("embed", Some(id), e))?
            .ok_or_else(|| VectorError::RecordNotFound(id.clone()))?;

        let model = self.embedder.name();
        let stored_hash = row.metadata.get(CONTENT_HASH_KEY).and_then(Value::as_str);
        let stored_model = row.metadata.get(EMBEDDING_MODEL_KEY).and_then(Value::as_str);
        if row.is_embedded() && stored_hash == Some(hash.as_str()) && stored_model == Some(model) {
            log::debug!("Content of '{id}' unchanged, skipping embedding");
            return Ok(EmbedOutcome::Unchanged);
        }

        let vector = self.embedder.embed(&content).await?;

        let mut metadata = row.metadata;
        metadata.insert(CONTENT_HASH_KEY.to_string(), Value::String(hash));
        metadata.insert(
            EMBEDDING_MODEL_KEY.to_string(),
            Value::String(model.to_string()),
        );
        if row.vector.is_some() {
            self.update_vector(id, &vector, Some(metadata)).await?;
        } else {
            self.store_vector(id, &vector, Some(metadata)).await?;
        }

        Ok(EmbedOutcome::Embedded)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(limit = options.limit, threshold = options.threshold))]
    pub async fn similarity_search(
        &self,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, VectorError> {
        let config = self.config.get_config();
        validate_search(query, options, config.dimensions)?;

        let query = match config.distance_function {
            DistanceFunction::Cosine => normalize(query),
            DistanceFunction::L2 | DistanceFunction::InnerProduct => query.to_vec(),
        };

        let key = match search_cache_key(
            config.distance_function,
            &query,
            options.limit,
            options.threshold,
            &options.filters,
        ) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("Search cache disabled for this query: {e}");
                None
            }
        };

        if let Some(key) = &key {
            match self.cache.get(key) {
                Ok(Some(hit)) => return Ok(strip_metadata(hit, options.include_metadata)),
                Ok(None) => {}
                Err(e) => log::warn!("Search cache lookup failed, querying store: {e}"),
            }
        }

        // results are cached only if no clear happens after this point
        let generation = match self.cache.generation() {
            Ok(generation) => Some(generation),
            Err(e) => {
                log::warn!("Search cache unavailable, result will not be cached: {e}");
                None
            }
        };

        let candidates = self.store.scan_embedded().await?;
        let scan_batch_size = self.store.batch_config().scan_batch_size.max(1);

        let mut results = Vec::new();
        for batch in candidates.chunks(scan_batch_size) {
            results.extend(score_batch(
                config.distance_function,
                &query,
                batch,
                options.threshold,
                &options.filters,
            ));
            // cancellation point between scan batches
            tokio::task::yield_now().await;
        }

        results.sort_by(SearchResult::rank_cmp);
        results.truncate(options.limit);

        if let (Some(key), Some(generation)) = (&key, generation) {
            match self
                .cache
                .set_if_generation(key, results.clone(), None, generation)
            {
                Ok(true) => {}
                Ok(false) => log::debug!("Store changed during search, result not cached"),
                Err(e) => log::warn!("Failed to cache search results: {e}"),
            }
        }

        Ok(strip_metadata(results, options.include_metadata))
    }

    /// Fuse keyword hits for `text` with vector hits for `query_vector`.
    ///
    /// Without a vector, `text` is embedded with the configured provider.
    #[tracing::instrument(level = "debug", skip_all, fields(fusion = ?options.fusion))]
    pub async fn hybrid_search(
        &self,
        text: &str,
        query_vector: Option<&[f32]>,
        options: &HybridOptions,
    ) -> Result<Vec<HybridResult>, VectorError> {
        if options.limit == 0 {
            return Err(VectorError::invalid("limit", "must be greater than 0"));
        }
        for (name, weight) in [
            ("keyword_weight", options.keyword_weight),
            ("vector_weight", options.vector_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(VectorError::invalid(
                    name,
                    format!("must be a finite non-negative number, got {weight}"),
                ));
            }
        }

        let embedded;
        let query_vector = match query_vector {
            Some(vector) => Some(vector),
            None if !text.trim().is_empty() => {
                embedded = self.embedder.embed(text).await?;
                Some(embedded.as_slice())
            }
            None => None,
        };

        let vector_results = match query_vector {
            Some(vector) => {
                let search = SearchOptions {
                    limit: options.limit,
                    threshold: options.threshold,
                    filters: BTreeMap::new(),
                    include_metadata: true,
                };
                self.similarity_search(vector, &search).await?
            }
            None => Vec::new(),
        };

        let keyword_results = self
            .keyword
            .search(text, options.limit)
            .await
            .map_err(|e| VectorError::backing_store("keyword_search", None, e))?;

        Ok(fuse(
            options.fusion,
            &keyword_results,
            &vector_results,
            options.keyword_weight,
            options.vector_weight,
            options.limit,
        ))
    }

    pub fn get_config(&self) -> IndexConfig {
        self.config.get_config()
    }

    /// Apply a partial update; cached results are dropped since scores may
    /// change with the distance function.
    pub fn update_config(&self, update: IndexConfigUpdate) -> Result<IndexConfig, VectorError> {
        let updated = self.config.update_config(update)?;
        self.invalidate_cache("config update");
        Ok(updated)
    }

    pub fn get_recommended_config(&self, dataset_size: usize) -> IndexConfig {
        self.config.get_recommended_config(dataset_size)
    }

    /// Recommendation for the number of vectors currently stored.
    pub async fn recommend_for_store(&self) -> Result<IndexConfig, VectorError> {
        let count = self.store.count_embedded().await?;
        Ok(self.config.get_recommended_config(count))
    }

    /// Switch the index type and params to the recommendation for the
    /// current store size.
    pub async fn apply_recommended_config(&self) -> Result<IndexConfig, VectorError> {
        let recommended = self.recommend_for_store().await?;
        self.update_config(IndexConfigUpdate {
            index_type: Some(recommended.index_type),
            hnsw: recommended.hnsw,
            ivfflat: recommended.ivfflat,
            ..IndexConfigUpdate::default()
        })
    }

    pub async fn get_stats(&self) -> Result<ServiceStats, VectorError> {
        let cache = match self.cache.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::warn!("Cache stats unavailable: {e}");
                None
            }
        };

        Ok(ServiceStats {
            cache,
            embedded_records: self.store.count_embedded().await?,
            provider: self.embedder.name().to_string(),
            degraded: self.embedder.is_degraded(),
            index: self.config.get_config(),
        })
    }

    pub fn clear_cache(&self) -> Result<(), VectorError> {
        self.cache.clear()?;
        Ok(())
    }

    /// Periodically sweep expired cache entries. Abort the handle to stop.
    pub fn spawn_cache_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.cleanup() {
                    log::warn!("Cache sweep failed: {e}");
                }
            }
        })
    }
}

fn validate_search(
    query: &[f32],
    options: &SearchOptions,
    dimensions: usize,
) -> Result<(), VectorError> {
    if options.limit == 0 {
        return Err(VectorError::invalid("limit", "must be greater than 0"));
    }
    if !(0.0..=1.0).contains(&options.threshold) {
        return Err(VectorError::invalid(
            "threshold",
            format!("must be between 0.0 and 1.0, got {}", options.threshold),
        ));
    }
    if query.len() != dimensions {
        return Err(VectorError::DimensionMismatch {
            id: None,
            expected: dimensions,
            actual: query.len(),
        });
    }
    if let Some(pos) = query.iter().position(|x| !x.is_finite()) {
        return Err(VectorError::invalid(
            "query",
            format!("element {pos} is not finite"),
        ));
    }
    Ok(())
}

fn score_batch(
    function: DistanceFunction,
    query: &[f32],
    batch: &[VectorRecord],
    threshold: f32,
    filters: &BTreeMap<String, Value>,
) -> Vec<SearchResult> {
    batch
        .par_iter()
        .filter_map(|record| {
            let (similarity, distance) = match score(function, query, &record.vector) {
                Ok(scored) => scored,
                Err(e) => {
                    log::warn!("Skipping '{}' during search: {e}", record.id);
                    return None;
                }
            };
            if similarity < threshold || !matches_filters(&record.metadata, filters) {
                return None;
            }
            Some(SearchResult {
                id: record.id.clone(),
                similarity,
                distance,
                metadata: Some(record.metadata.clone()),
            })
        })
        .collect()
}

fn matches_filters(metadata: &Metadata, filters: &BTreeMap<String, Value>) -> bool {
    filters.iter().all(|(key, expected)| match metadata.get(key) {
        Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(actual) => actual == expected,
        None => false,
    })
}

fn strip_metadata(mut results: Vec<SearchResult>, include_metadata: bool) -> Vec<SearchResult> {
    if !include_metadata {
        for result in &mut results {
            result.metadata = None;
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_filters_exact_and_array() {
        let mut metadata = Metadata::new();
        metadata.insert("category".to_string(), json!("work"));
        metadata.insert("tags".to_string(), json!(["urgent", "q3"]));

        let filter = |pairs: &[(&str, Value)]| -> BTreeMap<String, Value> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()
        };

        assert!(matches_filters(&metadata, &BTreeMap::new()));
        assert!(matches_filters(&metadata, &filter(&[("category", json!("work"))])));
        assert!(matches_filters(&metadata, &filter(&[("tags", json!("urgent"))])));
        assert!(!matches_filters(&metadata, &filter(&[("tags", json!("later"))])));
        assert!(!matches_filters(&metadata, &filter(&[("missing", json!(1))])));
        assert!(!matches_filters(
            &metadata,
            &filter(&[("category", json!("work")), ("tags", json!("later"))])
        ));
    }

    #[test]
    fn test_validate_search_parameters() {
        let options = SearchOptions::default();
        assert!(validate_search(&[0.0, 1.0], &options, 2).is_ok());

        let zero_limit = SearchOptions {
            limit: 0,
            ..SearchOptions::default()
        };
        assert!(matches!(
            validate_search(&[0.0, 1.0], &zero_limit, 2),
            Err(VectorError::InvalidParameter { name: "limit", .. })
        ));

        let bad_threshold = SearchOptions {
            threshold: 1.5,
            ..SearchOptions::default()
        };
        assert!(matches!(
            validate_search(&[0.0, 1.0], &bad_threshold, 2),
            Err(VectorError::InvalidParameter { name: "threshold", .. })
        ));

        assert!(matches!(
            validate_search(&[0.0, f32::INFINITY], &options, 2),
            Err(VectorError::InvalidParameter { name: "query", .. })
        ));
        assert!(matches!(
            validate_search(&[0.0], &options, 2),
            Err(VectorError::DimensionMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let options = SearchOptions {
            threshold: f32::NAN,
            ..SearchOptions::default()
        };
        assert!(validate_search(&[1.0], &options, 1).is_err());
    }
}
