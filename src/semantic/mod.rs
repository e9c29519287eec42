//! Vector storage and similarity search for notes.
//!
//! # Architecture
//!
//! - `distance`: cosine, L2 and inner-product scoring
//! - `store`: validated CRUD over the vector column of a [`VectorBackend`]
//! - `index_config`: active index configuration and its recommendation heuristic
//! - `statements`: pgvector-style DDL and search statements with bound params
//! - `cache`: TTL search cache with pluggable eviction
//! - `hybrid`: keyword/vector rank fusion
//! - `service`: the orchestrator tying the above together
//! - `backend` / `storage`: in-memory backing store and its `vectors.bin` snapshot
//! - `embeddings`, `lexical`, `preprocess`: external collaborators (text to
//!   vector, keyword search, input cleanup)

mod backend;
mod cache;
mod distance;
mod embeddings;
mod error;
mod eviction;
mod hybrid;
mod index_config;
mod lexical;
mod preprocess;
mod record;
mod service;
mod statements;
mod storage;
mod store;

pub use backend::{BackendError, BackendOp, ContentRow, MemoryBackend, VectorBackend};
pub use cache::{search_cache_key, CacheEntry, CacheError, CacheStats, CacheWeight, SearchCache};
pub use distance::{
    cosine_similarity, inner_product, l2_distance, l2_norm, normalize, score, DistanceError,
    DistanceFunction,
};
#[cfg(feature = "fastembed")]
pub use embeddings::FastembedProvider;
pub use embeddings::{
    build_provider, model_fingerprint, EmbeddingConfig, EmbeddingError, EmbeddingProvider,
    HashingEmbedder, ProviderKind, DEFAULT_MODEL,
};
pub use error::VectorError;
pub use eviction::{EvictionKind, EvictionPolicy, InsertionAge, LeastRecentlyUsed};
pub use hybrid::{
    combine, fuse, rrf_fusion, FusionMode, HybridResult, DEFAULT_KEYWORD_WEIGHT,
    DEFAULT_VECTOR_WEIGHT,
};
pub use index_config::{
    recommended_config, HnswParams, IndexConfig, IndexConfigManager, IndexConfigUpdate,
    IndexType, IvfFlatParams, HNSW_LARGE_DATASET, HNSW_MIN_DATASET,
};
pub use lexical::{score_rows, KeywordHit, KeywordSearch, LexicalKeywordSearch};
pub use preprocess::{content_hash, preprocess_content, MAX_CONTENT_LENGTH};
pub use record::{ContentId, Metadata, SearchResult, VectorRecord};
pub use service::{
    EmbedOutcome, HybridOptions, SearchOptions, ServiceStats, SimilaritySearchOrchestrator,
    CONTENT_HASH_KEY, EMBEDDING_MODEL_KEY,
};
pub use statements::{
    PgVectorDialect, Statement, StatementDialect, StatementParam, StatementTarget,
};
pub use storage::{VectorStorage, VectorStorageError};
pub use store::{BatchConfig, BatchOp, BatchResult, VectorRecordStore};
