//! Embedding providers.
//!
//! - `HashingEmbedder`: deterministic feature hashing, no model files. Used in
//!   tests and as the degraded fallback when the configured model is missing.
//! - `FastembedProvider` (feature `fastembed`): wraps fastembed's
//!   `TextEmbedding`, downloading the model on first use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::semantic::distance::normalize;

/// Default fastembed model name (bge-base offers +13% accuracy vs MiniLM)
pub const DEFAULT_MODEL: &str = "bge-base-en-v1.5";

const HASHING_NAME: &str = "feature-hashing";

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Provider produces {got}-dimensional vectors, deployment expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// Turns text into a vector of the deployment dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// True when this provider stands in for one that could not be built.
    fn is_degraded(&self) -> bool {
        false
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Snapshot fingerprint of the vector space this provider produces.
    fn fingerprint(&self) -> [u8; 32] {
        model_fingerprint(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Hashing,
    Fastembed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    /// fastembed model name, ignored by the hashing provider
    #[serde(default = "default_model")]
    pub model: String,

    /// Fall back to the hashing embedder when the configured provider
    /// cannot be built. The fallback is reported as degraded.
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            allow_fallback: default_allow_fallback(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_allow_fallback() -> bool {
    true
}

impl EmbeddingConfig {
    /// Name the stored vectors are fingerprinted with.
    pub fn model_name(&self) -> &str {
        match self.provider {
            ProviderKind::Hashing => HASHING_NAME,
            ProviderKind::Fastembed => &self.model,
        }
    }
}

/// SHA256 of the model name, written into the snapshot header.
pub fn model_fingerprint(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Build the configured provider.
///
/// `cache_dir` holds downloaded model files. When the configured provider
/// fails and `allow_fallback` is set, a degraded [`HashingEmbedder`] is
/// returned instead.
pub fn build_provider(
    config: &EmbeddingConfig,
    dimensions: usize,
    cache_dir: &Path,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let built: Result<Arc<dyn EmbeddingProvider>, EmbeddingError> = match config.provider {
        ProviderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(dimensions))),
        ProviderKind::Fastembed => build_fastembed(&config.model, dimensions, cache_dir),
    };

    match built {
        Ok(provider) => {
            log::debug!(
                "Embedding provider '{}' ready ({} dims)",
                provider.name(),
                provider.dimensions()
            );
            Ok(provider)
        }
        Err(e) if config.allow_fallback => {
            log::warn!(
                "Embedding provider '{}' unavailable ({e}), running degraded on feature hashing",
                config.model_name()
            );
            Ok(Arc::new(HashingEmbedder::degraded(dimensions)))
        }
        Err(e) => Err(e),
    }
}

#[cfg(feature = "fastembed")]
fn build_fastembed(
    model: &str,
    dimensions: usize,
    cache_dir: &Path,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider = FastembedProvider::new(model, cache_dir)?;
    if provider.dimensions() != dimensions {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimensions,
            got: provider.dimensions(),
        });
    }
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "fastembed"))]
fn build_fastembed(
    model: &str,
    _dimensions: usize,
    _cache_dir: &Path,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    Err(EmbeddingError::Unavailable(format!(
        "model '{model}' needs a build with the `fastembed` feature"
    )))
}

/// Signed feature hashing over word unigrams and bigrams, L2-normalised.
///
/// Same text always yields the same vector; texts sharing words land close
/// under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    degraded: bool,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            degraded: false,
        }
    }

    pub fn degraded(dimensions: usize) -> Self {
        Self {
            dimensions,
            degraded: true,
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }

        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        for word in &words {
            self.add_feature(&mut vector, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, bigram.as_bytes(), 0.5);
        }

        normalize(&vector)
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn name(&self) -> &str {
        HASHING_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(feature = "fastembed")]
pub use self::fastembed_provider::FastembedProvider;

#[cfg(feature = "fastembed")]
mod fastembed_provider {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use fastembed::{InitOptions, TextEmbedding};

    use super::{EmbeddingError, EmbeddingProvider};

    /// Uses a Mutex because fastembed's embed() requires &mut self.
    pub struct FastembedProvider {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: String,
        dimensions: usize,
    }

    impl FastembedProvider {
        /// Load `model_name`, downloading into `cache_dir/models` on first use.
        /// Blocking.
        pub fn new(model_name: &str, cache_dir: &Path) -> Result<Self, EmbeddingError> {
            let model_enum = parse_model_name(model_name)?;

            let models_dir = cache_dir.join("models");
            std::fs::create_dir_all(&models_dir).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to create models directory: {e}"))
            })?;

            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

            let dimensions = probe_dimensions(&mut model)?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                model_name: model_name.to_string(),
                dimensions,
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastembedProvider {
        fn name(&self) -> &str {
            &self.model_name
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let model = Arc::clone(&self.model);
            let text = text.to_string();

            tokio::task::spawn_blocking(move || {
                let mut model = model.lock().map_err(|e| {
                    EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {e}"))
                })?;
                let embeddings = model
                    .embed(vec![text], None)
                    .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
                embeddings.into_iter().next().ok_or_else(|| {
                    EmbeddingError::EmbeddingFailed("No embedding returned".to_string())
                })
            })
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
        }
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {name}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)"
            ))),
        }
    }

    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let probe = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {e}")))?;

        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::distance::{cosine_similarity, l2_norm};

    #[tokio::test]
    async fn test_hashing_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Buy milk and eggs").await.unwrap();
        let b = embedder.embed("Buy milk and eggs").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_related_texts_are_closer() {
        let embedder = HashingEmbedder::new(256);
        let groceries = embedder.embed_sync("buy milk eggs bread");
        let similar = embedder.embed_sync("milk eggs bread butter");
        let unrelated = embedder.embed_sync("quarterly planning meeting agenda");

        let close = cosine_similarity(&groceries, &similar).unwrap();
        let far = cosine_similarity(&groceries, &unrelated).unwrap();
        assert!(close > far);
    }

    #[test]
    fn test_hashing_empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed_sync("  ");
        assert_eq!(v, vec![0.0; 8]);
    }

    #[test]
    fn test_model_fingerprint_differs_by_name() {
        assert_eq!(model_fingerprint("a"), model_fingerprint("a"));
        assert_ne!(model_fingerprint("a"), model_fingerprint("b"));
    }

    #[test]
    fn test_build_hashing_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = build_provider(&EmbeddingConfig::default(), 16, tmp.path()).unwrap();

        assert_eq!(provider.dimensions(), 16);
        assert!(!provider.is_degraded());
    }

    #[test]
    fn test_unknown_fastembed_model_falls_back_degraded() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: ProviderKind::Fastembed,
            model: "nonexistent-model".to_string(),
            allow_fallback: true,
        };

        let provider = build_provider(&config, 16, tmp.path()).unwrap();
        assert!(provider.is_degraded());
        assert_eq!(provider.dimensions(), 16);
    }

    #[test]
    fn test_degraded_provider_fingerprints_its_own_space() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: ProviderKind::Fastembed,
            model: "nonexistent-model".to_string(),
            allow_fallback: true,
        };

        let provider = build_provider(&config, 16, tmp.path()).unwrap();
        assert!(provider.is_degraded());
        assert_eq!(provider.fingerprint(), model_fingerprint(provider.name()));
        assert_ne!(provider.fingerprint(), model_fingerprint(config.model_name()));
        assert_eq!(
            provider.fingerprint(),
            HashingEmbedder::new(16).fingerprint()
        );
    }

    #[test]
    fn test_fallback_disabled_surfaces_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: ProviderKind::Fastembed,
            model: "nonexistent-model".to_string(),
            allow_fallback: false,
        };

        assert!(build_provider(&config, 16, tmp.path()).is_err());
    }
}
