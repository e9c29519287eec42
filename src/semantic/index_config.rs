//! Active ANN index configuration and dataset-size recommendations.
//!
//! The manager owns the single configuration for a deployment. It is built
//! once at startup and shared by `Arc`; nothing reads it through global state.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::semantic::distance::DistanceFunction;
use crate::semantic::error::VectorError;
use crate::semantic::statements::{PgVectorDialect, Statement, StatementDialect, StatementTarget};

/// Below this many vectors IVFFlat is recommended.
pub const HNSW_MIN_DATASET: usize = 1_000;
/// From this many vectors the large HNSW profile is recommended.
pub const HNSW_LARGE_DATASET: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Hnsw,
    IvfFlat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search: u32,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
            ef_search: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfFlatParams {
    pub lists: u32,
    pub probes: u32,
}

impl Default for IvfFlatParams {
    fn default() -> Self {
        Self {
            lists: 100,
            probes: 10,
        }
    }
}

/// Index configuration. Only the params block matching `index_type` is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimensions: usize,
    pub index_type: IndexType,
    pub distance_function: DistanceFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw: Option<HnswParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ivfflat: Option<IvfFlatParams>,
}

impl IndexConfig {
    pub fn new(dimensions: usize, distance_function: DistanceFunction) -> Self {
        Self {
            dimensions,
            index_type: IndexType::Hnsw,
            distance_function,
            hnsw: Some(HnswParams::default()),
            ivfflat: None,
        }
    }

    /// HNSW params, falling back to defaults when the block is absent.
    pub fn hnsw_params(&self) -> HnswParams {
        self.hnsw.unwrap_or_default()
    }

    /// IVFFlat params, falling back to defaults when the block is absent.
    pub fn ivfflat_params(&self) -> IvfFlatParams {
        self.ivfflat.unwrap_or_default()
    }

    pub(crate) fn validate(&self) -> Result<(), VectorError> {
        if self.dimensions == 0 {
            return Err(VectorError::invalid("dimensions", "must be greater than 0"));
        }
        match self.index_type {
            IndexType::Hnsw => {
                let p = self.hnsw_params();
                if p.m < 2 || p.ef_construction == 0 || p.ef_search == 0 {
                    return Err(VectorError::invalid(
                        "hnsw",
                        format!("m must be >= 2 and ef values positive, got {p:?}"),
                    ));
                }
                if p.ef_construction < 2 * p.m {
                    return Err(VectorError::invalid(
                        "hnsw.ef_construction",
                        format!("must be at least 2 * m ({}), got {}", 2 * p.m, p.ef_construction),
                    ));
                }
            }
            IndexType::IvfFlat => {
                let p = self.ivfflat_params();
                if p.lists == 0 || p.probes == 0 {
                    return Err(VectorError::invalid(
                        "ivfflat",
                        format!("lists and probes must be positive, got {p:?}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Partial update for [`IndexConfigManager::update_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_type: Option<IndexType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_function: Option<DistanceFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw: Option<HnswParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ivfflat: Option<IvfFlatParams>,
}

impl From<IndexConfig> for IndexConfigUpdate {
    fn from(config: IndexConfig) -> Self {
        Self {
            dimensions: Some(config.dimensions),
            index_type: Some(config.index_type),
            distance_function: Some(config.distance_function),
            hnsw: config.hnsw,
            ivfflat: config.ivfflat,
        }
    }
}

/// Owner of the active [`IndexConfig`].
pub struct IndexConfigManager {
    config: RwLock<IndexConfig>,
    target: StatementTarget,
    dialect: Box<dyn StatementDialect>,
}

impl IndexConfigManager {
    pub fn new(config: IndexConfig, target: StatementTarget) -> Result<Self, VectorError> {
        Self::with_dialect(config, target, Box::new(PgVectorDialect))
    }

    pub fn with_dialect(
        config: IndexConfig,
        target: StatementTarget,
        dialect: Box<dyn StatementDialect>,
    ) -> Result<Self, VectorError> {
        config.validate()?;
        if let Some(ident) = target.invalid_identifier() {
            return Err(VectorError::invalid(
                "statements",
                format!("'{ident}' is not a plain SQL identifier"),
            ));
        }
        Ok(Self {
            config: RwLock::new(config),
            target,
            dialect,
        })
    }

    pub fn get_config(&self) -> IndexConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Configured vector dimension `D`.
    pub fn dimensions(&self) -> usize {
        self.get_config().dimensions
    }

    pub fn distance_function(&self) -> DistanceFunction {
        self.get_config().distance_function
    }

    /// Apply a partial update.
    ///
    /// The dimension is fixed for a deployment; an update that changes it is
    /// rejected. Switching `index_type` without supplying params fills in the
    /// defaults for the new type.
    ///
    /// Stored vectors are not rewritten. Vectors stored under cosine stay
    /// unit-normalised after a switch to L2 or inner product, so they must be
    /// re-stored from their source to match the new function.
    pub fn update_config(&self, update: IndexConfigUpdate) -> Result<IndexConfig, VectorError> {
        let mut guard = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(dimensions) = update.dimensions {
            if dimensions != guard.dimensions {
                return Err(VectorError::invalid(
                    "dimensions",
                    format!(
                        "fixed at {} for this deployment, cannot change to {dimensions}",
                        guard.dimensions
                    ),
                ));
            }
        }

        let mut next = guard.clone();
        if let Some(index_type) = update.index_type {
            next.index_type = index_type;
        }
        if let Some(distance_function) = update.distance_function {
            next.distance_function = distance_function;
        }
        if update.hnsw.is_some() {
            next.hnsw = update.hnsw;
        }
        if update.ivfflat.is_some() {
            next.ivfflat = update.ivfflat;
        }
        match next.index_type {
            IndexType::Hnsw if next.hnsw.is_none() => next.hnsw = Some(HnswParams::default()),
            IndexType::IvfFlat if next.ivfflat.is_none() => {
                next.ivfflat = Some(IvfFlatParams::default())
            }
            _ => {}
        }

        next.validate()?;

        if next.distance_function != guard.distance_function {
            log::warn!(
                "Distance function changed from {} to {}; re-store existing vectors to rebuild them",
                guard.distance_function,
                next.distance_function
            );
        }

        log::info!(
            "Index config updated: {:?}/{} -> {:?}/{}",
            guard.index_type,
            guard.distance_function,
            next.index_type,
            next.distance_function
        );
        *guard = next.clone();

        Ok(next)
    }

    /// Recommend an index for `dataset_size` vectors, keeping the current
    /// dimension and distance function.
    pub fn get_recommended_config(&self, dataset_size: usize) -> IndexConfig {
        let current = self.get_config();
        recommended_config(current.dimensions, current.distance_function, dataset_size)
    }

    /// `len == D` and every element finite.
    pub fn validate_dimensions(&self, vector: &[f32]) -> bool {
        vector.len() == self.dimensions() && vector.iter().all(|x| x.is_finite())
    }

    pub fn emit_index_statement(&self) -> String {
        self.dialect.create_index(&self.target, &self.get_config())
    }

    /// Session setting for the search-time knob (`ef_search` or `probes`).
    pub fn emit_session_statement(&self) -> String {
        self.dialect.session_settings(&self.get_config())
    }

    pub fn emit_search_statement(
        &self,
        query_vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Statement {
        self.dialect
            .ranked_search(&self.target, &self.get_config(), query_vector, limit, threshold)
    }
}

/// Staircase heuristic:
///
/// - `< 1_000`: IVFFlat, `lists = min(n / 10, 100)`, `probes = min(10, n)`
/// - `< 100_000`: HNSW `m=16, ef_construction=64, ef_search=40`
/// - otherwise: HNSW `m=32, ef_construction=128, ef_search=64`
///
/// `lists` and `probes` are floored at 1 so tiny datasets still yield a
/// buildable index.
pub fn recommended_config(
    dimensions: usize,
    distance_function: DistanceFunction,
    dataset_size: usize,
) -> IndexConfig {
    if dataset_size < HNSW_MIN_DATASET {
        let lists = (dataset_size / 10).min(100).max(1) as u32;
        let probes = dataset_size.min(10).max(1) as u32;
        return IndexConfig {
            dimensions,
            index_type: IndexType::IvfFlat,
            distance_function,
            hnsw: None,
            ivfflat: Some(IvfFlatParams { lists, probes }),
        };
    }

    let hnsw = if dataset_size < HNSW_LARGE_DATASET {
        HnswParams {
            m: 16,
            ef_construction: 64,
            ef_search: 40,
        }
    } else {
        HnswParams {
            m: 32,
            ef_construction: 128,
            ef_search: 64,
        }
    };

    IndexConfig {
        dimensions,
        index_type: IndexType::Hnsw,
        distance_function,
        hnsw: Some(hnsw),
        ivfflat: None,
    }
}
