use std::path::{Path, PathBuf};
use std::time::Duration;

use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::{
    BatchConfig, DistanceFunction, EmbeddingConfig, EvictionKind, HnswParams, IndexConfig,
    IndexType, IvfFlatParams, StatementTarget,
};

const CONFIG_FILE: &str = "config.yaml";

/// Largest accepted `index.dimensions`.
const MAX_DIMENSIONS: usize = 16_000;

const DEFAULT_DIMENSIONS: usize = 1536;
const DEFAULT_CACHE_MAX_SIZE: usize = 1000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine home directory")]
    NoHome,

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Unknown config key: {0}")]
    UnknownKey(String),
}

/// How the index section is turned into the startup `IndexConfig`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBootstrap {
    /// Use the section as written.
    #[default]
    Defaults,
    /// Replace type and params with the recommendation for the stored
    /// vector count.
    Recommended,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSection {
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_index_type")]
    pub index_type: IndexType,

    #[serde(default = "default_distance_function")]
    pub distance_function: DistanceFunction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw: Option<HnswParams>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ivfflat: Option<IvfFlatParams>,

    #[serde(default)]
    pub bootstrap: IndexBootstrap,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            index_type: default_index_type(),
            distance_function: default_distance_function(),
            hnsw: Some(HnswParams::default()),
            ivfflat: None,
            bootstrap: IndexBootstrap::default(),
        }
    }
}

impl IndexSection {
    pub fn to_index_config(&self) -> IndexConfig {
        let mut config = IndexConfig {
            dimensions: self.dimensions,
            index_type: self.index_type,
            distance_function: self.distance_function,
            hnsw: self.hnsw,
            ivfflat: self.ivfflat,
        };
        match config.index_type {
            IndexType::Hnsw if config.hnsw.is_none() => config.hnsw = Some(HnswParams::default()),
            IndexType::IvfFlat if config.ivfflat.is_none() => {
                config.ivfflat = Some(IvfFlatParams::default())
            }
            _ => {}
        }
        config
    }

    /// Write the active index configuration back into this section.
    pub fn apply(&mut self, config: &IndexConfig) {
        self.dimensions = config.dimensions;
        self.index_type = config.index_type;
        self.distance_function = config.distance_function;
        self.hnsw = config.hnsw;
        self.ivfflat = config.ivfflat;
    }
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_index_type() -> IndexType {
    IndexType::Hnsw
}

fn default_distance_function() -> DistanceFunction {
    DistanceFunction::Cosine
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default)]
    pub eviction: EvictionKind,

    /// How often expired entries are swept by the background task
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            eviction: EvictionKind::default(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_cache_max_size() -> usize {
    DEFAULT_CACHE_MAX_SIZE
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub statements: StatementTarget,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

/// `NOTEVEC_BASE_PATH`, or `~/.local/share/notevec`.
pub fn default_base_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("NOTEVEC_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .map_err(|_| ConfigError::NoHome)?
        .ok_or(ConfigError::NoHome)?;
    Ok(home.join(".local/share/notevec"))
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dims = self.index.dimensions;
        if !(1..=MAX_DIMENSIONS).contains(&dims) {
            return Err(ConfigError::Invalid(format!(
                "index.dimensions must be between 1 and {MAX_DIMENSIONS}, got {dims}"
            )));
        }
        self.index
            .to_index_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("index: {e}")))?;

        if self.cache.max_size == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_size must be greater than 0".to_string(),
            ));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.default_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        let batch = &self.batch;
        for (name, value) in [
            ("batch.chunk_size", batch.chunk_size),
            ("batch.max_parallel", batch.max_parallel),
            ("batch.scan_batch_size", batch.scan_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        if let Some(ident) = self.statements.invalid_identifier() {
            return Err(ConfigError::Invalid(format!(
                "statements: '{ident}' is not a valid SQL identifier"
            )));
        }

        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.base_path.join("vectors.bin")
    }

    pub fn load() -> Result<Self, ConfigError> {
        let base_path = default_base_path()?;
        Self::load_with(&base_path)
    }

    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(base_path)?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            log::info!("Writing default config to {}", path.display());
            std::fs::write(&path, serde_yml::to_string(&Self::default())?)?;
        }

        let config_str = std::fs::read_to_string(&path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str)?;
        Ok(())
    }

    /// Set a dotted key (`cache.max_size`, `index.distance_function`, ...)
    /// from its YAML text. The change is validated but not saved.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let mut tree = serde_yml::to_value(&*self)?;

        let mut node = &mut tree;
        for part in key.split('.') {
            node = node
                .get_mut(part)
                .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        }
        *node = serde_yml::from_str(raw)?;

        let mut updated: Self = serde_yml::from_value(tree)?;
        updated.validate()?;
        updated.base_path = std::mem::take(&mut self.base_path);
        *self = updated;
        Ok(())
    }
}
