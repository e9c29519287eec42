//! Backing-store statements for index builds and ranked search.
//!
//! This is the only place that produces SQL-shaped text. Query vectors,
//! limits and thresholds are always passed as bound parameters; only
//! validated identifiers and integer index parameters are inlined.

use serde::{Deserialize, Serialize};

use crate::semantic::distance::DistanceFunction;
use crate::semantic::index_config::{IndexConfig, IndexType};

/// Table and columns that hold the persisted vectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementTarget {
    pub table: String,
    pub id_column: String,
    pub vector_column: String,
    pub processed_column: String,
}

impl Default for StatementTarget {
    fn default() -> Self {
        Self {
            table: "notes".to_string(),
            id_column: "id".to_string(),
            vector_column: "embedding".to_string(),
            processed_column: "embedding_processed".to_string(),
        }
    }
}

impl StatementTarget {
    /// Every identifier must match `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn invalid_identifier(&self) -> Option<&str> {
        [
            &self.table,
            &self.id_column,
            &self.vector_column,
            &self.processed_column,
        ]
        .into_iter()
        .find(|ident| !is_identifier(ident))
        .map(|s| s.as_str())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A value bound to a positional placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementParam {
    Vector(Vec<f32>),
    Int(i64),
    Float(f64),
}

/// Statement text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<StatementParam>,
}

impl Statement {
    pub fn sql(&self) -> &str {
        &self.text
    }
}

/// Renders statements for a particular backing store.
pub trait StatementDialect: Send + Sync {
    fn create_index(&self, target: &StatementTarget, config: &IndexConfig) -> String;

    fn session_settings(&self, config: &IndexConfig) -> String;

    fn ranked_search(
        &self,
        target: &StatementTarget,
        config: &IndexConfig,
        query_vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Statement;
}

/// PostgreSQL + pgvector.
pub struct PgVectorDialect;

impl PgVectorDialect {
    fn opclass(function: DistanceFunction) -> &'static str {
        match function {
            DistanceFunction::Cosine => "vector_cosine_ops",
            DistanceFunction::L2 => "vector_l2_ops",
            DistanceFunction::InnerProduct => "vector_ip_ops",
        }
    }

    fn operator(function: DistanceFunction) -> &'static str {
        match function {
            DistanceFunction::Cosine => "<=>",
            DistanceFunction::L2 => "<->",
            DistanceFunction::InnerProduct => "<#>",
        }
    }

    /// Similarity expression matching `distance::score` for each function.
    fn similarity_expr(function: DistanceFunction, column: &str, param: &str) -> String {
        let op = Self::operator(function);
        match function {
            DistanceFunction::Cosine => format!("1 - ({column} {op} {param})"),
            DistanceFunction::L2 => format!("1 / (1 + ({column} {op} {param}))"),
            DistanceFunction::InnerProduct => format!("({column} {op} {param}) * -1"),
        }
    }
}

impl StatementDialect for PgVectorDialect {
    fn create_index(&self, target: &StatementTarget, config: &IndexConfig) -> String {
        let opclass = Self::opclass(config.distance_function);
        match config.index_type {
            IndexType::Hnsw => {
                let p = config.hnsw_params();
                format!(
                    "CREATE INDEX IF NOT EXISTS {table}_{column}_hnsw_idx ON {table} \
                     USING hnsw ({column} {opclass}) WITH (m = {m}, ef_construction = {ef})",
                    table = target.table,
                    column = target.vector_column,
                    m = p.m,
                    ef = p.ef_construction,
                )
            }
            IndexType::IvfFlat => {
                let p = config.ivfflat_params();
                format!(
                    "CREATE INDEX IF NOT EXISTS {table}_{column}_ivfflat_idx ON {table} \
                     USING ivfflat ({column} {opclass}) WITH (lists = {lists})",
                    table = target.table,
                    column = target.vector_column,
                    lists = p.lists,
                )
            }
        }
    }

    fn session_settings(&self, config: &IndexConfig) -> String {
        match config.index_type {
            IndexType::Hnsw => format!("SET hnsw.ef_search = {}", config.hnsw_params().ef_search),
            IndexType::IvfFlat => format!("SET ivfflat.probes = {}", config.ivfflat_params().probes),
        }
    }

    fn ranked_search(
        &self,
        target: &StatementTarget,
        config: &IndexConfig,
        query_vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Statement {
        let function = config.distance_function;
        let column = &target.vector_column;
        let similarity = Self::similarity_expr(function, column, "$1");
        let op = Self::operator(function);

        let text = format!(
            "SELECT {id}, {similarity} AS similarity, {column} {op} $1 AS distance \
             FROM {table} \
             WHERE {column} IS NOT NULL AND {processed} = TRUE AND {similarity} >= $3 \
             ORDER BY {column} {op} $1, {id} \
             LIMIT $2",
            id = target.id_column,
            table = target.table,
            processed = target.processed_column,
        );

        Statement {
            text,
            params: vec![
                StatementParam::Vector(query_vector.to_vec()),
                StatementParam::Int(limit as i64),
                StatementParam::Float(threshold as f64),
            ],
        }
    }
}
