use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use notevec::config::{Config, IndexBootstrap};
use notevec::semantic::{
    build_provider, ContentId, FusionMode, HybridOptions, IndexConfigManager,
    LexicalKeywordSearch, MemoryBackend, Metadata, SearchCache, SearchOptions,
    SimilaritySearchOrchestrator, StatementParam, VectorRecordStore, VectorStorage,
    DEFAULT_KEYWORD_WEIGHT, DEFAULT_VECTOR_WEIGHT,
};

mod cli;
use cli::{ConfigAction, SqlAction};

fn parse_tags(tags: String) -> Vec<String> {
    tags.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
}

fn parse_vector(raw: &str) -> anyhow::Result<Vec<f32>> {
    raw.split(',')
        .map(|x| {
            x.trim()
                .parse::<f32>()
                .with_context(|| format!("'{x}' is not a number"))
        })
        .collect()
}

/// `key=value`, where value is parsed as JSON when possible.
fn parse_filters(filters: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    filters
        .iter()
        .map(|filter| {
            let Some((key, value)) = filter.split_once('=') else {
                bail!("filter '{filter}' must look like key=value");
            };
            let value = serde_json::from_str(value).unwrap_or_else(|_| json!(value));
            Ok((key.to_string(), value))
        })
        .collect()
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Runtime {
    config: Config,
    backend: Arc<MemoryBackend>,
    service: SimilaritySearchOrchestrator,
    sweeper: tokio::task::JoinHandle<()>,
}

async fn build_runtime(config: Config) -> anyhow::Result<Runtime> {
    let dimensions = config.index.dimensions;

    let embedding = config.embedding.clone();
    let model_dir = config.base_path().to_path_buf();
    let embedder = tokio::task::spawn_blocking(move || {
        build_provider(&embedding, dimensions, &model_dir)
    })
    .await??;
    if embedder.is_degraded() {
        log::warn!(
            "Vectors of '{}' are not loaded while running on '{}'",
            config.embedding.model_name(),
            embedder.name()
        );
    }

    // the snapshot belongs to the provider that actually embeds
    let backend = Arc::new(MemoryBackend::open(
        VectorStorage::new(config.snapshot_path()),
        embedder.fingerprint(),
        dimensions,
    )?);

    let manager = Arc::new(IndexConfigManager::new(
        config.index.to_index_config(),
        config.statements.clone(),
    )?);
    let store = VectorRecordStore::new(manager.clone(), backend.clone(), config.batch.clone());
    let cache = SearchCache::with_policy(
        config.cache.max_size,
        config.cache.default_ttl(),
        config.cache.eviction.build(),
    );
    let keyword = Arc::new(LexicalKeywordSearch::new(backend.clone()));

    let service = SimilaritySearchOrchestrator::new(manager, store, cache, keyword, embedder);

    if config.index.bootstrap == IndexBootstrap::Recommended {
        let applied = service.apply_recommended_config().await?;
        log::info!("Bootstrapped index as {:?}", applied.index_type);
    }

    let sweeper = service.spawn_cache_sweeper(config.cache.sweep_interval());

    Ok(Runtime {
        config,
        backend,
        service,
        sweeper,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let config = Config::load()?;
    let Runtime {
        mut config,
        backend,
        service,
        sweeper,
    } = build_runtime(config).await?;

    match args.command {
        cli::Command::Register { id, note } => {
            let mut metadata = Metadata::new();
            if let Some(title) = note.title {
                metadata.insert("title".to_string(), json!(title));
            }
            if let Some(content) = note.content {
                metadata.insert("content".to_string(), json!(content));
            }
            if let Some(tags) = note.tags {
                metadata.insert("tags".to_string(), json!(parse_tags(tags)));
            }
            service.register(&ContentId::from(id), metadata).await?;
            backend.flush().await?;
        }

        cli::Command::Store { id, vector } => {
            let vector = parse_vector(&vector)?;
            service
                .store_vector(&ContentId::from(id), &vector, None)
                .await?;
            backend.flush().await?;
        }

        cli::Command::Delete { id } => {
            service.delete_vector(&ContentId::from(id)).await?;
            backend.flush().await?;
        }

        cli::Command::Get { id } => {
            let id = ContentId::from(id);
            match service.get_vector(&id).await? {
                Some(record) => print_json(&record)?,
                None => bail!("no vector stored for '{id}'"),
            }
        }

        cli::Command::Embed { id, title, content } => {
            let outcome = service
                .embed_content(
                    &ContentId::from(id),
                    &title.unwrap_or_default(),
                    &content.unwrap_or_default(),
                )
                .await?;
            backend.flush().await?;
            print_json(&outcome)?;
        }

        cli::Command::Search {
            vector,
            text,
            limit,
            threshold,
            filter,
            no_metadata,
        } => {
            let query = match (vector, text) {
                (Some(vector), _) => parse_vector(&vector)?,
                (None, Some(text)) => service.embedder().embed(&text).await?,
                (None, None) => bail!("either --vector or --text is required"),
            };
            let options = SearchOptions {
                limit,
                threshold,
                filters: parse_filters(&filter)?,
                include_metadata: !no_metadata,
            };
            print_json(&service.similarity_search(&query, &options).await?)?;
        }

        cli::Command::Hybrid {
            text,
            vector,
            keyword_weight,
            vector_weight,
            limit,
            rrf,
        } => {
            let vector = vector.as_deref().map(parse_vector).transpose()?;
            let options = HybridOptions {
                keyword_weight: keyword_weight.unwrap_or(DEFAULT_KEYWORD_WEIGHT),
                vector_weight: vector_weight.unwrap_or(DEFAULT_VECTOR_WEIGHT),
                limit,
                fusion: if rrf {
                    FusionMode::ReciprocalRank
                } else {
                    FusionMode::Weighted
                },
                ..HybridOptions::default()
            };
            let results = service
                .hybrid_search(&text, vector.as_deref(), &options)
                .await?;
            print_json(&results)?;
        }

        cli::Command::Config { action } => match action {
            ConfigAction::Show {} => {
                print!("{}", serde_yml::to_string(&config)?);
            }
            ConfigAction::Recommend { size, apply } => {
                let recommended = match size {
                    Some(size) => service.get_recommended_config(size),
                    None => service.recommend_for_store().await?,
                };
                if apply {
                    let applied = service.apply_recommended_config().await?;
                    config.index.apply(&applied);
                    config.save()?;
                    print_json(&applied)?;
                } else {
                    print_json(&recommended)?;
                }
            }
            ConfigAction::Set { key, value } => {
                config.set_value(&key, &value)?;
                config.save()?;
                println!("{key} = {value}");
            }
        },

        cli::Command::Sql { action } => {
            let manager = service.index_config();
            match action {
                SqlAction::Index {} => println!("{};", manager.emit_index_statement()),
                SqlAction::Session {} => println!("{};", manager.emit_session_statement()),
                SqlAction::Search {
                    vector,
                    limit,
                    threshold,
                } => {
                    let vector = parse_vector(&vector)?;
                    if !manager.validate_dimensions(&vector) {
                        bail!(
                            "query vector must have {} finite elements",
                            manager.dimensions()
                        );
                    }
                    let statement = manager.emit_search_statement(&vector, limit, threshold);
                    println!("{};", statement.sql());
                    for (idx, param) in statement.params.iter().enumerate() {
                        let value = match param {
                            StatementParam::Vector(v) => format!("vector({})", v.len()),
                            StatementParam::Int(i) => i.to_string(),
                            StatementParam::Float(f) => f.to_string(),
                        };
                        println!("-- ${} = {value}", idx + 1);
                    }
                }
            }
        }

        cli::Command::Stats {} => {
            print_json(&service.get_stats().await?)?;
        }
    }

    sweeper.abort();
    Ok(())
}
