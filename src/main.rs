use anyhow::{bail, Context, Result};
use quarry::cli::{Cli, Commands, ConfigAction, FeedbackAction};
use quarry::clock::SystemClock;
use quarry::config::{Config, ConfigValidator};
use quarry::embedding::{EmbeddingProvider, FastEmbedProvider};
use quarry::feedback::{FeedbackCollector, FeedbackInput};
use quarry::index::{KeywordIndex, VectorIndex};
use quarry::pipeline::{normalize_query, Pipeline, QueryRequest};
use quarry::retrieval::FastEmbedScorer;
use quarry::routing::{QueryDecomposer, QueryRouter};
use quarry::storage::{Chunk, ChunkId, SqliteChunkStore};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Chunks are embedded and indexed in batches of this size during ingest
const INGEST_BATCH: usize = 64;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Classify { query } => {
            cmd_classify(cli.config, cli.profile, &query)?;
        }
        Commands::Route { query } => {
            cmd_route(cli.config, cli.profile, &query)?;
        }
        Commands::Decompose { query } => {
            cmd_decompose(cli.config, cli.profile, &query)?;
        }
        Commands::Ingest { input, no_embed } => {
            cmd_ingest(cli.config, cli.profile, &input, no_embed)?;
        }
        Commands::Query {
            query,
            filter,
            budget,
            decompose,
            debug,
            keyword_only,
        } => {
            let mut request = QueryRequest::new(query);
            if let Some(filter) = filter {
                request = request.with_file_filter(filter);
            }
            if let Some(budget) = budget {
                request = request.with_budget(budget);
            }
            if let Some(decompose) = decompose {
                request = request.with_decompose(decompose);
            }
            if debug {
                request = request.with_debug();
            }
            cmd_query(cli.config, cli.profile, request, keyword_only)?;
        }
        Commands::Feedback { action } => {
            cmd_feedback(cli.config, cli.profile, action)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if verbose { "quarry=debug" } else { "quarry=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so JSON on stdout stays parseable
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_classify(config_path: Option<PathBuf>, profile: Option<String>, query: &str) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let router = QueryRouter::new(&config.routing, &config.retrieval)?;
    let classification = router.classify(&normalize_query(query), None);

    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

fn cmd_route(config_path: Option<PathBuf>, profile: Option<String>, query: &str) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let router = QueryRouter::new(&config.routing, &config.retrieval)?;
    let decision = router.route(&normalize_query(query), None);

    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn cmd_decompose(config_path: Option<PathBuf>, profile: Option<String>, query: &str) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let decomposer = QueryDecomposer::new(config.routing.max_sub_queries)?;

    match decomposer.decompose(&normalize_query(query), Uuid::new_v4()) {
        Ok(decomposition) => println!("{}", serde_json::to_string_pretty(&decomposition)?),
        Err(e) => println!("Not decomposed: {}", e),
    }
    Ok(())
}

/// One line of an ingest file
#[derive(Debug, Deserialize)]
struct IngestRecord {
    id: Option<ChunkId>,
    text: String,
    source_file: String,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    chunk_index: u32,
}

fn cmd_ingest(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    input: &Path,
    no_embed: bool,
) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let data_dir = expand_path(&config.storage.data_dir)?;
    let storage = quarry::config::StorageConfig { data_dir };

    let records = read_ingest_file(input)?;
    if records.is_empty() {
        println!("No chunks found in {}", input.display());
        return Ok(());
    }

    let store = SqliteChunkStore::new(&storage.chunk_db_path())?;
    let mut next_id = store.all_chunks()?.last().map_or(1, |c| c.id + 1);
    let mut keyword = KeywordIndex::new(storage.keyword_index_path())?;

    let embedder = if no_embed {
        None
    } else {
        Some(FastEmbedProvider::for_index(
            &config.embedding.model,
            config.embedding.dimension,
        )?)
    };

    let mut inserted = 0usize;
    for batch in records.chunks(INGEST_BATCH) {
        let embeddings = match &embedder {
            Some(embedder) => {
                let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
                embedder.embed_batch(&texts)?
            }
            None => vec![Vec::new(); batch.len()],
        };

        let chunks: Vec<Chunk> = batch
            .iter()
            .zip(embeddings)
            .map(|(record, embedding)| {
                let id = record.id.unwrap_or_else(|| {
                    let id = next_id;
                    next_id += 1;
                    id
                });
                Chunk::new(
                    id,
                    record.text.clone(),
                    embedding,
                    record.source_file.clone(),
                    record.page,
                    record.chunk_index,
                )
            })
            .collect();

        inserted += store.insert_chunks(&chunks)?;
        keyword.insert_chunks(&chunks)?;
        tracing::debug!("Ingested batch of {} chunks", chunks.len());
    }
    keyword.commit()?;

    let stats = store.stats()?;
    println!("✓ Ingested {} chunks from {}", inserted, input.display());
    println!(
        "  Store: {} chunks, {} sources, {} embedded",
        stats.chunk_count, stats.source_count, stats.embedded_count
    );
    Ok(())
}

fn read_ingest_file(path: &Path) -> Result<Vec<IngestRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open ingest file {}", path.display()))?;

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IngestRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid chunk on line {}", line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn cmd_query(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    request: QueryRequest,
    keyword_only: bool,
) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let data_dir = expand_path(&config.storage.data_dir)?;
    let storage = quarry::config::StorageConfig { data_dir };

    let db_path = storage.chunk_db_path();
    if !db_path.exists() {
        bail!(
            "No corpus at {}. Run `quarry ingest <file>` first.",
            db_path.display()
        );
    }
    let store = Arc::new(SqliteChunkStore::new(&db_path)?);

    let mut builder = Pipeline::builder(config.pipeline(), store.clone())
        .keyword(Arc::new(KeywordIndex::open_read_only(&storage.keyword_index_path())?));

    if !keyword_only {
        let chunks: Vec<Chunk> = store
            .all_chunks()?
            .into_iter()
            .filter(|c| !c.embedding.is_empty())
            .collect();
        if chunks.is_empty() {
            tracing::warn!("No embedded chunks in the store; running keyword search only");
        } else {
            let embedder = FastEmbedProvider::for_index(
                &config.embedding.model,
                config.embedding.dimension,
            )?;
            let vectors = VectorIndex::from_chunks(
                config.embedding.dimension,
                &chunks,
                &config.indexing,
            )?;
            builder = builder.vector(Arc::new(vectors), Arc::new(embedder));
        }
    }

    if config.features.reranking {
        match FastEmbedScorer::new(&config.embedding.reranker_model) {
            Ok(scorer) => builder = builder.reranker(Arc::new(scorer)),
            Err(e) => tracing::warn!("Reranker unavailable, continuing without it: {}", e),
        }
    }

    let pipeline = builder.build()?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    match runtime.block_on(pipeline.search(request)) {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) if e.is_no_results() => {
            println!("{}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_feedback(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: FeedbackAction,
) -> Result<()> {
    let mut config = load_config(config_path, profile)?;
    let log_file = match config.feedback.log_file.take() {
        Some(path) => expand_path(&path)?,
        None => expand_path(&config.storage.data_dir)?.join("feedback.jsonl"),
    };
    config.feedback.log_file = Some(log_file);

    let collector = FeedbackCollector::new(&config.feedback, Arc::new(SystemClock));
    let replayed = collector.restore()?;
    tracing::debug!("Loaded {} feedback records", replayed);

    match action {
        FeedbackAction::Rate {
            bundle_id,
            rating,
            query,
            comment,
        } => {
            let bundle_id = Uuid::parse_str(&bundle_id)
                .with_context(|| format!("Invalid bundle id: {}", bundle_id))?;
            let mut input = FeedbackInput::new(query, bundle_id, rating);
            if let Some(comment) = comment {
                input = input.with_comment(comment);
            }
            let record = collector.record(input)?;
            println!(
                "✓ Recorded rating {} ({}) for bundle {}",
                record.rating.value(),
                record.rating_label,
                record.bundle_id
            );
        }
        FeedbackAction::Stats { low_rated } => {
            let stats = collector.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            let low = collector.low_rated(low_rated);
            if !low.is_empty() {
                println!("\nLow-rated queries:");
                for entry in low {
                    println!("  [{}] {}", entry.rating.value(), entry.query);
                }
            }
        }
        FeedbackAction::Export { output, min_rating } => {
            collector.export_json(&output, min_rating)?;
            println!("✓ Exported feedback to {}", output.display());
        }
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, None)?;

            let value = match section.as_deref() {
                None => toml::Value::try_from(&config)?,
                Some(name) => {
                    let full = toml::Value::try_from(&config)?;
                    match full.get(name) {
                        Some(section) => section.clone(),
                        None => bail!("Unknown config section: {}", name),
                    }
                }
            };
            println!("{}", toml::to_string_pretty(&value)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            ConfigValidator::validate(&config)?;
            println!("✓ Configuration is valid: {}", path.display());
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };
            if path.exists() && !force {
                bail!(
                    "Configuration already exists at {}. Use --force to overwrite.",
                    path.display()
                );
            }

            let config = Config::default();
            config.save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
            println!("  Data directory: {}", config.storage.data_dir.display());
        }
    }
    Ok(())
}

/// Load configuration from file, or defaults when no file exists yet
fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    let mut config = if path.exists() {
        Config::load(&path)?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };

    if let Some(profile) = profile {
        config.apply_profile(&profile)?;
        ConfigValidator::validate(&config)?;
    }
    Ok(config)
}

/// Expand a leading `~/` to the home directory
fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => {
            let home = dirs::home_dir().context("Cannot determine home directory")?;
            Ok(home.join(rest))
        }
        None => Ok(path.to_path_buf()),
    }
}
