//! Configuration management for quarry
//!
//! The TOML file is read once, environment overrides are applied once, and the
//! result is frozen into a [`PipelineConfig`] that every component receives
//! explicitly. Nothing downstream reads the process environment.

use crate::error::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub diversity: DiversityConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Stage toggles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureFlags {
    /// Query both backends; when off only the vector backend is used
    pub hybrid_search: bool,
    pub reranking: bool,
    pub quality_filter: bool,
    pub diversity: bool,
    pub decomposition: bool,
    pub compression: bool,
    pub caching: bool,
    pub conversation_memory: bool,
    pub evidence_extraction: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            hybrid_search: true,
            reranking: true,
            quality_filter: true,
            diversity: true,
            decomposition: true,
            compression: true,
            caching: true,
            conversation_memory: true,
            evidence_extraction: true,
        }
    }
}

/// Candidate counts and fusion constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k_initial: usize,
    pub top_k_final: usize,
    pub rrf_k: f32,
    pub keyword_weight: f32,
    pub vector_weight: f32,
    pub rerank_top_n: usize,
    pub max_query_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_initial: 50,
            top_k_final: 5,
            rrf_k: 60.0,
            keyword_weight: 1.0,
            vector_weight: 1.0,
            rerank_top_n: 20,
            max_query_chars: 2000,
        }
    }
}

/// Noise penalty and per-source trust
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub penalty_weight: f32,
    /// Keyed by file name (exact) or a case-insensitive substring of it
    pub source_weights: HashMap<String, f32>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            penalty_weight: 0.15,
            source_weights: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversityConfig {
    pub mmr_lambda: f32,
    pub mmr_similarity_threshold: f32,
    pub max_chunks_per_page: usize,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            mmr_lambda: 0.7,
            mmr_similarity_threshold: 0.85,
            max_chunks_per_page: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Sentences kept across the whole bundle
    pub max_sentences: usize,
    pub max_sentences_per_chunk: usize,
    pub similarity_threshold: f32,
    pub min_sentence_chars: usize,
    pub max_sentence_chars: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_sentences: 8,
            max_sentences_per_chunk: 3,
            similarity_threshold: 0.3,
            min_sentence_chars: 20,
            max_sentence_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub max_context_chars: usize,
    pub min_sources: usize,
    /// A truncated sentence must keep at least this fraction of the remaining budget
    pub compression_threshold: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_context_chars: 6000,
            min_sources: 3,
            compression_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Rule confidence below this is handed to the ambiguity resolver
    pub ambiguity_threshold: f32,
    pub max_sub_queries: usize,
    pub max_docs_per_subquery: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ambiguity_threshold: 0.5,
            max_sub_queries: 3,
            max_docs_per_subquery: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_history: usize,
    pub max_age_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            max_age_secs: 3600,
        }
    }
}

/// Deadlines for the request and every external call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_deadline_ms: u64,
    pub backend_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    pub classifier_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: 10_000,
            backend_timeout_ms: 2_000,
            embed_timeout_ms: 2_000,
            rerank_timeout_ms: 3_000,
            classifier_timeout_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn backend(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn embed(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn rerank(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }

    pub fn classifier(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimension: usize,
    pub reranker_model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            reranker_model: "bge-reranker-base".to_string(),
        }
    }
}

/// HNSW parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
        }
    }
}

/// On-disk corpus locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.quarry"),
        }
    }
}

impl StorageConfig {
    pub fn chunk_db_path(&self) -> PathBuf {
        self.data_dir.join("chunks.db")
    }

    pub fn keyword_index_path(&self) -> PathBuf {
        self.data_dir.join("keyword_index")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// JSONL log of every rating; in-memory only when unset
    pub log_file: Option<PathBuf>,
    pub max_low_rated: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            max_low_rated: 50,
        }
    }
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caching: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k_final: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_deadline_ms: Option<u64>,
}

/// Immutable view of the settings that drive a query
///
/// Built once from [`Config`] and shared by reference; the pipeline never
/// mutates it.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub features: FeatureFlags,
    pub retrieval: RetrievalConfig,
    pub quality: QualityConfig,
    pub diversity: DiversityConfig,
    pub evidence: EvidenceConfig,
    pub compression: CompressionConfig,
    pub routing: RoutingConfig,
    pub timeouts: TimeoutConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub indexing: IndexingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Config::default().pipeline()
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(QuarryError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| QuarryError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        // Validate configuration
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuarryError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| QuarryError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| QuarryError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(enabled) = overrides.reranking {
            self.features.reranking = enabled;
        }
        if let Some(enabled) = overrides.decomposition {
            self.features.decomposition = enabled;
        }
        if let Some(enabled) = overrides.caching {
            self.features.caching = enabled;
        }
        if let Some(k) = overrides.top_k_final {
            self.retrieval.top_k_final = k;
        }
        if let Some(chars) = overrides.max_context_chars {
            self.compression.max_context_chars = chars;
        }
        if let Some(ms) = overrides.request_deadline_ms {
            self.timeouts.request_deadline_ms = ms;
        }
        tracing::info!("Applied configuration profile: {}", profile);
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: QUARRY_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `SECTION__KEY=value` style overrides from any source
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("QUARRY_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "FEATURES__HYBRID_SEARCH" => self.features.hybrid_search = parse_value(path, value)?,
            "FEATURES__RERANKING" => self.features.reranking = parse_value(path, value)?,
            "FEATURES__QUALITY_FILTER" => self.features.quality_filter = parse_value(path, value)?,
            "FEATURES__DIVERSITY" => self.features.diversity = parse_value(path, value)?,
            "FEATURES__DECOMPOSITION" => self.features.decomposition = parse_value(path, value)?,
            "FEATURES__COMPRESSION" => self.features.compression = parse_value(path, value)?,
            "FEATURES__CACHING" => self.features.caching = parse_value(path, value)?,
            "FEATURES__CONVERSATION_MEMORY" => {
                self.features.conversation_memory = parse_value(path, value)?
            }
            "FEATURES__EVIDENCE_EXTRACTION" => {
                self.features.evidence_extraction = parse_value(path, value)?
            }
            "RETRIEVAL__TOP_K_INITIAL" => self.retrieval.top_k_initial = parse_value(path, value)?,
            "RETRIEVAL__TOP_K_FINAL" => self.retrieval.top_k_final = parse_value(path, value)?,
            "RETRIEVAL__RRF_K" => self.retrieval.rrf_k = parse_value(path, value)?,
            "RETRIEVAL__RERANK_TOP_N" => self.retrieval.rerank_top_n = parse_value(path, value)?,
            "DIVERSITY__MMR_LAMBDA" => self.diversity.mmr_lambda = parse_value(path, value)?,
            "DIVERSITY__MAX_CHUNKS_PER_PAGE" => {
                self.diversity.max_chunks_per_page = parse_value(path, value)?
            }
            "COMPRESSION__MAX_CONTEXT_CHARS" => {
                self.compression.max_context_chars = parse_value(path, value)?
            }
            "TIMEOUTS__REQUEST_DEADLINE_MS" => {
                self.timeouts.request_deadline_ms = parse_value(path, value)?
            }
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Freeze the query-path settings
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            features: self.features.clone(),
            retrieval: self.retrieval.clone(),
            quality: self.quality.clone(),
            diversity: self.diversity.clone(),
            evidence: self.evidence.clone(),
            compression: self.compression.clone(),
            routing: self.routing.clone(),
            timeouts: self.timeouts.clone(),
            cache: self.cache.clone(),
            session: self.session.clone(),
            indexing: self.indexing.clone(),
        }
    }

    /// Shared handle to the frozen pipeline settings
    pub fn shared_pipeline(&self) -> Arc<PipelineConfig> {
        Arc::new(self.pipeline())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| QuarryError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("quarry").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| QuarryError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".quarry"))
    }
}

fn parse_value<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| QuarryError::InvalidConfigValue {
            path: path.to_string(),
            message: format!("Cannot parse '{}'", value),
        })
}

impl Default for Config {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "fast".to_string(),
            ProfileOverrides {
                reranking: Some(false),
                decomposition: Some(false),
                request_deadline_ms: Some(3_000),
                ..ProfileOverrides::default()
            },
        );

        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            features: FeatureFlags::default(),
            retrieval: RetrievalConfig::default(),
            quality: QualityConfig::default(),
            diversity: DiversityConfig::default(),
            evidence: EvidenceConfig::default(),
            compression: CompressionConfig::default(),
            routing: RoutingConfig::default(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            timeouts: TimeoutConfig::default(),
            embedding: EmbeddingConfig::default(),
            indexing: IndexingConfig::default(),
            storage: StorageConfig::default(),
            feedback: FeedbackConfig::default(),
            profiles,
        }
    }
}
