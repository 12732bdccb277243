use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{QuarryError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem before failing
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_quality(config, &mut errors);
        Self::validate_diversity(config, &mut errors);
        Self::validate_evidence(config, &mut errors);
        Self::validate_compression(config, &mut errors);
        Self::validate_routing(config, &mut errors);
        Self::validate_stores(config, &mut errors);
        Self::validate_timeouts(config, &mut errors);
        Self::validate_indexing(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(QuarryError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let r = &config.retrieval;
        if r.top_k_initial == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k_initial",
                "Must be greater than 0",
            ));
        }
        if r.top_k_final == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k_final",
                "Must be greater than 0",
            ));
        }
        if r.top_k_final > r.top_k_initial {
            errors.push(ValidationError::new(
                "retrieval.top_k_final",
                format!(
                    "Cannot exceed top_k_initial ({} > {})",
                    r.top_k_final, r.top_k_initial
                ),
            ));
        }
        if r.rrf_k <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                format!("Must be positive, got {}", r.rrf_k),
            ));
        }
        if r.keyword_weight <= 0.0 || r.vector_weight <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.keyword_weight",
                "Fusion weights must be positive",
            ));
        }
        if r.rerank_top_n == 0 {
            errors.push(ValidationError::new(
                "retrieval.rerank_top_n",
                "Must be greater than 0",
            ));
        }
        if r.max_query_chars == 0 {
            errors.push(ValidationError::new(
                "retrieval.max_query_chars",
                "Must be greater than 0",
            ));
        }
    }

    fn validate_quality(config: &Config, errors: &mut Vec<ValidationError>) {
        let q = &config.quality;
        if !(0.0..=1.0).contains(&q.penalty_weight) {
            errors.push(ValidationError::new(
                "quality.penalty_weight",
                format!("Must be between 0.0 and 1.0, got {}", q.penalty_weight),
            ));
        }
        for (source, weight) in &q.source_weights {
            if !(0.0..=2.0).contains(weight) {
                errors.push(ValidationError::new(
                    format!("quality.source_weights.{}", source),
                    format!("Must be between 0.0 and 2.0, got {}", weight),
                ));
            }
        }
    }

    fn validate_diversity(config: &Config, errors: &mut Vec<ValidationError>) {
        let d = &config.diversity;
        if !(0.0..=1.0).contains(&d.mmr_lambda) {
            errors.push(ValidationError::new(
                "diversity.mmr_lambda",
                format!("Must be between 0.0 and 1.0, got {}", d.mmr_lambda),
            ));
        }
        if d.mmr_similarity_threshold <= 0.0 || d.mmr_similarity_threshold > 1.0 {
            errors.push(ValidationError::new(
                "diversity.mmr_similarity_threshold",
                format!(
                    "Must be in (0.0, 1.0], got {}",
                    d.mmr_similarity_threshold
                ),
            ));
        }
        if d.max_chunks_per_page == 0 {
            errors.push(ValidationError::new(
                "diversity.max_chunks_per_page",
                "Must be greater than 0",
            ));
        }
    }

    fn validate_evidence(config: &Config, errors: &mut Vec<ValidationError>) {
        let e = &config.evidence;
        if e.max_sentences == 0 || e.max_sentences_per_chunk == 0 {
            errors.push(ValidationError::new(
                "evidence.max_sentences",
                "Sentence limits must be greater than 0",
            ));
        }
        if !(-1.0..=1.0).contains(&e.similarity_threshold) {
            errors.push(ValidationError::new(
                "evidence.similarity_threshold",
                format!("Must be between -1.0 and 1.0, got {}", e.similarity_threshold),
            ));
        }
        if e.min_sentence_chars >= e.max_sentence_chars {
            errors.push(ValidationError::new(
                "evidence.min_sentence_chars",
                "Must be smaller than max_sentence_chars",
            ));
        }
    }

    fn validate_compression(config: &Config, errors: &mut Vec<ValidationError>) {
        let c = &config.compression;
        if c.max_context_chars == 0 {
            errors.push(ValidationError::new(
                "compression.max_context_chars",
                "Must be greater than 0",
            ));
        }
        if c.min_sources == 0 {
            errors.push(ValidationError::new(
                "compression.min_sources",
                "Must be greater than 0",
            ));
        }
        if c.compression_threshold <= 0.0 || c.compression_threshold > 1.0 {
            errors.push(ValidationError::new(
                "compression.compression_threshold",
                format!("Must be in (0.0, 1.0], got {}", c.compression_threshold),
            ));
        }
    }

    fn validate_routing(config: &Config, errors: &mut Vec<ValidationError>) {
        let r = &config.routing;
        if !(0.0..=1.0).contains(&r.ambiguity_threshold) {
            errors.push(ValidationError::new(
                "routing.ambiguity_threshold",
                format!("Must be between 0.0 and 1.0, got {}", r.ambiguity_threshold),
            ));
        }
        if r.max_sub_queries < 2 {
            errors.push(ValidationError::new(
                "routing.max_sub_queries",
                format!("Must be at least 2, got {}", r.max_sub_queries),
            ));
        }
        if r.max_docs_per_subquery == 0 {
            errors.push(ValidationError::new(
                "routing.max_docs_per_subquery",
                "Must be greater than 0",
            ));
        }
    }

    fn validate_stores(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.max_entries == 0 {
            errors.push(ValidationError::new(
                "cache.max_entries",
                "Must be greater than 0",
            ));
        }
        if config.cache.ttl_secs == 0 {
            errors.push(ValidationError::new("cache.ttl_secs", "Must be greater than 0"));
        }
        if config.session.max_history == 0 {
            errors.push(ValidationError::new(
                "session.max_history",
                "Must be greater than 0",
            ));
        }
        if config.session.max_age_secs == 0 {
            errors.push(ValidationError::new(
                "session.max_age_secs",
                "Must be greater than 0",
            ));
        }
    }

    fn validate_timeouts(config: &Config, errors: &mut Vec<ValidationError>) {
        let t = &config.timeouts;
        if t.request_deadline_ms == 0 {
            errors.push(ValidationError::new(
                "timeouts.request_deadline_ms",
                "Must be greater than 0",
            ));
            return;
        }

        // Every external call must give up before the request does
        let external = [
            ("timeouts.backend_timeout_ms", t.backend_timeout_ms),
            ("timeouts.embed_timeout_ms", t.embed_timeout_ms),
            ("timeouts.rerank_timeout_ms", t.rerank_timeout_ms),
            ("timeouts.classifier_timeout_ms", t.classifier_timeout_ms),
        ];
        for (path, value) in external {
            if value == 0 || value >= t.request_deadline_ms {
                errors.push(ValidationError::new(
                    path,
                    format!(
                        "Must be between 1 and request_deadline_ms ({}), got {}",
                        t.request_deadline_ms, value
                    ),
                ));
            }
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Must be greater than 0",
            ));
        }
        let i = &config.indexing;
        if i.hnsw_m == 0 || i.hnsw_ef_construction == 0 || i.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "indexing",
                "HNSW parameters must be greater than 0",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_schema_version() {
        let mut config = Config::default();
        config.meta.schema_version = "2.0.0".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = Config::default();
        config.diversity.mmr_lambda = 1.5;
        config.retrieval.top_k_final = 0;
        config.quality.source_weights.insert("bad.pdf".to_string(), 3.0);

        match ConfigValidator::validate(&config) {
            Err(QuarryError::ConfigValidation { errors }) => {
                let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
                assert!(paths.contains(&"diversity.mmr_lambda"));
                assert!(paths.contains(&"retrieval.top_k_final"));
                assert!(paths.contains(&"quality.source_weights.bad.pdf"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_external_timeouts_must_fit_deadline() {
        let mut config = Config::default();
        config.timeouts.rerank_timeout_ms = config.timeouts.request_deadline_ms;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_top_k_final_cannot_exceed_initial() {
        let mut config = Config::default();
        config.retrieval.top_k_initial = 4;
        config.retrieval.top_k_final = 5;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
