//! Caller-supplied ratings of result bundles
//!
//! Purely observational: nothing here feeds back into ranking. Records are
//! kept in memory for aggregate stats and optionally appended to a JSONL log.

use crate::clock::SharedClock;
use crate::config::FeedbackConfig;
use crate::routing::{QueryType, Route};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const MAX_RECENT: usize = 1000;
const MAX_COMMENT_CHARS: usize = 500;
const LOW_RATED_QUERY_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Feedback log IO error at {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("Feedback serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A 1..=5 rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rating(u8);

impl Rating {
    /// Out-of-range input is clamped rather than rejected
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(1, 5) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn label(&self) -> &'static str {
        match self.0 {
            1 => "very_bad",
            2 => "bad",
            3 => "neutral",
            4 => "good",
            _ => "excellent",
        }
    }

    pub fn is_positive(&self) -> bool {
        self.0 >= 4
    }

    pub fn is_negative(&self) -> bool {
        self.0 <= 2
    }
}

/// What the caller reports
#[derive(Debug, Clone)]
pub struct FeedbackInput {
    pub query: String,
    pub bundle_id: Uuid,
    pub rating: i64,
    pub comment: Option<String>,
    pub query_type: Option<QueryType>,
    pub route: Option<Route>,
}

impl FeedbackInput {
    pub fn new(query: impl Into<String>, bundle_id: Uuid, rating: i64) -> Self {
        Self {
            query: query.into(),
            bundle_id,
            rating,
            comment: None,
            query_type: None,
            route: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_routing(mut self, query_type: QueryType, route: Route) -> Self {
        self.query_type = Some(query_type);
        self.route = Some(route);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub query: String,
    pub bundle_id: Uuid,
    pub rating: Rating,
    pub rating_label: String,
    pub comment: Option<String>,
    pub query_type: Option<QueryType>,
    pub route: Option<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowRatedQuery {
    pub query: String,
    pub bundle_id: Uuid,
    pub rating: Rating,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub count: u64,
    pub total: u64,
    pub average: f64,
}

impl RatingSummary {
    fn add(&mut self, rating: Rating) {
        self.count += 1;
        self.total += rating.value() as u64;
        self.average = self.total as f64 / self.count as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total: u64,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub average_rating: f64,
    /// Percentage of positive ratings
    pub satisfaction_rate: f64,
    pub by_query_type: HashMap<String, RatingSummary>,
    pub by_route: HashMap<String, RatingSummary>,
    pub low_rated_count: usize,
}

#[derive(Default)]
struct Inner {
    overall: RatingSummary,
    positive: u64,
    negative: u64,
    neutral: u64,
    by_query_type: HashMap<String, RatingSummary>,
    by_route: HashMap<String, RatingSummary>,
    low_rated: VecDeque<LowRatedQuery>,
    recent: VecDeque<FeedbackRecord>,
}

pub struct FeedbackCollector {
    inner: Mutex<Inner>,
    log_file: Option<PathBuf>,
    max_low_rated: usize,
    clock: SharedClock,
}

impl FeedbackCollector {
    pub fn new(config: &FeedbackConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            log_file: config.log_file.clone(),
            max_low_rated: config.max_low_rated,
            clock,
        }
    }

    /// Record one rating
    ///
    /// Statistics are updated even if appending to the log fails; the error
    /// is returned so the caller knows the record was not persisted.
    pub fn record(&self, input: FeedbackInput) -> Result<FeedbackRecord, FeedbackError> {
        let rating = Rating::clamped(input.rating);
        let record = FeedbackRecord {
            id: Uuid::new_v4(),
            recorded_at: self.clock.now(),
            query: input.query,
            bundle_id: input.bundle_id,
            rating,
            rating_label: rating.label().to_string(),
            comment: input
                .comment
                .map(|c| c.chars().take(MAX_COMMENT_CHARS).collect()),
            query_type: input.query_type,
            route: input.route,
        };

        self.update_stats(&record);
        tracing::info!(
            "Recorded feedback {} ({}) for bundle {}",
            rating.value(),
            rating.label(),
            record.bundle_id
        );

        if let Some(path) = &self.log_file {
            append_jsonl(path, &record)?;
        }
        Ok(record)
    }

    /// Rebuild in-memory statistics from the configured log, if it exists
    ///
    /// Returns the number of records replayed.
    pub fn restore(&self) -> Result<usize, FeedbackError> {
        let Some(path) = self.log_file.as_deref().filter(|p| p.exists()) else {
            return Ok(0);
        };
        let records = read_log(path)?;
        for record in &records {
            self.update_stats(record);
        }
        tracing::debug!("Replayed {} feedback records from {:?}", records.len(), path);
        Ok(records.len())
    }

    fn update_stats(&self, record: &FeedbackRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let rating = record.rating;

        inner.overall.add(rating);
        if rating.is_positive() {
            inner.positive += 1;
        } else if rating.is_negative() {
            inner.negative += 1;
            inner.low_rated.push_back(LowRatedQuery {
                query: record.query.chars().take(LOW_RATED_QUERY_CHARS).collect(),
                bundle_id: record.bundle_id,
                rating,
                recorded_at: record.recorded_at,
            });
            while inner.low_rated.len() > self.max_low_rated {
                inner.low_rated.pop_front();
            }
        } else {
            inner.neutral += 1;
        }

        let type_key = record
            .query_type
            .map_or("unknown", |t| t.as_str())
            .to_string();
        inner.by_query_type.entry(type_key).or_default().add(rating);
        let route_key = record.route.map_or("unknown", |r| r.as_str()).to_string();
        inner.by_route.entry(route_key).or_default().add(rating);

        inner.recent.push_back(record.clone());
        while inner.recent.len() > MAX_RECENT {
            inner.recent.pop_front();
        }
    }

    pub fn stats(&self) -> FeedbackStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = inner.overall.count;
        FeedbackStats {
            total,
            positive: inner.positive,
            negative: inner.negative,
            neutral: inner.neutral,
            average_rating: inner.overall.average,
            satisfaction_rate: inner.positive as f64 / total.max(1) as f64 * 100.0,
            by_query_type: inner.by_query_type.clone(),
            by_route: inner.by_route.clone(),
            low_rated_count: inner.low_rated.len(),
        }
    }

    /// Most recent low-rated queries, oldest first
    pub fn low_rated(&self, limit: usize) -> Vec<LowRatedQuery> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.low_rated.len().saturating_sub(limit);
        inner.low_rated.iter().skip(skip).cloned().collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<FeedbackRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    /// Write stats, low-rated queries and records rated at least `min_rating` as JSON
    pub fn export_json(&self, path: &Path, min_rating: u8) -> Result<(), FeedbackError> {
        let records: Vec<FeedbackRecord> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .recent
                .iter()
                .filter(|r| r.rating.value() >= min_rating)
                .cloned()
                .collect()
        };
        let export = serde_json::json!({
            "exported_at": self.clock.now(),
            "stats": self.stats(),
            "low_rated": self.low_rated(self.max_low_rated),
            "records": records,
        });
        let content = serde_json::to_string_pretty(&export)?;
        std::fs::write(path, content).map_err(|e| FeedbackError::Io {
            source: e,
            path: path.to_path_buf(),
        })?;
        tracing::info!("Exported feedback to {:?}", path);
        Ok(())
    }
}

fn append_jsonl(path: &Path, record: &FeedbackRecord) -> Result<(), FeedbackError> {
    let io_err = |e: std::io::Error| FeedbackError::Io {
        source: e,
        path: path.to_path_buf(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{}", line).map_err(io_err)?;
    Ok(())
}

/// Read every record from a JSONL feedback log, skipping blank lines
pub fn read_log(path: &Path) -> Result<Vec<FeedbackRecord>, FeedbackError> {
    let file = std::fs::File::open(path).map_err(|e| FeedbackError::Io {
        source: e,
        path: path.to_path_buf(),
    })?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| FeedbackError::Io {
            source: e,
            path: path.to_path_buf(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn collector(log_file: Option<PathBuf>, max_low_rated: usize) -> FeedbackCollector {
        FeedbackCollector::new(
            &FeedbackConfig {
                log_file,
                max_low_rated,
            },
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn test_rating_clamped_and_labelled() {
        assert_eq!(Rating::clamped(-3).value(), 1);
        assert_eq!(Rating::clamped(9).value(), 5);
        assert_eq!(Rating::clamped(3).label(), "neutral");
        assert!(Rating::clamped(4).is_positive());
        assert!(Rating::clamped(2).is_negative());
    }

    #[test]
    fn test_stats_by_type_and_route() {
        let c = collector(None, 50);
        let bundle = Uuid::new_v4();
        c.record(FeedbackInput::new("Who is Rama?", bundle, 5).with_routing(QueryType::Factual, Route::FastFactual))
            .unwrap();
        c.record(FeedbackInput::new("Who is Sita?", bundle, 3).with_routing(QueryType::Factual, Route::FastFactual))
            .unwrap();
        c.record(FeedbackInput::new("Compare them", bundle, 1)).unwrap();

        let stats = c.stats();
        assert_eq!(stats.total, 3);
        assert_eq!((stats.positive, stats.neutral, stats.negative), (1, 1, 1));
        assert!((stats.average_rating - 3.0).abs() < 1e-9);
        assert_eq!(stats.by_query_type["factual"].count, 2);
        assert!((stats.by_route["fast_factual"].average - 4.0).abs() < 1e-9);
        assert_eq!(stats.by_query_type["unknown"].count, 1);
        assert_eq!(stats.low_rated_count, 1);
    }

    #[test]
    fn test_low_rated_is_bounded() {
        let c = collector(None, 2);
        for i in 0..5 {
            c.record(FeedbackInput::new(format!("q{}", i), Uuid::new_v4(), 1)).unwrap();
        }
        let low: Vec<String> = c.low_rated(10).into_iter().map(|l| l.query).collect();
        assert_eq!(low, vec!["q3", "q4"]);
    }

    #[test]
    fn test_jsonl_log_and_export() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("feedback.jsonl");
        let c = collector(Some(log.clone()), 50);
        c.record(FeedbackInput::new("Who is Rama?", Uuid::new_v4(), 5).with_comment("clear"))
            .unwrap();
        c.record(FeedbackInput::new("Who is Sita?", Uuid::new_v4(), 2)).unwrap();

        let records = read_log(&log).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].comment.as_deref(), Some("clear"));
        assert_eq!(records[1].rating_label, "bad");

        let export = dir.path().join("export.json");
        c.export_json(&export, 4).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&export).unwrap()).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 1);
        assert_eq!(value["stats"]["total"], 2);
    }

    #[test]
    fn test_restore_replays_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("feedback.jsonl");
        let first = collector(Some(log.clone()), 50);
        first.record(FeedbackInput::new("Who is Rama?", Uuid::new_v4(), 5)).unwrap();
        first.record(FeedbackInput::new("Who is Sita?", Uuid::new_v4(), 1)).unwrap();

        let second = collector(Some(log), 50);
        assert_eq!(second.restore().unwrap(), 2);
        let stats = second.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.low_rated_count, 1);

        assert_eq!(collector(None, 50).restore().unwrap(), 0);
    }
}
