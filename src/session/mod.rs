//! Conversation memory
//!
//! Keeps the last few turns of each session so that short follow-ups
//! ("tell me more about him") can be expanded with the entities of the
//! previous turn before classification. History is FIFO-bounded and a
//! session expires after a fixed idle time.

mod entities;

pub use entities::{extract_entities, has_named_entity, is_follow_up};

use crate::clock::SharedClock;
use crate::config::SessionConfig;
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

const EXPANSION_ENTITIES: usize = 3;
const CONTEXT_TURNS: usize = 3;

/// One completed query in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub query: String,
    pub summary: String,
    pub entities: Vec<String>,
    pub at: DateTime<Utc>,
}

/// What the classifier needs to know about the conversation so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub has_history: bool,
    pub is_follow_up: bool,
    /// Most recent last
    pub previous_queries: Vec<String>,
    /// Entities of the most recent turn
    pub previous_entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuery {
    pub text: String,
    pub expanded: bool,
    pub context: ConversationContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_turns: usize,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    /// Entries held in memory, idle ones not yet swept included
    pub stored_sessions: usize,
}

#[derive(Debug)]
struct SessionState {
    turns: VecDeque<Turn>,
    last_activity: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: AHashMap<String, SessionState>,
    sessions_created: u64,
    sessions_expired: u64,
    last_sweep: Option<DateTime<Utc>>,
}

/// Session-keyed turn history shared by all requests
pub struct ConversationMemory {
    inner: RwLock<Inner>,
    max_history: usize,
    max_age: Duration,
    clock: SharedClock,
}

impl ConversationMemory {
    pub fn new(config: &SessionConfig, clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_history: config.max_history.max(1),
            max_age: Duration::seconds(config.max_age_secs as i64),
            clock,
        }
    }

    fn is_expired(&self, state: &SessionState, now: DateTime<Utc>) -> bool {
        now - state.last_activity > self.max_age
    }

    /// Record a completed turn; the oldest turn goes once the history is full
    pub fn append(&self, session_id: &str, query: &str, summary: &str) -> Turn {
        let now = self.clock.now();
        let mut entities = extract_entities(query);
        for entity in extract_entities(summary) {
            if entities.len() == 10 {
                break;
            }
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }
        let turn = Turn {
            query: query.to_string(),
            summary: summary.to_string(),
            entities,
            at: now,
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let expired = inner
            .sessions
            .get(session_id)
            .is_some_and(|s| self.is_expired(s, now));
        if expired {
            inner.sessions.remove(session_id);
            inner.sessions_expired += 1;
        }
        // Idle sessions are dropped here at most once per max_age, so the
        // map stays bounded by recent traffic without a caller-driven purge
        let due = inner.last_sweep.map_or(true, |at| now - at > self.max_age);
        if due {
            self.sweep(&mut inner, now);
        }
        if !inner.sessions.contains_key(session_id) {
            inner.sessions_created += 1;
            tracing::debug!("Started conversation session {}", session_id);
        }

        let state = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                turns: VecDeque::new(),
                last_activity: now,
            });
        state.turns.push_back(turn.clone());
        while state.turns.len() > self.max_history {
            state.turns.pop_front();
        }
        state.last_activity = now;
        turn
    }

    /// Last `last_n` turns, oldest first; empty for unknown or expired sessions
    pub fn history(&self, session_id: &str, last_n: Option<usize>) -> Vec<Turn> {
        let now = self.clock.now();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(state) = inner
            .sessions
            .get(session_id)
            .filter(|s| !self.is_expired(s, now))
        else {
            return Vec::new();
        };
        let skip = last_n.map_or(0, |n| state.turns.len().saturating_sub(n));
        state.turns.iter().skip(skip).cloned().collect()
    }

    pub fn context(&self, session_id: &str, query: &str) -> ConversationContext {
        let recent = self.history(session_id, Some(CONTEXT_TURNS));
        if recent.is_empty() {
            return ConversationContext::default();
        }
        ConversationContext {
            has_history: true,
            is_follow_up: is_follow_up(query),
            previous_entities: recent.last().map(|t| t.entities.clone()).unwrap_or_default(),
            previous_queries: recent.into_iter().map(|t| t.query).collect(),
        }
    }

    /// Expand a follow-up with the previous turn's key entities
    pub fn resolve(&self, session_id: &str, query: &str) -> ResolvedQuery {
        let context = self.context(session_id, query);
        if !context.is_follow_up || context.previous_entities.is_empty() {
            return ResolvedQuery {
                text: query.to_string(),
                expanded: false,
                context,
            };
        }

        let additions: Vec<&str> = context
            .previous_entities
            .iter()
            .take(EXPANSION_ENTITIES)
            .map(|s| s.as_str())
            .collect();
        let text = format!("{} {}", query, additions.join(" "));
        tracing::debug!("Expanded follow-up '{}' to '{}'", query, text);
        ResolvedQuery {
            text,
            expanded: true,
            context,
        }
    }

    /// Returns whether the session existed
    pub fn clear(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.sessions.remove(session_id).is_some()
    }

    /// Drop every idle session; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        self.sweep(&mut inner, now)
    }

    fn sweep(&self, inner: &mut Inner, now: DateTime<Utc>) -> usize {
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|_, s| now - s.last_activity <= self.max_age);
        let removed = before - inner.sessions.len();
        inner.sessions_expired += removed as u64;
        inner.last_sweep = Some(now);
        if removed > 0 {
            tracing::info!("Purged {} expired conversation sessions", removed);
        }
        removed
    }

    pub fn stats(&self) -> SessionStats {
        let now = self.clock.now();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let live: Vec<&SessionState> = inner
            .sessions
            .values()
            .filter(|s| !self.is_expired(s, now))
            .collect();
        SessionStats {
            active_sessions: live.len(),
            total_turns: live.iter().map(|s| s.turns.len()).sum(),
            sessions_created: inner.sessions_created,
            sessions_expired: inner.sessions_expired,
            stored_sessions: inner.sessions.len(),
        }
    }
}
