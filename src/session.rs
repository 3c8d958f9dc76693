//! Conversation session state
//!
//! One `ConversationSession` exists per monitored conversation. It is created
//! when monitoring starts and dropped when monitoring stops; nothing here is
//! persisted.

use crate::metrics::QualityMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Parse a transcript role label; other roles (system, tool) are not turns.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Self::User),
            "assistant" | "ai" | "model" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One observed message. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub observed_at: DateTime<Utc>,
    pub sequence_index: usize,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>, sequence_index: usize) -> Self {
        Self {
            role,
            content: content.into(),
            observed_at: Utc::now(),
            sequence_index,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

/// Session handle shared between the detector, orchestrator and budget task.
pub type SharedSession = Arc<RwLock<ConversationSession>>;

/// State of one monitored conversation
#[derive(Debug, Clone)]
pub struct ConversationSession {
    id: String,
    turns: Vec<ConversationTurn>,
    /// Non-decreasing, always <= turns.len()
    last_observed_turn_count: usize,
    /// Turn count at the last dispatched turn-flow analysis
    last_paired_turn_count: usize,
    pub metrics: QualityMetrics,
}

impl ConversationSession {
    pub fn new(issue_log_capacity: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turns: Vec::new(),
            last_observed_turn_count: 0,
            last_paired_turn_count: 0,
            metrics: QualityMetrics::with_capacity(issue_log_capacity),
        }
    }

    pub fn shared(issue_log_capacity: usize) -> SharedSession {
        Arc::new(RwLock::new(Self::new(issue_log_capacity)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last_observed_turn_count(&self) -> usize {
        self.last_observed_turn_count
    }

    pub fn last_paired_turn_count(&self) -> usize {
        self.last_paired_turn_count
    }

    /// Merge a fresh read of the conversation into the session.
    ///
    /// Only turns beyond what the session already holds are appended; their
    /// sequence indices are reassigned so they stay strictly increasing. A
    /// shorter read (e.g. the page re-rendered) never shrinks the session.
    /// Returns the number of appended turns.
    pub fn observe(&mut self, read: &[ConversationTurn]) -> usize {
        let known = self.turns.len();
        if read.len() <= known {
            return 0;
        }
        for (offset, turn) in read[known..].iter().enumerate() {
            let mut turn = turn.clone();
            turn.sequence_index = known + offset;
            self.turns.push(turn);
        }
        self.last_observed_turn_count = self.last_observed_turn_count.max(self.turns.len());
        read.len() - known
    }

    /// Advance the pairing point after a turn-flow dispatch.
    pub fn mark_paired(&mut self, turn_count: usize) {
        self.last_paired_turn_count = self
            .last_paired_turn_count
            .max(turn_count.min(self.turns.len()));
    }
}
