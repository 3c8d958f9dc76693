//! Wire contracts with the analysis backend and the presentation layer
//!
//! Remote payloads use camelCase JSON. Presentation events are emitted as
//! `{"method": "coach/...", "params": {...}}` notifications.

use crate::knowledge::ContextBridge;
use crate::metrics::QualityMetrics;
use crate::monitor::budget::ContextBudgetReading;
use crate::session::{ConversationTurn, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Context label used when nothing better is known
pub const GENERAL_CONTEXT: &str = "general";

// ─── Prompt quality ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PromptQualityRequest {
    pub prompt: String,
}

/// Score and feedback for a draft prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAnalysis {
    pub score: f64,
    #[serde(default = "general_context")]
    pub context: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub analysis: String,
    /// Set on locally produced fallbacks
    #[serde(default)]
    pub error: bool,
}

fn general_context() -> String {
    GENERAL_CONTEXT.to_string()
}

impl PromptAnalysis {
    /// Neutral result used when the scoring service fails or times out
    pub fn fallback() -> Self {
        Self {
            score: 3.0,
            context: general_context(),
            strengths: Vec::new(),
            suggestions: vec!["AI analysis temporarily unavailable".to_string()],
            analysis: "Using basic analysis - analysis service unavailable".to_string(),
            error: true,
        }
    }

    /// Canned feedback for prompts below the minimum length; no remote call
    pub fn too_short(min_chars: usize) -> Self {
        Self {
            score: 1.0,
            context: general_context(),
            strengths: Vec::new(),
            suggestions: vec!["Add more details for AI analysis".to_string()],
            analysis: format!("Type at least {} characters for full AI analysis", min_chars),
            error: false,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.score = clamp_score(self.score);
        if self.context.trim().is_empty() {
            self.context = general_context();
        }
        self
    }
}

// ─── Turn flow ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnFlowRequest {
    pub user_message: String,
    pub assistant_message: String,
    pub history: Vec<ConversationTurn>,
    pub session_id: String,
}

/// Classification of a turn pair reported by the flow scorer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueKind {
    Good,
    OffTopic,
    Repetitive,
    Unclear,
    Incomplete,
    /// Local fallback when the flow scorer failed
    ApiError,
    Other(String),
}

impl IssueKind {
    pub fn is_good(&self) -> bool {
        matches!(self, IssueKind::Good)
    }

    pub fn as_str(&self) -> &str {
        match self {
            IssueKind::Good => "good",
            IssueKind::OffTopic => "off_topic",
            IssueKind::Repetitive => "repetitive",
            IssueKind::Unclear => "unclear",
            IssueKind::Incomplete => "incomplete",
            IssueKind::ApiError => "api_error",
            IssueKind::Other(s) => s,
        }
    }
}

impl From<String> for IssueKind {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "good" | "none" | "" => IssueKind::Good,
            "off_topic" | "drift" | "topic_drift" => IssueKind::OffTopic,
            "repetitive" | "repetition" => IssueKind::Repetitive,
            "unclear" | "confusing" => IssueKind::Unclear,
            "incomplete" => IssueKind::Incomplete,
            "api_error" => IssueKind::ApiError,
            _ => IssueKind::Other(normalized),
        }
    }
}

impl From<IssueKind> for String {
    fn from(value: IssueKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Improving,
    Declining,
    #[default]
    Stable,
}

/// Flow score and feedback for one (user, assistant) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAnalysis {
    pub flow_score: f64,
    pub issue_kind: IssueKind,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub analysis: String,
}

impl FlowAnalysis {
    /// "Assume neutral" reading used when the flow scorer fails; never retried
    pub fn fallback() -> Self {
        Self {
            flow_score: 6.0,
            issue_kind: IssueKind::ApiError,
            suggestions: Vec::new(),
            direction: Direction::Stable,
            analysis: "Flow analysis unavailable".to_string(),
        }
    }

    pub fn normalized(mut self) -> Self {
        self.flow_score = clamp_score(self.flow_score);
        self
    }
}

// ─── Follow-up ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpRequest {
    pub history: Vec<ConversationTurn>,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpSuggestion {
    pub followup_question: String,
    #[serde(default = "general_context")]
    pub context: String,
}

// ─── Context budget ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ContextBudgetRequest {
    pub conversation: Vec<ConversationTurn>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEstimate {
    pub estimated_tokens: u64,
    pub limit: u64,
    #[serde(default)]
    pub usage_fraction: Option<f64>,
    #[serde(default)]
    pub approaching_limit: bool,
    #[serde(default)]
    pub critical: bool,
}

// ─── Context bridge ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBridgeRequest {
    pub conversation: Vec<ConversationTurn>,
    pub search_query: String,
    pub token_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub context_injection: String,
    #[serde(default)]
    pub compression_ratio_percent: f64,
}

// ─── Knowledge graph ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeGraphRequest {
    pub time_range_days: u32,
    pub max_nodes: u32,
}

/// A prior memory owned by the knowledge-graph service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "topics")]
    pub topic_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStats {
    #[serde(default)]
    pub total_memories: u64,
    #[serde(default)]
    pub total_topics: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub nodes: Vec<MemoryItem>,
    #[serde(default)]
    pub stats: KnowledgeStats,
}

// ─── Memory store ───────────────────────────────────────────────────

/// Transcript line as captured from the chat surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&ConversationTurn> for TranscriptMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role.to_string(),
            content: turn.content.clone(),
            timestamp: Some(turn.observed_at),
        }
    }
}

impl TranscriptMessage {
    pub fn role(&self) -> Option<Role> {
        Role::from_label(&self.role)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveConversationRequest {
    pub messages: Vec<TranscriptMessage>,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMemory {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "message_count")]
    pub message_count: usize,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMemoryRequest {
    pub query: String,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub content: String,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub memories: Vec<MemoryHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

// ─── Request union ──────────────────────────────────────────────────

/// Kind of remote analysis request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisKind {
    PromptQuality,
    TurnFlow,
    FollowUp,
    ContextBudget,
    ContextBridge,
    KnowledgeGraph,
    SaveConversation,
    SearchMemory,
}

impl AnalysisKind {
    /// Endpoint path relative to the backend base URL
    pub fn endpoint(&self) -> &'static str {
        match self {
            AnalysisKind::PromptQuality => "analyze_prompt",
            AnalysisKind::TurnFlow => "analyze_turn_flow",
            AnalysisKind::FollowUp => "generate_followup",
            AnalysisKind::ContextBudget => "estimate_context",
            AnalysisKind::ContextBridge => "context_bridge",
            AnalysisKind::KnowledgeGraph => "knowledge_graph",
            AnalysisKind::SaveConversation => "save_conversation",
            AnalysisKind::SearchMemory => "search_memory",
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// One outgoing request; serializes to the payload of its variant.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AnalysisRequest<'a> {
    PromptQuality(&'a PromptQualityRequest),
    TurnFlow(&'a TurnFlowRequest),
    FollowUp(&'a FollowUpRequest),
    ContextBudget(&'a ContextBudgetRequest),
    ContextBridge(&'a ContextBridgeRequest),
    KnowledgeGraph(&'a KnowledgeGraphRequest),
    SaveConversation(&'a SaveConversationRequest),
    SearchMemory(&'a SearchMemoryRequest),
}

impl AnalysisRequest<'_> {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            AnalysisRequest::PromptQuality(_) => AnalysisKind::PromptQuality,
            AnalysisRequest::TurnFlow(_) => AnalysisKind::TurnFlow,
            AnalysisRequest::FollowUp(_) => AnalysisKind::FollowUp,
            AnalysisRequest::ContextBudget(_) => AnalysisKind::ContextBudget,
            AnalysisRequest::ContextBridge(_) => AnalysisKind::ContextBridge,
            AnalysisRequest::KnowledgeGraph(_) => AnalysisKind::KnowledgeGraph,
            AnalysisRequest::SaveConversation(_) => AnalysisKind::SaveConversation,
            AnalysisRequest::SearchMemory(_) => AnalysisKind::SearchMemory,
        }
    }
}

// ─── Presentation events ────────────────────────────────────────────

/// Events consumed by the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum CoachEvent {
    /// Draft input was cleared
    #[serde(rename = "coach/promptIdle")]
    PromptIdle,

    #[serde(rename = "coach/promptAnalysisUpdated")]
    PromptAnalysisUpdated {
        /// The exact text that was scored
        text: String,
        analysis: PromptAnalysis,
    },

    #[serde(rename = "coach/flowAnalysisUpdated", rename_all = "camelCase")]
    FlowAnalysisUpdated {
        analysis: FlowAnalysis,
        metrics: QualityMetrics,
        /// Badge signal: this turn added an issue to the log
        new_issue: bool,
    },

    #[serde(rename = "coach/followUpReady")]
    FollowUpReady(FollowUpSuggestion),

    #[serde(rename = "coach/budgetReadingUpdated")]
    BudgetReadingUpdated(ContextBudgetReading),

    /// Fired once per transition into Critical
    #[serde(rename = "coach/budgetCritical")]
    BudgetCritical(ContextBudgetReading),

    #[serde(rename = "coach/bridgeReady")]
    BridgeReady(ContextBridge),

    #[serde(rename = "coach/bridgeFailed")]
    BridgeFailed { message: String },
}

impl CoachEvent {
    pub fn method(&self) -> &'static str {
        match self {
            CoachEvent::PromptIdle => "coach/promptIdle",
            CoachEvent::PromptAnalysisUpdated { .. } => "coach/promptAnalysisUpdated",
            CoachEvent::FlowAnalysisUpdated { .. } => "coach/flowAnalysisUpdated",
            CoachEvent::FollowUpReady(_) => "coach/followUpReady",
            CoachEvent::BudgetReadingUpdated(_) => "coach/budgetReadingUpdated",
            CoachEvent::BudgetCritical(_) => "coach/budgetCritical",
            CoachEvent::BridgeReady(_) => "coach/bridgeReady",
            CoachEvent::BridgeFailed { .. } => "coach/bridgeFailed",
        }
    }

    /// JSON notification line
    pub fn to_notification(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "method": self.method(), "error": e.to_string() }).to_string()
        })
    }
}

/// Fire-and-forget sender for presentation events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<CoachEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<CoachEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CoachEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: CoachEvent) {
        let method = event.method();
        match self.tx.try_send(event) {
            Ok(()) => debug!("Emitted {}", method),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping {}", method)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event channel closed, dropping {}", method)
            }
        }
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 10.0)
    } else {
        0.0
    }
}
