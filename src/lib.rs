//! Chatcoach - live coaching layer for chat conversations
//!
//! Watches an ongoing conversation and:
//! - Scores draft prompts and completed turn pairs via a remote analysis service
//! - Tracks a running flow-quality mean and a bounded issue log
//! - Estimates how much of the model's context window the conversation uses
//! - Compresses selected memory items into an injectable context bridge

pub mod backend;
pub mod config;
pub mod heuristics;
pub mod identity;
pub mod knowledge;
pub mod metrics;
pub mod monitor;
pub mod protocol;
pub mod session;

pub use backend::{CoachBackend, HttpBackend};
pub use config::{CoachConfig, PromptScoring};
pub use knowledge::KnowledgeBridge;
pub use metrics::QualityMetrics;
pub use monitor::{Monitor, MonitorHandle};
pub use protocol::{AnalysisRequest, CoachEvent};
pub use session::{ConversationSession, ConversationTurn, Role};

/// Result type for Chatcoach operations
pub type Result<T> = std::result::Result<T, CoachError>;

/// Errors that can occur in Chatcoach
#[derive(Debug, thiserror::Error)]
pub enum CoachError {
    #[error("Analysis service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Analysis service rejected the request ({status}): {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("Select at least one memory before building a context bridge")]
    EmptySelection,

    #[error("Result was superseded by newer input")]
    StaleResult,

    #[error("Context bridge generation failed: {0}")]
    BridgeGenerationFailed(String),

    #[error("No conversation turns to capture")]
    EmptyConversation,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("File watch error: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoachError {
    /// Whether this error came from a remote collaborator (and so should be
    /// absorbed into a fallback value rather than surfaced).
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CoachError::RemoteUnavailable(_) | CoachError::RemoteRejected { .. }
        )
    }
}
