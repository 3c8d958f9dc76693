//! Remote collaborators
//!
//! Every analysis service is reached through `CoachBackend`. Components never
//! call it directly; they go through [`bounded`] so that a hung call becomes
//! a `RemoteUnavailable` error and follows the component's fallback path.

mod http;

pub use http::HttpBackend;

use crate::protocol::{
    BridgeResponse, ContextBridgeRequest, ContextBudgetRequest, ContextEstimate, FlowAnalysis,
    FollowUpRequest, FollowUpSuggestion, HealthStatus, KnowledgeGraph, KnowledgeGraphRequest,
    PromptAnalysis, PromptQualityRequest, SaveConversationRequest, SavedMemory,
    SearchMemoryRequest, SearchResults, TurnFlowRequest,
};
use crate::{CoachError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Request/response contracts of the remote analysis services
#[async_trait]
pub trait CoachBackend: Send + Sync {
    async fn analyze_prompt(&self, request: &PromptQualityRequest) -> Result<PromptAnalysis>;

    async fn analyze_turn_flow(&self, request: &TurnFlowRequest) -> Result<FlowAnalysis>;

    async fn generate_followup(&self, request: &FollowUpRequest) -> Result<FollowUpSuggestion>;

    async fn estimate_context(&self, request: &ContextBudgetRequest) -> Result<ContextEstimate>;

    async fn build_context_bridge(&self, request: &ContextBridgeRequest)
        -> Result<BridgeResponse>;

    async fn knowledge_graph(&self, request: &KnowledgeGraphRequest) -> Result<KnowledgeGraph>;

    async fn save_conversation(&self, request: &SaveConversationRequest) -> Result<SavedMemory>;

    async fn search_memory(&self, request: &SearchMemoryRequest) -> Result<SearchResults>;

    async fn health(&self) -> Result<HealthStatus>;
}

/// Run a remote call under a hard deadline.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CoachError::RemoteUnavailable(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
