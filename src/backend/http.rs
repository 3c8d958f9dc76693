//! HTTP transport for the analysis backend
//!
//! JSON over POST for every analysis contract, GET for health. Every request
//! carries the caller's stable user id in `X-User-Id`, so a backend can only
//! be built once identity has been resolved.

use super::CoachBackend;
use crate::config::CoachConfig;
use crate::identity::IdentityProvider;
use crate::protocol::{
    AnalysisRequest, BridgeResponse, ContextBridgeRequest, ContextBudgetRequest,
    ContextEstimate, FlowAnalysis, FollowUpRequest, FollowUpSuggestion, HealthStatus,
    KnowledgeGraph, KnowledgeGraphRequest, PromptAnalysis, PromptQualityRequest,
    SaveConversationRequest, SavedMemory, SearchMemoryRequest, SearchResults, TurnFlowRequest,
};
use crate::{CoachError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

const USER_ID_HEADER: &str = "X-User-Id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_DETAIL_CHARS: usize = 500;

/// `CoachBackend` over reqwest
pub struct HttpBackend {
    client: Client,
    base_url: String,
    user_id: String,
}

impl HttpBackend {
    pub fn new(config: &CoachConfig, identity: &dyn IdentityProvider) -> Result<Self> {
        let user_id = identity.user_id().trim().to_string();
        if user_id.is_empty() {
            return Err(CoachError::Identity("user id is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("chatcoach/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoachError::Config(format!("http client: {}", e)))?;

        let base_url = config.api_url.trim_end_matches('/').to_string();
        info!("Analysis backend: {}", base_url);

        Ok(Self {
            client,
            base_url,
            user_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST one analysis request and decode the JSON response.
    async fn dispatch<T: DeserializeOwned>(&self, request: AnalysisRequest<'_>) -> Result<T> {
        let kind = request.kind();
        let url = self.url(kind.endpoint());
        debug!("POST {} ({})", url, kind);

        let response = self
            .client
            .post(&url)
            .header(USER_ID_HEADER, &self.user_id)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let response = check_response_status(response).await?;
        response.json::<T>().await.map_err(|e| {
            CoachError::RemoteUnavailable(format!("invalid {} response: {}", kind, e))
        })
    }
}

#[async_trait]
impl CoachBackend for HttpBackend {
    async fn analyze_prompt(&self, request: &PromptQualityRequest) -> Result<PromptAnalysis> {
        let analysis: PromptAnalysis = self.dispatch(AnalysisRequest::PromptQuality(request)).await?;
        Ok(analysis.normalized())
    }

    async fn analyze_turn_flow(&self, request: &TurnFlowRequest) -> Result<FlowAnalysis> {
        let analysis: FlowAnalysis = self.dispatch(AnalysisRequest::TurnFlow(request)).await?;
        Ok(analysis.normalized())
    }

    async fn generate_followup(&self, request: &FollowUpRequest) -> Result<FollowUpSuggestion> {
        self.dispatch(AnalysisRequest::FollowUp(request)).await
    }

    async fn estimate_context(&self, request: &ContextBudgetRequest) -> Result<ContextEstimate> {
        self.dispatch(AnalysisRequest::ContextBudget(request)).await
    }

    async fn build_context_bridge(
        &self,
        request: &ContextBridgeRequest,
    ) -> Result<BridgeResponse> {
        self.dispatch(AnalysisRequest::ContextBridge(request)).await
    }

    async fn knowledge_graph(&self, request: &KnowledgeGraphRequest) -> Result<KnowledgeGraph> {
        self.dispatch(AnalysisRequest::KnowledgeGraph(request)).await
    }

    async fn save_conversation(&self, request: &SaveConversationRequest) -> Result<SavedMemory> {
        self.dispatch(AnalysisRequest::SaveConversation(request)).await
    }

    async fn search_memory(&self, request: &SearchMemoryRequest) -> Result<SearchResults> {
        self.dispatch(AnalysisRequest::SearchMemory(request)).await
    }

    async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .client
            .get(self.url("health"))
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_response_status(response).await?;
        response
            .json::<HealthStatus>()
            .await
            .map_err(|e| CoachError::RemoteUnavailable(format!("invalid health response: {}", e)))
    }
}

async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = truncate_error_detail(&extract_error_detail(&body), MAX_ERROR_DETAIL_CHARS);
    Err(CoachError::RemoteRejected {
        status: status.as_u16(),
        body: detail,
    })
}

/// Pull a readable message out of an error body (FastAPI `detail`, OpenAI-style
/// `error.message`, or plain `message`), else return the body itself.
fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value.get("detail").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}

fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }

    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}

fn map_reqwest_error(e: reqwest::Error) -> CoachError {
    if e.is_timeout() {
        CoachError::RemoteUnavailable(format!("timeout: {e}"))
    } else if e.is_connect() {
        CoachError::RemoteUnavailable(format!("network: {e}"))
    } else {
        CoachError::RemoteUnavailable(e.to_string())
    }
}
