//! Knowledge selection and context bridges
//!
//! The knowledge-graph service owns every memory item. This side keeps only
//! the last fetched snapshot (for lookups and filtering), a selection of ids,
//! and the most recent bridge built from that selection.

use crate::backend::{bounded, CoachBackend};
use crate::config::CoachConfig;
use crate::monitor::source::ChangeSource;
use crate::protocol::{
    CoachEvent, ContextBridgeRequest, EventSink, KnowledgeGraph, KnowledgeGraphRequest, MemoryHit,
    MemoryItem, SaveConversationRequest, SavedMemory, SearchMemoryRequest, TranscriptMessage,
};
use crate::session::ConversationTurn;
use crate::{CoachError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Compressed, token-bounded context built from selected memories
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBridge {
    pub selected_ids: BTreeSet<String>,
    pub compressed_text: String,
    pub token_budget: u32,
    pub compression_ratio_percent: f64,
}

pub struct KnowledgeBridge {
    backend: Arc<dyn CoachBackend>,
    timeout: Duration,
    time_range_days: u32,
    max_nodes: u32,
    snapshot: Option<Arc<KnowledgeGraph>>,
    selection: BTreeSet<String>,
    bridge: Option<ContextBridge>,
    events: Option<EventSink>,
}

impl KnowledgeBridge {
    pub fn new(backend: Arc<dyn CoachBackend>, config: &CoachConfig) -> Self {
        Self {
            backend,
            timeout: config.request_timeout,
            time_range_days: config.knowledge_time_range_days,
            max_nodes: config.knowledge_max_nodes,
            snapshot: None,
            selection: BTreeSet::new(),
            bridge: None,
            events: None,
        }
    }

    /// Also report bridge results as presentation events
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Fetch a fresh snapshot. On failure the previous snapshot stays.
    /// The selection is kept either way.
    pub async fn reload(&mut self) -> Result<Arc<KnowledgeGraph>> {
        let request = KnowledgeGraphRequest {
            time_range_days: self.time_range_days,
            max_nodes: self.max_nodes,
        };
        let graph = bounded(self.timeout, self.backend.knowledge_graph(&request)).await?;
        info!(
            "Loaded {} memories ({} total, {} topics)",
            graph.nodes.len(),
            graph.stats.total_memories,
            graph.stats.total_topics
        );
        let graph = Arc::new(graph);
        self.snapshot = Some(graph.clone());
        Ok(graph)
    }

    pub fn snapshot(&self) -> Option<&KnowledgeGraph> {
        self.snapshot.as_deref()
    }

    pub fn item(&self, id: &str) -> Option<&MemoryItem> {
        self.snapshot()?.nodes.iter().find(|n| n.id == id)
    }

    /// Client-side filter over the fetched snapshot; never hits the network.
    ///
    /// Case-insensitive substring match against title, summary and topic tags.
    /// An empty query matches everything.
    pub fn filter(&self, query: &str) -> Vec<&MemoryItem> {
        let Some(graph) = self.snapshot() else {
            return Vec::new();
        };
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return graph.nodes.iter().collect();
        }
        graph
            .nodes
            .iter()
            .filter(|item| {
                item.title.to_lowercase().contains(&needle)
                    || item.summary.to_lowercase().contains(&needle)
                    || item
                        .topic_tags
                        .iter()
                        .any(|tag| tag.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Flip membership of `id` in the selection. Returns whether it is now selected.
    pub fn toggle_selection(&mut self, id: &str) -> bool {
        if self.selection.remove(id) {
            false
        } else {
            self.selection.insert(id.to_string());
            true
        }
    }

    pub fn selection(&self) -> &BTreeSet<String> {
        &self.selection
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Query sent to the compression service: titles of the selected items,
    /// falling back to the id for items missing from the snapshot.
    fn selection_query(&self) -> String {
        self.selection
            .iter()
            .map(|id| match self.item(id) {
                Some(item) if !item.title.trim().is_empty() => item.title.trim().to_string(),
                _ => id.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Compress the selected memories into a bridge for `conversation`.
    ///
    /// Fails with `EmptySelection` (no remote call) when nothing is selected,
    /// and with `BridgeGenerationFailed` when the service fails; in both cases
    /// any previous bridge is left as it was.
    pub async fn build_bridge(
        &mut self,
        conversation: &[ConversationTurn],
        token_budget: u32,
    ) -> Result<ContextBridge> {
        if self.selection.is_empty() {
            return Err(CoachError::EmptySelection);
        }

        let request = ContextBridgeRequest {
            conversation: conversation.to_vec(),
            search_query: self.selection_query(),
            token_budget,
        };
        debug!(
            "Building context bridge from {} memories, budget {}",
            self.selection.len(),
            token_budget
        );

        let response = match bounded(self.timeout, self.backend.build_context_bridge(&request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Context bridge failed: {}", e);
                let err = CoachError::BridgeGenerationFailed(e.to_string());
                self.emit(CoachEvent::BridgeFailed {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let bridge = ContextBridge {
            selected_ids: self.selection.clone(),
            compressed_text: response.context_injection,
            token_budget,
            compression_ratio_percent: response.compression_ratio_percent,
        };
        info!(
            "Context bridge ready ({:.0}% compression)",
            bridge.compression_ratio_percent
        );
        self.bridge = Some(bridge.clone());
        self.emit(CoachEvent::BridgeReady(bridge.clone()));
        Ok(bridge)
    }

    pub fn bridge(&self) -> Option<&ContextBridge> {
        self.bridge.as_ref()
    }

    pub fn discard_bridge(&mut self) -> Option<ContextBridge> {
        self.bridge.take()
    }

    /// Send the whole conversation to the memory store.
    pub async fn capture_conversation(
        &self,
        source: &dyn ChangeSource,
        url: &str,
        title: &str,
    ) -> Result<SavedMemory> {
        let turns = source.read_turns().await?;
        if turns.is_empty() {
            return Err(CoachError::EmptyConversation);
        }
        let request = SaveConversationRequest {
            messages: turns.iter().map(TranscriptMessage::from).collect(),
            url: url.to_string(),
            title: title.to_string(),
        };
        let saved = bounded(self.timeout, self.backend.save_conversation(&request)).await?;
        info!("Saved conversation as memory {}", saved.id);
        Ok(saved)
    }

    /// Remote semantic search, distinct from the client-side [`filter`](Self::filter).
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<MemoryHit>> {
        let request = SearchMemoryRequest {
            query: query.to_string(),
            limit,
        };
        let results = bounded(self.timeout, self.backend.search_memory(&request)).await?;
        Ok(results.memories)
    }

    fn emit(&self, event: CoachEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}
