//! Change sources
//!
//! A change source exposes the conversation as an ordered list of turns and,
//! optionally, a signal that fires when the underlying document may have
//! changed. Signals are hints only: the detector re-reads and compares counts,
//! so missed or duplicate notifications are harmless.

use crate::protocol::TranscriptMessage;
use crate::session::{ConversationTurn, Role};
use crate::{CoachError, Result};
use async_trait::async_trait;
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Ordered, re-readable view of a conversation
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Full turn sequence as currently observable
    async fn read_turns(&self) -> Result<Vec<ConversationTurn>>;

    /// Fires when the conversation may have changed; `None` means poll only.
    fn change_signal(&self) -> Option<Arc<Notify>> {
        None
    }
}

// ─── Transcript file ────────────────────────────────────────────────

/// JSON-lines transcript on disk, one `{"role", "content", "timestamp"?}` per line
pub struct TranscriptSource {
    path: PathBuf,
    signal: Arc<Notify>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl TranscriptSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            signal: Arc::new(Notify::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the event channel: watch the transcript's directory and notify
    /// on any event touching the transcript file.
    pub fn watch(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| CoachError::Watch(format!("{} has no file name", self.path.display())))?;

        let signal = self.signal.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(_) => return,
            };
            if event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                signal.notify_one();
            }
        })
        .map_err(|e| CoachError::Watch(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| CoachError::Watch(format!("Failed to watch {}: {}", dir.display(), e)))?;

        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }
        info!("Watching transcript {}", self.path.display());
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Parse transcript content. Blank lines, malformed lines and roles other
    /// than user/assistant are skipped.
    pub fn parse(content: &str) -> Vec<ConversationTurn> {
        let now = Utc::now();
        let mut turns = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message: TranscriptMessage = match serde_json::from_str(line) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping malformed transcript line {}: {}", line_no + 1, e);
                    continue;
                }
            };
            let Some(role) = message.role() else {
                continue;
            };
            let index = turns.len();
            turns.push(
                ConversationTurn::new(role, message.content, index)
                    .observed_at(message.timestamp.unwrap_or(now)),
            );
        }
        turns
    }
}

#[async_trait]
impl ChangeSource for TranscriptSource {
    async fn read_turns(&self) -> Result<Vec<ConversationTurn>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(Self::parse(&content))
    }

    fn change_signal(&self) -> Option<Arc<Notify>> {
        Some(self.signal.clone())
    }
}

impl std::fmt::Debug for TranscriptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptSource")
            .field("path", &self.path)
            .field("watching", &self.is_watching())
            .finish()
    }
}

// ─── In-memory ──────────────────────────────────────────────────────

/// Push-driven source for embedding hosts that already see the conversation
#[derive(Default)]
pub struct ScriptedSource {
    turns: Mutex<Vec<ConversationTurn>>,
    signal: Arc<Notify>,
    failing: AtomicBool,
    silent: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn and signal the change. Returns the new turn count.
    pub fn push(&self, role: Role, content: impl Into<String>) -> usize {
        let count = match self.turns.lock() {
            Ok(mut turns) => {
                let index = turns.len();
                turns.push(ConversationTurn::new(role, content, index));
                turns.len()
            }
            Err(_) => 0,
        };
        if !self.silent.load(Ordering::SeqCst) {
            self.signal.notify_one();
        }
        count
    }

    /// Append a fully formed turn (keeps its timestamp).
    pub fn push_turn(&self, turn: ConversationTurn) -> usize {
        let count = match self.turns.lock() {
            Ok(mut turns) => {
                let index = turns.len();
                turns.push(ConversationTurn { sequence_index: index, ..turn });
                turns.len()
            }
            Err(_) => 0,
        };
        if !self.silent.load(Ordering::SeqCst) {
            self.signal.notify_one();
        }
        count
    }

    /// Make subsequent reads fail, as a detached document would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stop signalling on push, leaving only the poll channel.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn notify(&self) {
        self.signal.notify_one();
    }

    pub fn len(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn read_turns(&self) -> Result<Vec<ConversationTurn>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoachError::RemoteUnavailable("source detached".to_string()));
        }
        self.turns
            .lock()
            .map(|t| t.clone())
            .map_err(|_| CoachError::Watch("source lock poisoned".to_string()))
    }

    fn change_signal(&self) -> Option<Arc<Notify>> {
        Some(self.signal.clone())
    }
}
