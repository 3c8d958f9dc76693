//! Debounced prompt analysis
//!
//! Draft text changes drive a small state machine:
//!
//! ```text
//! Idle ──text──▶ Pending(text, deadline) ──timer──▶ InFlight(text) ──done──▶ Idle
//!                   ▲      │ text (restart)                               │
//!                   └──────┘◀────────── re-arm if input moved on ─────────┘
//! ```
//!
//! At most one scoring call is in flight. Results are tagged with the text
//! they scored and dropped when the input has changed since.

use super::orchestrator::ContextHint;
use super::tasks::TaskScope;
use crate::backend::{bounded, CoachBackend};
use crate::config::CoachConfig;
use crate::protocol::{CoachEvent, EventSink, PromptAnalysis, PromptQualityRequest};
use crate::{CoachError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Anything that can score a draft prompt
#[async_trait]
pub trait PromptScorer: Send + Sync {
    async fn score_prompt(&self, prompt: &str) -> Result<PromptAnalysis>;
}

/// Scores prompts with the remote prompt-quality service
pub struct RemotePromptScorer {
    backend: Arc<dyn CoachBackend>,
}

impl RemotePromptScorer {
    pub fn new(backend: Arc<dyn CoachBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PromptScorer for RemotePromptScorer {
    async fn score_prompt(&self, prompt: &str) -> Result<PromptAnalysis> {
        let request = PromptQualityRequest {
            prompt: prompt.to_string(),
        };
        self.backend.analyze_prompt(&request).await
    }
}

enum TriggerState {
    Idle,
    Pending {
        text: String,
        deadline: Instant,
        timer: AbortHandle,
    },
    InFlight {
        text: String,
    },
}

struct Core {
    state: TriggerState,
    last_analyzed: Option<String>,
    /// Latest input, whatever the state
    current_text: String,
    /// Bumped on every (re)arm; a timer only fires for its own generation
    generation: u64,
}

impl Core {
    /// Abort the quiet-period timer; no-op unless Pending.
    fn cancel_pending(&mut self) {
        if !matches!(self.state, TriggerState::Pending { .. }) {
            return;
        }
        if let TriggerState::Pending { timer, .. } =
            std::mem::replace(&mut self.state, TriggerState::Idle)
        {
            timer.abort();
        }
    }
}

struct Inner {
    scorer: Arc<dyn PromptScorer>,
    events: EventSink,
    quiet_period: Duration,
    min_chars: usize,
    timeout: Duration,
    context_hint: ContextHint,
    tasks: TaskScope,
    core: Mutex<Core>,
}

/// Coalesces text-changed signals into prompt-quality analyses
#[derive(Clone)]
pub struct DebouncedTrigger {
    inner: Arc<Inner>,
}

impl DebouncedTrigger {
    pub fn new(
        scorer: Arc<dyn PromptScorer>,
        events: EventSink,
        config: &CoachConfig,
        context_hint: ContextHint,
        tasks: TaskScope,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                scorer,
                events,
                quiet_period: config.effective_quiet_period(),
                min_chars: config.min_prompt_chars,
                timeout: config.request_timeout,
                context_hint,
                tasks,
                core: Mutex::new(Core {
                    state: TriggerState::Idle,
                    last_analyzed: None,
                    current_text: String::new(),
                    generation: 0,
                }),
            }),
        }
    }

    pub fn on_text_changed(&self, text: &str) {
        self.inner.text_changed(text);
    }

    /// Drop any pending quiet period. An in-flight call still completes.
    pub fn cancel(&self) {
        if let Ok(mut core) = self.inner.core.lock() {
            core.cancel_pending();
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner
            .core
            .lock()
            .map(|c| matches!(c.state, TriggerState::InFlight { .. }))
            .unwrap_or(false)
    }

    /// Deadline of the pending quiet period, if one is armed
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.inner.core.lock().ok().and_then(|c| match c.state {
            TriggerState::Pending { deadline, .. } => Some(deadline),
            _ => None,
        })
    }

    /// Text currently being scored
    pub fn in_flight_text(&self) -> Option<String> {
        self.inner.core.lock().ok().and_then(|c| match &c.state {
            TriggerState::InFlight { text } => Some(text.clone()),
            _ => None,
        })
    }

    pub fn last_analyzed_text(&self) -> Option<String> {
        self.inner
            .core
            .lock()
            .ok()
            .and_then(|c| c.last_analyzed.clone())
    }
}

impl Inner {
    fn text_changed(self: &Arc<Self>, text: &str) {
        let Ok(mut core) = self.core.lock() else {
            return;
        };
        core.current_text = text.to_string();

        if text.is_empty() {
            core.cancel_pending();
            core.last_analyzed = None;
            drop(core);
            self.events.emit(CoachEvent::PromptIdle);
            return;
        }

        if matches!(core.state, TriggerState::InFlight { .. }) {
            return;
        }
        if core.last_analyzed.as_deref() == Some(text) {
            core.cancel_pending();
            return;
        }

        self.arm(&mut core, text.to_string());
    }

    /// Enter Pending for `text`, replacing any running timer.
    fn arm(self: &Arc<Self>, core: &mut Core, text: String) {
        core.cancel_pending();
        core.generation += 1;
        let generation = core.generation;

        let inner = self.clone();
        let quiet = self.quiet_period;
        // The scoring call runs inside the timer task
        let Some(timer) = self.tasks.spawn(async move {
            tokio::time::sleep(quiet).await;
            inner.fire(generation).await;
        }) else {
            debug!("Monitor stopped, not scheduling prompt analysis");
            return;
        };

        core.state = TriggerState::Pending {
            text,
            deadline: Instant::now() + quiet,
            timer,
        };
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        let text = {
            let Ok(mut core) = self.core.lock() else {
                return;
            };
            if core.generation != generation
                || !matches!(core.state, TriggerState::Pending { .. })
            {
                return;
            }
            let text = match std::mem::replace(&mut core.state, TriggerState::Idle) {
                TriggerState::Pending { text, .. } => text,
                _ => return,
            };

            if text.chars().count() < self.min_chars {
                drop(core);
                self.events.emit(CoachEvent::PromptAnalysisUpdated {
                    text,
                    analysis: PromptAnalysis::too_short(self.min_chars),
                });
                return;
            }

            core.state = TriggerState::InFlight { text: text.clone() };
            core.last_analyzed = Some(text.clone());
            text
        };

        debug!("Scoring prompt ({} chars)", text.chars().count());
        let analysis = match bounded(self.timeout, self.scorer.score_prompt(&text)).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Prompt analysis failed, using fallback: {}", e);
                PromptAnalysis::fallback()
            }
        };

        self.complete(text, analysis);
    }

    fn complete(self: &Arc<Self>, text: String, analysis: PromptAnalysis) {
        let Ok(mut core) = self.core.lock() else {
            return;
        };
        core.state = TriggerState::Idle;

        let current = core.current_text.clone();
        let fresh = current == text;

        if !current.is_empty() && core.last_analyzed.as_deref() != Some(current.as_str()) {
            self.arm(&mut core, current);
        }
        drop(core);

        if !fresh {
            debug!("Dropping prompt result: {}", CoachError::StaleResult);
            return;
        }

        if !analysis.error {
            if let Ok(mut hint) = self.context_hint.lock() {
                *hint = Some(analysis.context.clone());
            }
        }
        self.events
            .emit(CoachEvent::PromptAnalysisUpdated { text, analysis });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::sleep;

    fn trigger(backend: Arc<ScriptedBackend>) -> (DebouncedTrigger, Receiver<CoachEvent>, ContextHint) {
        let (events, rx) = EventSink::channel(64);
        let hint: ContextHint = Arc::new(Mutex::new(None));
        let trigger = DebouncedTrigger::new(
            Arc::new(RemotePromptScorer::new(backend)),
            events,
            &CoachConfig::default(),
            hint.clone(),
            TaskScope::new(),
        );
        (trigger, rx, hint)
    }

    fn drain(rx: &mut Receiver<CoachEvent>) -> Vec<CoachEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn scored(events: &[CoachEvent]) -> Vec<(String, PromptAnalysis)> {
        events
            .iter()
            .filter_map(|e| match e {
                CoachEvent::PromptAnalysisUpdated { text, analysis } => {
                    Some((text.clone(), analysis.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_typing_collapses_to_last_text() {
        let backend = Arc::new(ScriptedBackend::default());
        let (trigger, mut rx, hint) = trigger(backend.clone());

        for text in ["How do I", "How do I write", "How do I write a declarative macro?"] {
            trigger.on_text_changed(text);
            sleep(Duration::from_millis(300)).await;
        }
        assert!(trigger.pending_deadline().is_some());
        sleep(Duration::from_millis(1300)).await;

        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *backend.prompts.lock().unwrap(),
            vec!["How do I write a declarative macro?".to_string()]
        );
        let results = scored(&drain(&mut rx));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "How do I write a declarative macro?");
        assert_eq!(hint.lock().unwrap().as_deref(), Some("programming"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_text_gets_local_result() {
        let backend = Arc::new(ScriptedBackend::default());
        let (trigger, mut rx, _) = trigger(backend.clone());

        trigger.on_text_changed("hi there");
        sleep(Duration::from_millis(1600)).await;

        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 0);
        let results = scored(&drain(&mut rx));
        assert_eq!(results, vec![("hi there".to_string(), PromptAnalysis::too_short(10))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_input_cancels_timer() {
        let backend = Arc::new(ScriptedBackend::default());
        let (trigger, mut rx, _) = trigger(backend.clone());

        trigger.on_text_changed("Explain closures in detail");
        sleep(Duration::from_millis(1000)).await;
        trigger.on_text_changed("");
        sleep(Duration::from_secs(3)).await;

        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 0);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CoachEvent::PromptIdle));
        assert!(trigger.last_analyzed_text().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitespace_only_text_is_too_short() {
        let backend = Arc::new(ScriptedBackend::default());
        let (trigger, mut rx, _) = trigger(backend.clone());

        trigger.on_text_changed("   ");
        assert!(trigger.pending_deadline().is_some());
        sleep(Duration::from_secs(2)).await;

        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 0);
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, CoachEvent::PromptIdle)));
        assert_eq!(
            scored(&events),
            vec![("   ".to_string(), PromptAnalysis::too_short(10))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_text_is_not_reanalyzed() {
        let backend = Arc::new(ScriptedBackend::default());
        let (trigger, _rx, _) = trigger(backend.clone());

        trigger.on_text_changed("Explain closures in detail");
        sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 1);

        trigger.on_text_changed("Explain closures in detail");
        sleep(Duration::from_secs(2)).await;

        // Edit and revert inside the quiet period
        trigger.on_text_changed("Explain closures in detail!");
        sleep(Duration::from_millis(500)).await;
        trigger.on_text_changed("Explain closures in detail");
        sleep(Duration::from_secs(2)).await;

        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_result_dropped_and_rearmed() {
        let backend = Arc::new(ScriptedBackend::gated());
        let (trigger, mut rx, _) = trigger(backend.clone());

        trigger.on_text_changed("What is a lifetime?");
        sleep(Duration::from_millis(1600)).await;
        assert_eq!(trigger.in_flight_text().as_deref(), Some("What is a lifetime?"));
        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 1);

        // Typing during the call does not start another one
        trigger.on_text_changed("What is a lifetime parameter?");
        sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 1);

        backend.release();
        sleep(Duration::from_millis(10)).await;
        assert!(scored(&drain(&mut rx)).is_empty());
        assert!(trigger.pending_deadline().is_some());

        backend.release();
        sleep(Duration::from_millis(1600)).await;
        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 2);
        let results = scored(&drain(&mut rx));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "What is a lifetime parameter?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_timeout_use_fallback() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.prompt_fails.lock().unwrap() = true;
        let (trigger, mut rx, hint) = trigger(backend.clone());

        trigger.on_text_changed("Summarize this article for me");
        sleep(Duration::from_millis(1600)).await;
        let results = scored(&drain(&mut rx));
        assert_eq!(results[0].1, PromptAnalysis::fallback());
        assert!(hint.lock().unwrap().is_none());

        *backend.prompt_fails.lock().unwrap() = false;
        *backend.hang_prompt.lock().unwrap() = true;
        trigger.on_text_changed("Summarize this article for me, briefly");
        sleep(Duration::from_millis(1600)).await;
        assert!(trigger.is_in_flight());
        sleep(Duration::from_secs(21)).await;
        assert!(!trigger.is_in_flight());
        let results = scored(&drain(&mut rx));
        assert_eq!(results.len(), 1);
        assert!(results[0].1.error);
    }
}
