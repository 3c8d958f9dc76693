//! Conversation monitor
//!
//! Wires the change source, detector, orchestrator, draft trigger and budget
//! estimator into a set of background tasks for one conversation session.

pub mod budget;
pub mod debounce;
pub mod detector;
pub mod orchestrator;
pub mod source;
pub mod tasks;

pub use budget::{BudgetClass, BudgetEstimator, ContextBudgetReading, ModelDetector, StaticModel};
pub use debounce::{DebouncedTrigger, PromptScorer, RemotePromptScorer};
pub use detector::{ChangeDetector, PollOutcome};
pub use orchestrator::{ContextHint, PairOutcome, TurnOrchestrator};
pub use source::{ChangeSource, ScriptedSource, TranscriptSource};
pub use tasks::TaskScope;

use crate::backend::CoachBackend;
use crate::config::{CoachConfig, PromptScoring};
use crate::heuristics::HeuristicScorer;
use crate::metrics::QualityMetrics;
use crate::protocol::EventSink;
use crate::session::{ConversationSession, SharedSession};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Assembles the monitoring components for one conversation
pub struct Monitor {
    config: CoachConfig,
    backend: Arc<dyn CoachBackend>,
    source: Arc<dyn ChangeSource>,
    model: Arc<dyn ModelDetector>,
    scorer: Option<Arc<dyn PromptScorer>>,
    events: EventSink,
}

impl Monitor {
    pub fn new(
        config: CoachConfig,
        backend: Arc<dyn CoachBackend>,
        source: Arc<dyn ChangeSource>,
        events: EventSink,
    ) -> Self {
        let model = Arc::new(StaticModel::new(config.model.clone()));
        Self {
            config,
            backend,
            source,
            model,
            scorer: None,
            events,
        }
    }

    pub fn with_model_detector(mut self, model: Arc<dyn ModelDetector>) -> Self {
        self.model = model;
        self
    }

    /// Override the scorer picked from `prompt_scoring`
    pub fn with_scorer(mut self, scorer: Arc<dyn PromptScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Create a fresh session and start the background tasks.
    ///
    /// `drafts` carries the current draft text on every edit.
    pub fn start(self, drafts: mpsc::Receiver<String>) -> MonitorHandle {
        let config = Arc::new(self.config);
        let session = ConversationSession::shared(config.issue_log_capacity);
        let context_hint: ContextHint = Arc::new(Mutex::new(None));
        let background = TaskScope::new();

        let scorer: Arc<dyn PromptScorer> = match self.scorer {
            Some(scorer) => scorer,
            None => match config.prompt_scoring {
                PromptScoring::Remote => Arc::new(RemotePromptScorer::new(self.backend.clone())),
                PromptScoring::Local => Arc::new(HeuristicScorer::new()),
            },
        };
        info!(
            scoring = ?config.prompt_scoring,
            "Monitoring started"
        );

        let orchestrator = Arc::new(
            TurnOrchestrator::new(
                self.backend.clone(),
                self.source.clone(),
                session.clone(),
                self.events.clone(),
                config.clone(),
                context_hint.clone(),
            )
            .with_tasks(background.clone()),
        );
        let detector = Arc::new(ChangeDetector::new(
            self.source.clone(),
            orchestrator,
            session.clone(),
        ));
        let trigger = DebouncedTrigger::new(
            scorer,
            self.events.clone(),
            &config,
            context_hint,
            background.clone(),
        );
        let estimator = Arc::new(BudgetEstimator::new(
            self.backend.clone(),
            self.source.clone(),
            self.model.clone(),
            self.events.clone(),
            config.request_timeout,
        ));

        let mut tasks = Vec::new();
        tasks.push(spawn_poll_channel(detector.clone(), &config));
        if let Some(task) = spawn_event_channel(detector.clone(), self.source.as_ref()) {
            tasks.push(task);
        }
        tasks.push(spawn_budget_task(estimator.clone(), &config, background.clone()));
        tasks.push(spawn_draft_task(trigger.clone(), drafts));

        MonitorHandle {
            session,
            detector,
            trigger,
            estimator,
            tasks,
            background,
        }
    }
}

fn spawn_poll_channel(detector: Arc<ChangeDetector>, config: &CoachConfig) -> JoinHandle<()> {
    let period = config.poll_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            detector.poll_for_growth().await;
        }
    })
}

fn spawn_event_channel(
    detector: Arc<ChangeDetector>,
    source: &dyn ChangeSource,
) -> Option<JoinHandle<()>> {
    let signal = source.change_signal()?;
    Some(tokio::spawn(async move {
        loop {
            signal.notified().await;
            detector.poll_for_growth().await;
        }
    }))
}

fn spawn_budget_task(
    estimator: Arc<BudgetEstimator>,
    config: &CoachConfig,
    background: TaskScope,
) -> JoinHandle<()> {
    let period = config.budget_interval;
    tokio::spawn(async move {
        // First tick completes immediately
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let estimator = estimator.clone();
            background.spawn(async move {
                estimator.check_budget().await;
            });
        }
    })
}

fn spawn_draft_task(trigger: DebouncedTrigger, mut drafts: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = drafts.recv().await {
            trigger.on_text_changed(&text);
        }
        debug!("Draft channel closed");
    })
}

/// Running monitor; dropping it leaves the tasks running, call `shutdown`.
pub struct MonitorHandle {
    session: SharedSession,
    detector: Arc<ChangeDetector>,
    trigger: DebouncedTrigger,
    estimator: Arc<BudgetEstimator>,
    tasks: Vec<JoinHandle<()>>,
    /// Follow-ups, budget checks and draft analyses spawned by the channels
    background: TaskScope,
}

impl MonitorHandle {
    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    pub async fn session_id(&self) -> String {
        self.session.read().await.id().to_string()
    }

    pub async fn metrics(&self) -> QualityMetrics {
        self.session.read().await.metrics.clone()
    }

    pub fn budget_reading(&self) -> Option<ContextBudgetReading> {
        self.estimator.reading()
    }

    pub fn trigger(&self) -> &DebouncedTrigger {
        &self.trigger
    }

    /// Run one detection cycle outside the regular channels.
    pub async fn poll_now(&self) -> PollOutcome {
        self.detector.poll_for_growth().await
    }

    /// Stop all channels and drop the session.
    pub async fn shutdown(self) {
        self.trigger.cancel();
        self.background.close();
        for task in &self.tasks {
            task.abort();
        }
        futures::future::join_all(self.tasks).await;
        let id = self.session.read().await.id().to_string();
        info!("Monitoring stopped for session {}", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::protocol::CoachEvent;
    use crate::session::Role;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_monitor_runs_all_channels() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_estimate(Ok(ScriptedBackend::estimate(false, false)));
        let source = Arc::new(ScriptedSource::new());
        let (events, mut rx) = EventSink::channel(256);
        let (draft_tx, draft_rx) = mpsc::channel(16);

        let handle = Monitor::new(
            CoachConfig::default(),
            backend.clone(),
            source.clone(),
            events,
        )
        .start(draft_rx);

        source.push(Role::User, "How do lifetimes work?");
        source.push(Role::Assistant, "Lifetimes describe how long references stay valid.");
        draft_tx
            .send("Can you show an example with structs?".to_string())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(backend.flow_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 1);
        assert!(backend.estimate_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(handle.metrics().await.turn_count(), 1);
        assert!(handle.budget_reading().is_some());

        let mut methods = Vec::new();
        while let Ok(event) = rx.try_recv() {
            methods.push(event.method());
        }
        assert!(methods.contains(&"coach/flowAnalysisUpdated"));
        assert!(methods.contains(&"coach/promptAnalysisUpdated"));
        assert!(methods.contains(&"coach/budgetReadingUpdated"));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_detached_work() {
        let backend = Arc::new(ScriptedBackend::default());
        let source = Arc::new(ScriptedSource::new());
        let (events, mut rx) = EventSink::channel(256);
        let (draft_tx, draft_rx) = mpsc::channel(4);

        let handle = Monitor::new(
            CoachConfig::default(),
            backend.clone(),
            source.clone(),
            events,
        )
        .start(draft_rx);

        source.push(Role::User, "What is a slice?");
        source.push(Role::Assistant, "A view into contiguous memory.");
        source.push(Role::User, "How is it different from a Vec?");
        source.push(Role::Assistant, "A Vec owns its buffer, a slice borrows one.");
        draft_tx
            .send("Can slices be resized after creation?".to_string())
            .await
            .unwrap();

        // Pair analyzed; follow-up and draft timers are still waiting
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.flow_calls.load(Ordering::SeqCst), 1);
        assert!(handle.trigger().pending_deadline().is_some());
        while rx.try_recv().is_ok() {}

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.followup_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 0);
        let mut late = Vec::new();
        while let Ok(event) = rx.try_recv() {
            late.push(event.method());
        }
        assert!(late.is_empty(), "events after shutdown: {:?}", late);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_channel_covers_missed_signals() {
        let backend = Arc::new(ScriptedBackend::default());
        let source = Arc::new(ScriptedSource::new());
        source.set_silent(true);
        let (events, _rx) = EventSink::channel(64);
        let (_draft_tx, draft_rx) = mpsc::channel(1);

        let handle = Monitor::new(CoachConfig::default(), backend.clone(), source.clone(), events)
            .start(draft_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        source.push(Role::User, "Is Rc thread safe?");
        source.push(Role::Assistant, "No, use Arc across threads.");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.flow_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.flow_calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_scoring_uses_heuristics() {
        let backend = Arc::new(ScriptedBackend::default());
        let source = Arc::new(ScriptedSource::new());
        let (events, mut rx) = EventSink::channel(64);
        let (draft_tx, draft_rx) = mpsc::channel(4);

        let config = CoachConfig::default().with_prompt_scoring(PromptScoring::Local);
        let handle = Monitor::new(config, backend.clone(), source, events).start(draft_rx);

        draft_tx
            .send("Please explain how to bake bread, step by step".to_string())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(backend.prompt_calls.load(Ordering::SeqCst), 0);
        let mut contexts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoachEvent::PromptAnalysisUpdated { analysis, .. } = event {
                contexts.push(analysis.context);
            }
        }
        assert_eq!(contexts, vec!["cooking".to_string()]);

        handle.shutdown().await;
    }
}
