//! Turn pairing and flow analysis
//!
//! On each detected growth the orchestrator finds the latest (user, assistant)
//! pair, scores it, folds the result into the session metrics and, for good
//! turns, schedules a follow-up suggestion.

use super::source::ChangeSource;
use super::tasks::TaskScope;
use crate::backend::{bounded, CoachBackend};
use crate::config::CoachConfig;
use crate::protocol::{
    CoachEvent, EventSink, FlowAnalysis, FollowUpRequest, TurnFlowRequest, GENERAL_CONTEXT,
};
use crate::session::{ConversationTurn, Role, SharedSession};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Domain label of the most recent prompt analysis, shared with the draft trigger
pub type ContextHint = Arc<Mutex<Option<String>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// Nothing beyond the last pairing point
    NoGrowth,
    /// Growth, but no complete pair yet
    Incomplete,
    Analyzed(FlowAnalysis),
}

struct Candidate {
    user: ConversationTurn,
    assistant: ConversationTurn,
    history: Vec<ConversationTurn>,
    session_id: String,
    user_turns: usize,
}

pub struct TurnOrchestrator {
    backend: Arc<dyn CoachBackend>,
    source: Arc<dyn ChangeSource>,
    session: SharedSession,
    events: EventSink,
    config: Arc<CoachConfig>,
    context_hint: ContextHint,
    tasks: TaskScope,
}

impl TurnOrchestrator {
    pub fn new(
        backend: Arc<dyn CoachBackend>,
        source: Arc<dyn ChangeSource>,
        session: SharedSession,
        events: EventSink,
        config: Arc<CoachConfig>,
        context_hint: ContextHint,
    ) -> Self {
        Self {
            backend,
            source,
            session,
            events,
            config,
            context_hint,
            tasks: TaskScope::new(),
        }
    }

    /// Spawn follow-up work in `tasks` instead of a private scope
    pub fn with_tasks(mut self, tasks: TaskScope) -> Self {
        self.tasks = tasks;
        self
    }

    pub async fn on_new_turns(&self) -> PairOutcome {
        // On a failed re-read, pair from the turns already merged into the session
        let read = match self.source.read_turns().await {
            Ok(turns) => Some(turns),
            Err(e) => {
                debug!("Turn re-read failed, using observed turns: {}", e);
                None
            }
        };

        let candidate = {
            let mut session = self.session.write().await;
            if let Some(read) = &read {
                session.observe(read);
            }
            let total = session.turns().len();
            if total <= session.last_paired_turn_count() {
                return PairOutcome::NoGrowth;
            }
            match self.select_pair(session.turns()) {
                Some(c) => {
                    session.mark_paired(total);
                    Candidate {
                        session_id: session.id().to_string(),
                        ..c
                    }
                }
                None => return PairOutcome::Incomplete,
            }
        };

        let request = TurnFlowRequest {
            user_message: candidate.user.content.clone(),
            assistant_message: candidate.assistant.content.clone(),
            history: candidate.history,
            session_id: candidate.session_id,
        };

        let analysis = match bounded(
            self.config.request_timeout,
            self.backend.analyze_turn_flow(&request),
        )
        .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Turn flow analysis failed, assuming neutral: {}", e);
                FlowAnalysis::fallback()
            }
        };

        let (metrics, new_issue) = {
            let mut session = self.session.write().await;
            let new_issue = session
                .metrics
                .record_turn_analysis(analysis.flow_score, analysis.issue_kind.clone());
            (session.metrics.clone(), new_issue)
        };
        info!(
            score = analysis.flow_score,
            issue = %analysis.issue_kind,
            average = metrics.average_flow_score(),
            "Turn pair analyzed"
        );

        self.events.emit(CoachEvent::FlowAnalysisUpdated {
            analysis: analysis.clone(),
            metrics,
            new_issue,
        });

        if analysis.flow_score >= self.config.follow_up_min_score && candidate.user_turns >= 2 {
            self.schedule_follow_up();
        }

        PairOutcome::Analyzed(analysis)
    }

    /// Latest user and assistant turns, if they form a complete pair.
    ///
    /// The pair counts as complete when the assistant turn is not older than
    /// the user turn, or both roles have the same number of turns. Fast
    /// consecutive sends can fool this in either direction.
    fn select_pair(&self, turns: &[ConversationTurn]) -> Option<Candidate> {
        let (users, assistants): (Vec<&ConversationTurn>, Vec<&ConversationTurn>) =
            turns.iter().partition(|t| t.role == Role::User);
        let user = users.last()?;
        let assistant = assistants.last()?;

        let complete =
            assistant.observed_at >= user.observed_at || users.len() == assistants.len();
        if !complete {
            debug!("Latest user turn is still waiting for a response");
            return None;
        }

        let start = user.sequence_index.min(assistant.sequence_index);
        let preceding = &turns[..start.min(turns.len())];
        let window = self.config.flow_history_window;
        let history = preceding[preceding.len().saturating_sub(window)..].to_vec();

        Some(Candidate {
            user: (*user).clone(),
            assistant: (*assistant).clone(),
            history,
            session_id: String::new(),
            user_turns: users.len(),
        })
    }

    fn schedule_follow_up(&self) {
        let backend = self.backend.clone();
        let session = self.session.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let context = self
            .context_hint
            .lock()
            .ok()
            .and_then(|h| h.clone())
            .unwrap_or_else(|| GENERAL_CONTEXT.to_string());

        let spawned = self.tasks.spawn(async move {
            tokio::time::sleep(config.follow_up_delay).await;

            let history = {
                let session = session.read().await;
                let turns = session.turns();
                turns[turns.len().saturating_sub(config.follow_up_history_window)..].to_vec()
            };
            let request = FollowUpRequest {
                history,
                context,
                user_goal: config.user_goal.clone(),
            };

            match bounded(config.request_timeout, backend.generate_followup(&request)).await {
                Ok(suggestion) => {
                    debug!("Follow-up ready: {}", suggestion.followup_question);
                    events.emit(CoachEvent::FollowUpReady(suggestion));
                }
                Err(e) => warn!("Follow-up generation failed: {}", e),
            }
        });
        if spawned.is_none() {
            debug!("Monitor stopped, skipping follow-up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::monitor::source::ScriptedSource;
    use crate::protocol::IssueKind;
    use crate::session::ConversationSession;
    use crate::CoachError;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        backend: Arc<ScriptedBackend>,
        source: Arc<ScriptedSource>,
        session: SharedSession,
        orchestrator: TurnOrchestrator,
        rx: Receiver<CoachEvent>,
    }

    fn fixture(backend: ScriptedBackend) -> Fixture {
        let backend = Arc::new(backend);
        let source = Arc::new(ScriptedSource::new());
        let session = ConversationSession::shared(10);
        let (events, rx) = EventSink::channel(64);
        let orchestrator = TurnOrchestrator::new(
            backend.clone(),
            source.clone(),
            session.clone(),
            events,
            Arc::new(CoachConfig::default()),
            Arc::new(Mutex::new(None)),
        );
        Fixture {
            backend,
            source,
            session,
            orchestrator,
            rx,
        }
    }

    #[tokio::test]
    async fn test_waits_for_complete_pair() {
        let mut f = fixture(ScriptedBackend::default());

        assert_eq!(f.orchestrator.on_new_turns().await, PairOutcome::NoGrowth);

        f.source.push(Role::User, "Explain borrowing");
        assert_eq!(f.orchestrator.on_new_turns().await, PairOutcome::Incomplete);
        assert_eq!(f.backend.flow_calls.load(Ordering::SeqCst), 0);

        f.source.push(Role::Assistant, "Borrowing lets you reference data...");
        match f.orchestrator.on_new_turns().await {
            PairOutcome::Analyzed(a) => assert_eq!(a.issue_kind, IssueKind::Good),
            other => panic!("expected analysis, got {:?}", other),
        }

        // Spurious wakeup without growth
        assert_eq!(f.orchestrator.on_new_turns().await, PairOutcome::NoGrowth);
        assert_eq!(f.backend.flow_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            f.rx.try_recv(),
            Ok(CoachEvent::FlowAnalysisUpdated { new_issue: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_reread_pairs_observed_turns() {
        let f = fixture(ScriptedBackend::default());
        f.source.push(Role::User, "What does Pin guarantee?");
        f.source.push(Role::Assistant, "That the value will not move.");

        let turns = f.source.read_turns().await.unwrap();
        f.session.write().await.observe(&turns);
        f.source.set_failing(true);

        assert!(matches!(
            f.orchestrator.on_new_turns().await,
            PairOutcome::Analyzed(_)
        ));
        assert_eq!(f.backend.flow_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.session.read().await.last_paired_turn_count(), 2);
    }

    #[tokio::test]
    async fn test_dangling_user_turn_is_not_paired() {
        let f = fixture(ScriptedBackend::default());
        let now = Utc::now();
        f.source.push_turn(ConversationTurn::new(Role::User, "q1", 0).observed_at(now));
        f.source.push_turn(
            ConversationTurn::new(Role::Assistant, "a1", 0).observed_at(now + ChronoDuration::seconds(1)),
        );
        f.source.push_turn(
            ConversationTurn::new(Role::User, "q2", 0).observed_at(now + ChronoDuration::seconds(2)),
        );

        assert_eq!(f.orchestrator.on_new_turns().await, PairOutcome::Incomplete);
    }

    #[tokio::test]
    async fn test_failed_flow_call_uses_fallback() {
        let mut f = fixture(ScriptedBackend::default());
        f.backend
            .push_flow(Err(CoachError::RemoteUnavailable("network".to_string())));
        f.source.push(Role::User, "What is a trait object?");
        f.source.push(Role::Assistant, "A trait object is...");

        let outcome = f.orchestrator.on_new_turns().await;
        assert_eq!(outcome, PairOutcome::Analyzed(FlowAnalysis::fallback()));

        let session = f.session.read().await;
        assert_eq!(session.metrics.turn_count(), 1);
        assert_eq!(session.metrics.average_flow_score(), 6.0);
        let entry = session.metrics.issue_log().next().unwrap();
        assert_eq!(entry.issue_kind, IssueKind::ApiError);

        assert!(matches!(
            f.rx.try_recv(),
            Ok(CoachEvent::FlowAnalysisUpdated { new_issue: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_history_window_precedes_pair() {
        let f = fixture(ScriptedBackend::default());
        for i in 0..7 {
            f.source.push(Role::User, format!("question {}", i));
            f.source.push(Role::Assistant, format!("answer {}", i));
        }
        f.orchestrator.on_new_turns().await;

        let request = f.backend.last_flow.lock().unwrap().clone().unwrap();
        assert_eq!(request.user_message, "question 6");
        assert_eq!(request.assistant_message, "answer 6");
        assert_eq!(request.history.len(), 10);
        assert_eq!(request.history.last().unwrap().content, "answer 5");
        assert_eq!(request.session_id, f.session.read().await.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_after_good_second_turn() {
        let mut f = fixture(ScriptedBackend::default());
        f.source.push(Role::User, "first");
        f.source.push(Role::Assistant, "reply");
        f.orchestrator.on_new_turns().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.backend.followup_calls.load(Ordering::SeqCst), 0);

        f.source.push(Role::User, "second");
        f.source.push(Role::Assistant, "reply again");
        f.orchestrator.on_new_turns().await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.backend.followup_calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(f.backend.followup_calls.load(Ordering::SeqCst), 1);

        let mut follow_ups = 0;
        while let Ok(event) = f.rx.try_recv() {
            if let CoachEvent::FollowUpReady(s) = event {
                assert_eq!(s.context, GENERAL_CONTEXT);
                follow_ups += 1;
            }
        }
        assert_eq!(follow_ups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_follow_up_for_weak_turn() {
        let f = fixture(ScriptedBackend::default());
        f.backend
            .push_flow(Ok(ScriptedBackend::flow(8.0, IssueKind::Good)));
        f.backend
            .push_flow(Ok(ScriptedBackend::flow(5.0, IssueKind::Unclear)));
        f.source.push(Role::User, "first");
        f.source.push(Role::Assistant, "reply");
        f.orchestrator.on_new_turns().await;
        f.source.push(Role::User, "second");
        f.source.push(Role::Assistant, "reply again");
        f.orchestrator.on_new_turns().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.backend.followup_calls.load(Ordering::SeqCst), 0);
    }
}
