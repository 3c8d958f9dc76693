//! Context budget estimation
//!
//! A gauge, not a counter: each successful estimate replaces the previous
//! reading wholesale. Requests carry a monotonic ticket so that a slow
//! response can never overwrite a reading from a later request.

use super::source::ChangeSource;
use crate::backend::{bounded, CoachBackend};
use crate::protocol::{CoachEvent, ContextBudgetRequest, ContextEstimate, EventSink};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetClass {
    #[default]
    Normal,
    Approaching,
    Critical,
}

/// Latest estimate of context-window usage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBudgetReading {
    pub estimated_tokens: u64,
    pub limit: u64,
    pub usage_fraction: f64,
    pub classification: BudgetClass,
}

impl From<&ContextEstimate> for ContextBudgetReading {
    fn from(estimate: &ContextEstimate) -> Self {
        let usage_fraction = estimate.usage_fraction.unwrap_or_else(|| {
            if estimate.limit == 0 {
                0.0
            } else {
                estimate.estimated_tokens as f64 / estimate.limit as f64
            }
        });
        let classification = if estimate.critical {
            BudgetClass::Critical
        } else if estimate.approaching_limit {
            BudgetClass::Approaching
        } else {
            BudgetClass::Normal
        };
        Self {
            estimated_tokens: estimate.estimated_tokens,
            limit: estimate.limit,
            usage_fraction,
            classification,
        }
    }
}

/// Tells the estimator which model the conversation runs against
pub trait ModelDetector: Send + Sync {
    fn detect_model(&self) -> String;
}

/// Fixed model label
#[derive(Debug, Clone)]
pub struct StaticModel(String);

impl StaticModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self(model.into())
    }
}

impl ModelDetector for StaticModel {
    fn detect_model(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    reading: Option<ContextBudgetReading>,
    /// Ticket of the stored reading
    ticket: u64,
}

pub struct BudgetEstimator {
    backend: Arc<dyn CoachBackend>,
    source: Arc<dyn ChangeSource>,
    model: Arc<dyn ModelDetector>,
    events: EventSink,
    timeout: Duration,
    next_ticket: AtomicU64,
    state: Mutex<BudgetState>,
}

impl BudgetEstimator {
    pub fn new(
        backend: Arc<dyn CoachBackend>,
        source: Arc<dyn ChangeSource>,
        model: Arc<dyn ModelDetector>,
        events: EventSink,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            source,
            model,
            events,
            timeout,
            next_ticket: AtomicU64::new(1),
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Most recent accepted reading
    pub fn reading(&self) -> Option<ContextBudgetReading> {
        self.state.lock().ok().and_then(|s| s.reading.clone())
    }

    /// Estimate once. Failures keep the previous reading and are only logged.
    /// Returns the new reading when it was accepted.
    pub async fn check_budget(&self) -> Option<ContextBudgetReading> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);

        let conversation = match self.source.read_turns().await {
            Ok(turns) => turns,
            Err(e) => {
                debug!("Budget check skipped, source unreadable: {}", e);
                return None;
            }
        };
        let request = ContextBudgetRequest {
            conversation,
            model: self.model.detect_model(),
        };

        match bounded(self.timeout, self.backend.estimate_context(&request)).await {
            Ok(estimate) => self.apply(ticket, &estimate),
            Err(e) => {
                warn!("Context estimation failed, keeping previous reading: {}", e);
                None
            }
        }
    }

    fn apply(&self, ticket: u64, estimate: &ContextEstimate) -> Option<ContextBudgetReading> {
        let reading = ContextBudgetReading::from(estimate);

        let previous = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return None,
            };
            if ticket < state.ticket {
                debug!(
                    "Dropping stale budget reading (ticket {} < {})",
                    ticket, state.ticket
                );
                return None;
            }
            state.ticket = ticket;
            state.reading.replace(reading.clone())
        };

        self.events
            .emit(CoachEvent::BudgetReadingUpdated(reading.clone()));

        let was_critical = previous
            .map(|r| r.classification == BudgetClass::Critical)
            .unwrap_or(false);
        if reading.classification == BudgetClass::Critical && !was_critical {
            info!(
                "Context budget critical: {} of {} tokens",
                reading.estimated_tokens, reading.limit
            );
            self.events.emit(CoachEvent::BudgetCritical(reading.clone()));
        }

        Some(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::monitor::source::ScriptedSource;
    use crate::session::Role;
    use crate::CoachError;

    fn estimator(backend: Arc<ScriptedBackend>) -> (BudgetEstimator, tokio::sync::mpsc::Receiver<CoachEvent>) {
        let source = Arc::new(ScriptedSource::new());
        source.push(Role::User, "How big is this conversation?");
        let (events, rx) = EventSink::channel(64);
        let estimator = BudgetEstimator::new(
            backend,
            source,
            Arc::new(StaticModel::new("gpt-4o")),
            events,
            Duration::from_secs(5),
        );
        (estimator, rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<CoachEvent>) -> Vec<CoachEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_critical_fires_once_per_transition() {
        let backend = Arc::new(ScriptedBackend::default());
        for (approaching, critical) in [
            (false, false),
            (true, false),
            (true, true),
            (true, true),
            (false, false),
        ] {
            backend.push_estimate(Ok(ScriptedBackend::estimate(approaching, critical)));
        }
        let (estimator, mut rx) = estimator(backend);

        let mut classes = Vec::new();
        for _ in 0..5 {
            classes.push(estimator.check_budget().await.unwrap().classification);
        }
        assert_eq!(
            classes,
            vec![
                BudgetClass::Normal,
                BudgetClass::Approaching,
                BudgetClass::Critical,
                BudgetClass::Critical,
                BudgetClass::Normal,
            ]
        );

        let events = drain(&mut rx);
        let critical = events
            .iter()
            .filter(|e| matches!(e, CoachEvent::BudgetCritical(_)))
            .count();
        let updates = events
            .iter()
            .filter(|e| matches!(e, CoachEvent::BudgetReadingUpdated(_)))
            .count();
        assert_eq!(critical, 1);
        assert_eq!(updates, 5);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_reading() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_estimate(Ok(ScriptedBackend::estimate(true, false)));
        backend.push_estimate(Err(CoachError::RemoteUnavailable("down".to_string())));
        let (estimator, _rx) = estimator(backend);

        assert!(estimator.check_budget().await.is_some());
        assert!(estimator.check_budget().await.is_none());

        let reading = estimator.reading().unwrap();
        assert_eq!(reading.classification, BudgetClass::Approaching);
        assert_eq!(reading.usage_fraction, 1000.0 / 8000.0);
    }

    #[tokio::test]
    async fn test_out_of_order_response_is_ignored() {
        let backend = Arc::new(ScriptedBackend::default());
        let (estimator, _rx) = estimator(backend);

        let slow = estimator.next_ticket.fetch_add(1, Ordering::SeqCst);
        let fast = estimator.next_ticket.fetch_add(1, Ordering::SeqCst);

        assert!(estimator
            .apply(fast, &ScriptedBackend::estimate(true, true))
            .is_some());
        assert!(estimator
            .apply(slow, &ScriptedBackend::estimate(false, false))
            .is_none());
        assert_eq!(
            estimator.reading().unwrap().classification,
            BudgetClass::Critical
        );
    }

    #[test]
    fn test_reading_uses_reported_fraction() {
        let estimate = ContextEstimate {
            estimated_tokens: 10,
            limit: 0,
            usage_fraction: Some(0.9),
            approaching_limit: true,
            critical: false,
        };
        let reading = ContextBudgetReading::from(&estimate);
        assert_eq!(reading.usage_fraction, 0.9);

        let no_limit = ContextEstimate {
            usage_fraction: None,
            ..estimate
        };
        assert_eq!(ContextBudgetReading::from(&no_limit).usage_fraction, 0.0);
    }
}
