//! Dual-channel change detection
//!
//! The poll timer and the source's change signal both call
//! [`ChangeDetector::poll_for_growth`]. A watermark (the session's observed
//! turn count) decides whether anything grew; a single-flight flag drops any
//! trigger that arrives while an orchestration is still running.

use super::orchestrator::{PairOutcome, TurnOrchestrator};
use super::source::ChangeSource;
use crate::session::SharedSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    NoGrowth,
    /// Growth seen while an orchestration was in flight; dropped
    Busy,
    Growth {
        from: usize,
        to: usize,
        outcome: PairOutcome,
    },
}

/// Clears the in-flight flag even if the orchestration future is dropped
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ChangeDetector {
    source: Arc<dyn ChangeSource>,
    orchestrator: Arc<TurnOrchestrator>,
    session: SharedSession,
    in_flight: AtomicBool,
}

impl ChangeDetector {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        orchestrator: Arc<TurnOrchestrator>,
        session: SharedSession,
    ) -> Self {
        Self {
            source,
            orchestrator,
            session,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Check for growth and, if found, run one orchestration.
    ///
    /// Source errors and empty reads count as no growth; the next tick retries.
    pub async fn poll_for_growth(&self) -> PollOutcome {
        let turns = match self.source.read_turns().await {
            Ok(turns) if !turns.is_empty() => turns,
            Ok(_) => return PollOutcome::NoGrowth,
            Err(e) => {
                debug!("Change source read failed: {}", e);
                return PollOutcome::NoGrowth;
            }
        };

        let watermark = self.session.read().await.last_observed_turn_count();
        if turns.len() <= watermark {
            return PollOutcome::NoGrowth;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                "Growth to {} turns while analysis in flight, dropping trigger",
                turns.len()
            );
            return PollOutcome::Busy;
        }
        let _guard = FlightGuard(&self.in_flight);

        // Advance the watermark before the slow part so the other channel
        // cannot dispatch the same growth again.
        let (from, to) = {
            let mut session = self.session.write().await;
            let from = session.last_observed_turn_count();
            session.observe(&turns);
            (from, session.last_observed_turn_count())
        };
        if to <= from {
            return PollOutcome::NoGrowth;
        }

        debug!("Conversation grew from {} to {} turns", from, to);
        let outcome = self.orchestrator.on_new_turns().await;
        PollOutcome::Growth { from, to, outcome }
    }
}
