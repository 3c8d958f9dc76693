//! Running flow-quality metrics

use crate::protocol::IssueKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Default capacity of the issue ring buffer
pub const DEFAULT_ISSUE_LOG_CAPACITY: usize = 10;

/// One non-"good" finding
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueEntry {
    pub issue_kind: IssueKind,
    /// 1-based index of the analyzed turn pair
    pub turn_index: usize,
    pub observed_at: DateTime<Utc>,
}

/// Running mean of flow scores plus the most recent issues.
///
/// Only the orchestrator updates this, once per analyzed turn pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    average_flow_score: f64,
    turn_count: usize,
    issue_log: VecDeque<IssueEntry>,
    #[serde(skip)]
    capacity: usize,
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ISSUE_LOG_CAPACITY)
    }
}

impl QualityMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            average_flow_score: 0.0,
            turn_count: 0,
            issue_log: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn average_flow_score(&self) -> f64 {
        self.average_flow_score
    }

    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    /// Issues, oldest first
    pub fn issue_log(&self) -> impl Iterator<Item = &IssueEntry> {
        self.issue_log.iter()
    }

    pub fn issue_count(&self) -> usize {
        self.issue_log.len()
    }

    /// Record one analyzed turn pair. Returns true when an issue was logged.
    pub fn record_turn_analysis(&mut self, flow_score: f64, issue_kind: IssueKind) -> bool {
        self.record_turn_analysis_at(flow_score, issue_kind, Utc::now())
    }

    pub fn record_turn_analysis_at(
        &mut self,
        flow_score: f64,
        issue_kind: IssueKind,
        now: DateTime<Utc>,
    ) -> bool {
        let score = if flow_score.is_finite() {
            flow_score.clamp(0.0, 10.0)
        } else {
            0.0
        };

        self.turn_count += 1;
        let n = self.turn_count as f64;
        self.average_flow_score = (self.average_flow_score * (n - 1.0) + score) / n;

        if issue_kind.is_good() {
            return false;
        }

        if self.issue_log.len() == self.capacity {
            self.issue_log.pop_front();
        }
        self.issue_log.push_back(IssueEntry {
            issue_kind,
            turn_index: self.turn_count,
            observed_at: now,
        });
        true
    }
}
