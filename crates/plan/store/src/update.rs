use chrono::{DateTime, Utc};
use plan_types::{ExecutionMode, NodeExecution, NodeExecutionId, NodeExecutionStatus};
use std::collections::BTreeMap;
use std::time::Duration;

/// Condition a node execution must meet for an update to apply.
///
/// The default filter matches any record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeExecutionFilter {
    pub status_in: Option<Vec<NodeExecutionStatus>>,
    /// Only match records no resume has been claimed for yet
    pub not_resumed: bool,
}

impl NodeExecutionFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status_in(statuses: impl IntoIterator<Item = NodeExecutionStatus>) -> Self {
        Self {
            status_in: Some(statuses.into_iter().collect()),
            not_resumed: false,
        }
    }

    pub fn non_terminal() -> Self {
        Self::status_in(NodeExecutionStatus::NON_TERMINAL)
    }

    pub fn not_resumed(mut self) -> Self {
        self.not_resumed = true;
        self
    }

    pub fn matches(&self, record: &NodeExecution) -> bool {
        if let Some(statuses) = &self.status_in {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        !(self.not_resumed && record.resumed_ts.is_some())
    }
}

/// Field-scoped update of a node execution.
///
/// Only the fields set here are written; everything else on the record
/// is left as the store has it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeExecutionUpdate {
    pub status: Option<NodeExecutionStatus>,
    pub mode: Option<ExecutionMode>,
    pub end_ts: Option<DateTime<Utc>>,
    pub next_id: Option<NodeExecutionId>,
    pub initial_wait: Option<Duration>,
    pub resumed_ts: Option<DateTime<Utc>>,
    pub failure_info: Option<String>,
    pub outcomes: Option<BTreeMap<String, serde_json::Value>>,
    pub resolved_state_parameters: Option<serde_json::Value>,
}

impl NodeExecutionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: NodeExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn end_ts(mut self, end_ts: DateTime<Utc>) -> Self {
        self.end_ts = Some(end_ts);
        self
    }

    pub fn next_id(mut self, next_id: NodeExecutionId) -> Self {
        self.next_id = Some(next_id);
        self
    }

    pub fn initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = Some(wait);
        self
    }

    pub fn resumed_ts(mut self, resumed_ts: DateTime<Utc>) -> Self {
        self.resumed_ts = Some(resumed_ts);
        self
    }

    pub fn failure_info(mut self, failure_info: impl Into<String>) -> Self {
        self.failure_info = Some(failure_info.into());
        self
    }

    pub fn outcomes(mut self, outcomes: BTreeMap<String, serde_json::Value>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub fn resolved_state_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.resolved_state_parameters = Some(parameters);
        self
    }

    /// Terminal status plus end time, the usual completion write
    pub fn finish(status: NodeExecutionStatus) -> Self {
        Self::new().status(status).end_ts(Utc::now())
    }

    /// Whether writing `self` onto `record` respects the status state machine
    pub fn is_legal_for(&self, record: &NodeExecution) -> bool {
        match self.status {
            Some(next) if next != record.status => record.status.can_transition_to(next),
            Some(_) => !record.status.is_terminal(),
            None => true,
        }
    }

    /// Write the set fields onto `record`
    pub fn apply(self, record: &mut NodeExecution) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(mode) = self.mode {
            record.mode = Some(mode);
        }
        if let Some(end_ts) = self.end_ts {
            record.end_ts = Some(end_ts);
        }
        if let Some(next_id) = self.next_id {
            record.next_id = Some(next_id);
        }
        if let Some(wait) = self.initial_wait {
            record.initial_wait = Some(wait);
        }
        if let Some(resumed_ts) = self.resumed_ts {
            record.resumed_ts = Some(resumed_ts);
        }
        if let Some(failure_info) = self.failure_info {
            record.failure_info = Some(failure_info);
        }
        if let Some(outcomes) = self.outcomes {
            record.outcomes.extend(outcomes);
        }
        if let Some(parameters) = self.resolved_state_parameters {
            record.resolved_state_parameters = Some(parameters);
        }
    }
}
