//! Execution records: durable state of a running plan
//!
//! A PlanExecution tracks one whole run of a plan. A NodeExecution tracks
//! one invocation of one node. Node executions of a branch form a chain
//! through `previous_id` / `next_id`; a child branch points back at the
//! node waiting on it through `parent_id` and `notify_id`.

use crate::{Ambiance, ExecutionMode, ExecutionNode, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a plan execution
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanExecutionId(pub String);

impl PlanExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PlanExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a node execution (the hop's runtime id)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeExecutionId(pub String);

impl NodeExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Statuses ─────────────────────────────────────────────────────────

/// Lifecycle of a plan execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Lifecycle of a node execution.
///
/// `Queued → [TimedWaiting →] Running → {Succeeded, Failed, Aborted}`.
/// Any non-terminal status may also jump to `Failed` or `Aborted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeExecutionStatus {
    Queued,
    TimedWaiting,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl NodeExecutionStatus {
    pub const NON_TERMINAL: [NodeExecutionStatus; 3] =
        [Self::Queued, Self::TimedWaiting, Self::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Whether a record in this status may be moved to `next`
    pub fn can_transition_to(&self, next: NodeExecutionStatus) -> bool {
        use NodeExecutionStatus::*;
        match (self, next) {
            (Queued, TimedWaiting | Running) => true,
            (TimedWaiting, Running) => true,
            (Running, Succeeded) => true,
            (Queued | TimedWaiting | Running, Failed | Aborted) => true,
            _ => false,
        }
    }

    /// The plan-level status a branch ending in this status reports
    pub fn as_execution_status(&self) -> ExecutionStatus {
        match self {
            Self::Failed => ExecutionStatus::Failed,
            Self::Aborted => ExecutionStatus::Aborted,
            Self::Succeeded => ExecutionStatus::Succeeded,
            Self::Queued | Self::TimedWaiting | Self::Running => ExecutionStatus::Running,
        }
    }
}

impl std::fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::TimedWaiting => write!(f, "TIMED_WAITING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

// ── Plan Execution ───────────────────────────────────────────────────

/// Who started an execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUser {
    pub id: String,
    pub name: String,
}

impl ExecutionUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn system() -> Self {
        Self::new("system", "System")
    }
}

/// Durable record of one run of a plan
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: PlanExecutionId,
    pub plan: Plan,
    pub status: ExecutionStatus,
    pub created_by: ExecutionUser,
    pub start_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    /// Runtime inputs supplied at start, referenced as `<+input.name>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,
}

impl PlanExecution {
    /// A new RUNNING execution of `plan`
    pub fn new(plan: Plan, created_by: ExecutionUser) -> Self {
        Self {
            id: PlanExecutionId::generate(),
            plan,
            status: ExecutionStatus::Running,
            created_by,
            start_ts: Utc::now(),
            end_ts: None,
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── Node Execution ───────────────────────────────────────────────────

/// Durable record of one invocation of one node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Equal to the runtime id of the ambiance's current level
    pub id: NodeExecutionId,
    /// Context snapshot at creation
    pub ambiance: Ambiance,
    /// The node this record instantiates
    pub node: ExecutionNode,
    pub status: NodeExecutionStatus,
    /// Set once facilitation picks a mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    pub start_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    /// The record that triggered this one within the branch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<NodeExecutionId>,
    /// The record that triggers after this one within the branch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_id: Option<NodeExecutionId>,
    /// The node waiting on this branch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeExecutionId>,
    /// Correlation id signalled when this branch ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,
    /// Earlier attempts this record retries, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_ids: Vec<NodeExecutionId>,
    /// Delay requested by facilitation before invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_wait: Option<Duration>,
    /// When an async resume was claimed for this record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_ts: Option<DateTime<Utc>>,
    /// Why the node failed, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<String>,
    /// Named outputs the behavior reported
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<String, serde_json::Value>,
    /// The node's state parameters with expressions resolved, set when
    /// the record is started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_state_parameters: Option<serde_json::Value>,
}

impl NodeExecution {
    /// A QUEUED record for the current hop of `ambiance`
    pub fn queued(id: NodeExecutionId, ambiance: Ambiance, node: ExecutionNode) -> Self {
        Self {
            id,
            ambiance,
            node,
            status: NodeExecutionStatus::Queued,
            mode: None,
            start_ts: Utc::now(),
            end_ts: None,
            previous_id: None,
            next_id: None,
            parent_id: None,
            notify_id: None,
            retry_ids: Vec::new(),
            initial_wait: None,
            resumed_ts: None,
            failure_info: None,
            outcomes: BTreeMap::new(),
            resolved_state_parameters: None,
        }
    }

    pub fn with_previous(mut self, previous_id: Option<NodeExecutionId>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<NodeExecutionId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_notify(mut self, notify_id: Option<String>) -> Self {
        self.notify_id = notify_id;
        self
    }

    pub fn with_retry_ids(mut self, retry_ids: Vec<NodeExecutionId>) -> Self {
        self.retry_ids = retry_ids;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parameters the behavior sees: resolved ones once started, the
    /// node's declared ones before that
    pub fn state_parameters(&self) -> &serde_json::Value {
        self.resolved_state_parameters
            .as_ref()
            .unwrap_or(&self.node.state_parameters)
    }

    /// How many earlier attempts of this node preceded this one
    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }
}
