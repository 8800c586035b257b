//! Advising: what happens after a node finishes

use crate::{Ambiance, PlanNodeId, StateResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The next transition an adviser picks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advise {
    /// Continue the branch with another node of the plan
    NextStep { next_node_id: PlanNodeId },
    /// Run the same node again, after an optional wait
    Retry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait: Option<Duration>,
    },
    /// Stop the branch here
    EndBranch,
    /// Stop the branch and report it as failed
    Fail { reason: String },
}

impl Advise {
    pub fn next_step(next_node_id: impl Into<String>) -> Self {
        Self::NextStep {
            next_node_id: PlanNodeId::new(next_node_id),
        }
    }

    pub fn retry() -> Self {
        Self::Retry { wait: None }
    }

    pub fn retry_after(wait: Duration) -> Self {
        Self::Retry { wait: Some(wait) }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    /// Short name, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NextStep { .. } => "NEXT_STEP",
            Self::Retry { .. } => "RETRY",
            Self::EndBranch => "END_BRANCH",
            Self::Fail { .. } => "FAIL",
        }
    }
}

/// Everything an adviser sees when asked for advice
#[derive(Clone, Debug)]
pub struct AdvisingEvent<'a> {
    pub ambiance: &'a Ambiance,
    pub state_response: &'a StateResponse,
    pub adviser_parameters: &'a serde_json::Value,
    /// Attempts of this node before the current one
    pub retry_count: usize,
}
