//! Responses flowing back into the engine
//!
//! A [`StateResponse`] is what a behavior reports when a node finishes.
//! [`ResponseData`] is what the wait/resume broker delivers to a waiting
//! node, keyed by correlation id.

use crate::NodeExecutionStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of running a node's behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    /// Terminal status for the node execution
    pub status: NodeExecutionStatus,
    /// Named outputs published for later nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<String>,
}

impl StateResponse {
    pub fn new(status: NodeExecutionStatus) -> Self {
        Self {
            status,
            outcomes: BTreeMap::new(),
            failure_info: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(NodeExecutionStatus::Succeeded)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_info: Some(reason.into()),
            ..Self::new(NodeExecutionStatus::Failed)
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.outcomes.insert(name.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeExecutionStatus::Succeeded
    }

    pub fn is_failure(&self) -> bool {
        self.status == NodeExecutionStatus::Failed
    }
}

/// Payload delivered for one correlation id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    /// A child branch ended with this status
    Status { status: NodeExecutionStatus },
    /// An external task finished with a result
    Payload { value: serde_json::Value },
    /// An external task or timer failed
    Error { message: String },
    /// A timed wait elapsed
    Elapsed,
}

impl ResponseData {
    pub fn status(status: NodeExecutionStatus) -> Self {
        Self::Status { status }
    }

    pub fn payload(value: serde_json::Value) -> Self {
        Self::Payload { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
