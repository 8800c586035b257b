//! Facilitation results: how a node should run

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the behavior of a node is run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Run to completion and return the response inline
    Sync,
    /// Start work elsewhere; completion arrives later through a resume
    Async,
    /// Spawn one child branch and wait for it
    Child,
    /// Spawn several child branches and wait for all of them
    Children,
}

impl ExecutionMode {
    /// Whether the node suspends after invocation, waiting for a resume
    pub fn is_suspending(&self) -> bool {
        !matches!(self, Self::Sync)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "SYNC"),
            Self::Async => write!(f, "ASYNC"),
            Self::Child => write!(f, "CHILD"),
            Self::Children => write!(f, "CHILDREN"),
        }
    }
}

/// What a facilitator decided
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub execution_mode: ExecutionMode,
    /// Delay before the behavior is invoked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_wait: Option<Duration>,
    /// Opaque data handed to the behavior
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_through_data: Option<serde_json::Value>,
}

impl FacilitatorResponse {
    pub fn new(execution_mode: ExecutionMode) -> Self {
        Self {
            execution_mode,
            initial_wait: None,
            pass_through_data: None,
        }
    }

    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = Some(wait);
        self
    }

    pub fn with_pass_through(mut self, data: serde_json::Value) -> Self {
        self.pass_through_data = Some(data);
        self
    }

    /// The initial wait, if one was asked for and is non-zero
    pub fn effective_wait(&self) -> Option<Duration> {
        self.initial_wait.filter(|w| !w.is_zero())
    }
}
