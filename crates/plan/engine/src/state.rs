//! The behavior contract: what a node actually does
//!
//! A [`State`] is resolved by the node's `state_type`. The engine decides
//! which of its entry points to call from the node's execution mode:
//!
//! | Mode     | Invoked                | Completed by             |
//! |----------|------------------------|--------------------------|
//! | SYNC     | `execute_sync`         | the returned response    |
//! | ASYNC    | `execute_async`        | `handle_async_response`  |
//! | CHILD    | `obtain_child`         | `handle_child_response`  |
//! | CHILDREN | `obtain_children`      | `handle_child_response`  |
//!
//! Every entry point has a default so a behavior implements only the
//! modes it supports. Errors become a FAILED response for the node.

use async_trait::async_trait;
use plan_types::{
    Ambiance, NodeExecutionId, NodeExecutionStatus, PlanNodeId, ResponseData, StateResponse,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Responses delivered to a resumed node, keyed by correlation id
pub type ResponseMap = BTreeMap<String, ResponseData>;

/// Failure reported by a behavior
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid state parameters: {0}")]
    InvalidParameters(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Execution mode {0} is not supported by this state")]
    UnsupportedMode(&'static str),
}

/// Everything a behavior sees for one invocation
#[derive(Debug, Clone)]
pub struct StateContext {
    pub ambiance: Ambiance,
    pub node_execution_id: NodeExecutionId,
    pub state_parameters: serde_json::Value,
    /// Inputs resolved from the node's ref objects, by ref object name
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Data a facilitator handed through
    pub pass_through_data: Option<serde_json::Value>,
}

impl StateContext {
    pub fn input(&self, name: &str) -> Result<&serde_json::Value, StateError> {
        self.inputs
            .get(name)
            .ok_or_else(|| StateError::MissingInput(name.to_string()))
    }

    /// Deserialize the node's state parameters
    pub fn parameters<T: serde::de::DeserializeOwned>(&self) -> Result<T, StateError> {
        serde_json::from_value(self.state_parameters.clone())
            .map_err(|e| StateError::InvalidParameters(e.to_string()))
    }
}

/// A node behavior
#[async_trait]
pub trait State: Send + Sync {
    /// Run to completion
    async fn execute_sync(&self, _ctx: &StateContext) -> Result<StateResponse, StateError> {
        Err(StateError::UnsupportedMode("SYNC"))
    }

    /// Start work elsewhere. Returns the correlation ids whose completion
    /// resumes the node.
    async fn execute_async(&self, _ctx: &StateContext) -> Result<Vec<String>, StateError> {
        Err(StateError::UnsupportedMode("ASYNC"))
    }

    /// Turn the completions of an async invocation into a response.
    ///
    /// The default succeeds and publishes each payload as an outcome
    /// named after its correlation id.
    async fn handle_async_response(
        &self,
        _ctx: &StateContext,
        responses: &ResponseMap,
    ) -> Result<StateResponse, StateError> {
        let mut response = StateResponse::succeeded();
        for (correlation_id, data) in responses {
            match data {
                ResponseData::Payload { value } => {
                    response = response.with_outcome(correlation_id.clone(), value.clone());
                }
                ResponseData::Error { message } => return Ok(StateResponse::failed(message.clone())),
                ResponseData::Status { .. } | ResponseData::Elapsed => {}
            }
        }
        Ok(response)
    }

    /// The plan node to run as this node's single child branch
    async fn obtain_child(&self, _ctx: &StateContext) -> Result<PlanNodeId, StateError> {
        Err(StateError::UnsupportedMode("CHILD"))
    }

    /// The plan nodes to run as parallel child branches
    async fn obtain_children(&self, _ctx: &StateContext) -> Result<Vec<PlanNodeId>, StateError> {
        Err(StateError::UnsupportedMode("CHILDREN"))
    }

    /// Turn the end statuses of the child branches into a response.
    ///
    /// The default succeeds only if every branch succeeded.
    async fn handle_child_response(
        &self,
        _ctx: &StateContext,
        responses: &ResponseMap,
    ) -> Result<StateResponse, StateError> {
        let failed: Vec<String> = responses
            .iter()
            .filter_map(|(notify_id, data)| match data {
                ResponseData::Status {
                    status: NodeExecutionStatus::Succeeded,
                } => None,
                ResponseData::Status { status } => Some(format!("{}: {}", notify_id, status)),
                ResponseData::Error { message } => Some(format!("{}: {}", notify_id, message)),
                ResponseData::Payload { .. } | ResponseData::Elapsed => None,
            })
            .collect();

        if failed.is_empty() {
            Ok(StateResponse::succeeded())
        } else {
            Ok(StateResponse::failed(format!(
                "child branches did not succeed: {}",
                failed.join(", ")
            )))
        }
    }
}
