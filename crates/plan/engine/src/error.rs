//! Error types for the plan engine

use plan_store::StoreError;
use plan_types::{NodeExecutionId, PlanError, PlanExecutionId, PlanNodeId};
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the engine and its registries
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown {kind} type: {tag}")]
    UnknownType { kind: &'static str, tag: String },

    #[error("Duplicate {kind} registration: {tag}")]
    DuplicateRegistration { kind: &'static str, tag: String },

    #[error("No facilitator responded for node {node_id} (configured: {configured:?})")]
    NoFacilitatorResponse {
        node_id: PlanNodeId,
        configured: Vec<String>,
    },

    #[error("Invalid parameters for {kind} {tag}: {reason}")]
    InvalidParameters {
        kind: &'static str,
        tag: String,
        reason: String,
    },

    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(NodeExecutionId),

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(PlanExecutionId),

    #[error("Plan execution {0} already finished")]
    PlanExecutionFinished(PlanExecutionId),

    #[error("Unresolved expression <+{expression}> in parameters of node {node_id}")]
    UnresolvedExpression { node_id: PlanNodeId, expression: String },

    #[error("Node execution {0} is not suspended")]
    NotSuspended(NodeExecutionId),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl EngineError {
    /// Configuration problems are fatal for their path and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownType { .. }
                | Self::DuplicateRegistration { .. }
                | Self::NoFacilitatorResponse { .. }
                | Self::InvalidParameters { .. }
                | Self::UnresolvedExpression { .. }
                | Self::Plan(PlanError::NoStartingNode(_))
                | Self::Config(_)
                | Self::InvalidConfig(_)
        )
    }
}
