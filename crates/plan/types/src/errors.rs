//! Error types for plan definitions

use crate::{PlanId, PlanNodeId};

/// Errors raised while building or reading a plan
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Plan {0} has no resolvable starting node")]
    NoStartingNode(PlanId),

    #[error("Node not found in plan: {0}")]
    NodeNotFound(PlanNodeId),

    #[error("Duplicate node ID: {0}")]
    DuplicateNode(PlanNodeId),
}

/// Result type alias for plan operations
pub type PlanResult<T> = Result<T, PlanError>;
