//! Levels: how a node invocation appears on the ambiance stack

use plan_types::{ExecutionNode, LevelExecution};

/// Strategy for the level a node pushes onto the ambiance.
///
/// Resolved by the node's `level_type`. Nodes without one get
/// [`LevelExecution::for_node`]. Every call must produce a fresh runtime id.
pub trait Level: Send + Sync {
    fn level_execution(&self, node: &ExecutionNode) -> LevelExecution {
        LevelExecution::for_node(node)
    }
}

/// Level that records `<prefix>:<node identifier>` as its identifier
#[derive(Debug, Clone)]
pub struct PrefixedLevel {
    prefix: String,
}

impl PrefixedLevel {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Level for PrefixedLevel {
    fn level_execution(&self, node: &ExecutionNode) -> LevelExecution {
        LevelExecution::for_node(node).with_identifier(format!("{}:{}", self.prefix, node.identifier))
    }
}
