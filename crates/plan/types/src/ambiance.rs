//! Ambiance: the execution context carried from hop to hop
//!
//! An Ambiance holds the plan's setup abstractions and a stack of levels,
//! one per nested scope the current hop sits in. It is a value type:
//! deriving a context for the next hop clones and extends, it never
//! mutates the ambiance it came from. Concurrent branches therefore never
//! share a level stack.

use crate::{ExecutionNode, LevelType, NodeExecutionId, PlanExecutionId, PlanNodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of the level stack: a node invocation inside a scope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelExecution {
    /// The plan node this level instantiates
    pub setup_id: PlanNodeId,
    /// Unique per invocation, equal to the node execution id
    pub runtime_id: NodeExecutionId,
    /// Identifier recorded for this level
    pub identifier: String,
    /// Level tag, when the node declares one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_type: Option<LevelType>,
}

impl LevelExecution {
    /// A level for a fresh invocation of `node`
    pub fn for_node(node: &ExecutionNode) -> Self {
        Self {
            setup_id: node.id.clone(),
            runtime_id: NodeExecutionId::generate(),
            identifier: node.identifier.clone(),
            level_type: node.level_type.clone(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }
}

/// Execution context propagated through a plan execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    plan_execution_id: PlanExecutionId,
    #[serde(default)]
    setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    levels: Vec<LevelExecution>,
}

impl Ambiance {
    /// Root ambiance for a plan execution, with an empty level stack
    pub fn new(
        plan_execution_id: PlanExecutionId,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id,
            setup_abstractions,
            levels: Vec::new(),
        }
    }

    pub fn plan_execution_id(&self) -> &PlanExecutionId {
        &self.plan_execution_id
    }

    pub fn setup_abstractions(&self) -> &BTreeMap<String, String> {
        &self.setup_abstractions
    }

    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    /// Levels from outermost to innermost
    pub fn levels(&self) -> &[LevelExecution] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn current_level(&self) -> Option<&LevelExecution> {
        self.levels.last()
    }

    /// Runtime id of the current hop, `None` for a root ambiance
    pub fn current_runtime_id(&self) -> Option<&NodeExecutionId> {
        self.current_level().map(|l| &l.runtime_id)
    }

    pub fn current_setup_id(&self) -> Option<&PlanNodeId> {
        self.current_level().map(|l| &l.setup_id)
    }

    /// Context for a fresh invocation of `node` nested under the current hop
    pub fn derive_for_node(&self, node: &ExecutionNode) -> Self {
        self.derive_for_child(LevelExecution::for_node(node))
    }

    /// Push `level` on a copy of this ambiance
    pub fn derive_for_child(&self, level: LevelExecution) -> Self {
        let mut derived = self.clone();
        derived.levels.push(level);
        derived
    }

    /// Replace the current level with `level` on a copy of this ambiance.
    ///
    /// Used when a branch moves on to its next hop: the new hop is a
    /// sibling of the current one, not nested inside it. On a root
    /// ambiance this is the same as [`Ambiance::derive_for_child`].
    pub fn derive_for_sibling(&self, level: LevelExecution) -> Self {
        let mut derived = self.clone();
        derived.levels.pop();
        derived.levels.push(level);
        derived
    }
}
