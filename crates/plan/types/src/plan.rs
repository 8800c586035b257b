//! Plans: the static graph an execution walks
//!
//! A Plan is a set of execution nodes plus a designated starting node.
//! Nodes do not carry edges. What runs after a node is decided at runtime
//! by the advisers the node declares.
//!
//! Plans are immutable once submitted. To change one, build a new plan.

use crate::{PlanError, PlanResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a plan
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Setup-time identifier of a node within its plan
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Type Tags ────────────────────────────────────────────────────────

/// Tag resolving a node's behavior through the state registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateType(pub String);

impl StateType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag resolving a facilitator through the facilitator registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacilitatorType(pub String);

impl FacilitatorType {
    pub const SYNC: &'static str = "SYNC";
    pub const ASYNC: &'static str = "ASYNC";
    pub const CHILD: &'static str = "CHILD";
    pub const CHILDREN: &'static str = "CHILDREN";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for FacilitatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag resolving an adviser through the adviser registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdviserType(pub String);

impl AdviserType {
    pub const ON_SUCCESS: &'static str = "ON_SUCCESS";
    pub const ON_FAIL: &'static str = "ON_FAIL";
    pub const RETRY: &'static str = "RETRY";
    pub const FAIL: &'static str = "FAIL";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for AdviserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag resolving a nested-scope level through the level registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelType(pub String);

impl LevelType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for LevelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag resolving an input/outcome resolver through the resolver registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefType(pub String);

impl RefType {
    pub const OUTCOME: &'static str = "OUTCOME";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn outcome() -> Self {
        Self(Self::OUTCOME.to_string())
    }
}

impl std::fmt::Display for RefType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Obtainments ──────────────────────────────────────────────────────

/// A facilitator a node asks for, with its parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    pub facilitator_type: FacilitatorType,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl FacilitatorObtainment {
    pub fn new(facilitator_type: impl Into<String>) -> Self {
        Self {
            facilitator_type: FacilitatorType::new(facilitator_type),
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// An adviser a node asks for, with its parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    pub adviser_type: AdviserType,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: impl Into<String>) -> Self {
        Self {
            adviser_type: AdviserType::new(adviser_type),
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A named input reference, resolved before the node is invoked
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefObject {
    /// Name the resolved value is exposed under
    pub name: String,
    /// Key the resolver looks up
    pub key: String,
    /// Which resolver handles this reference
    pub ref_type: RefType,
}

impl RefObject {
    pub fn new(name: impl Into<String>, key: impl Into<String>, ref_type: RefType) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            ref_type,
        }
    }

    /// Reference to an outcome published earlier in the same execution
    pub fn outcome(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(name, key, RefType::outcome())
    }
}

// ── Execution Node ───────────────────────────────────────────────────

/// One declarative unit of work in a plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// Setup id, unique within the plan
    pub id: PlanNodeId,
    /// Human-readable name
    pub name: String,
    /// Short identifier recorded in the ambiance level
    pub identifier: String,
    /// Behavior to run
    pub state_type: StateType,
    /// Opaque payload interpreted by the behavior
    #[serde(default)]
    pub state_parameters: serde_json::Value,
    /// Inputs resolved before invocation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ref_objects: Vec<RefObject>,
    /// Facilitators, tried in order
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
    /// Advisers, tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    /// Nested-scope level this node opens, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_type: Option<LevelType>,
}

impl ExecutionNode {
    /// Create a node; the identifier defaults to the id
    pub fn new(id: impl Into<String>, name: impl Into<String>, state_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            identifier: id.clone(),
            id: PlanNodeId::new(id),
            name: name.into(),
            state_type: StateType::new(state_type),
            state_parameters: serde_json::Value::Null,
            ref_objects: Vec::new(),
            facilitator_obtainments: Vec::new(),
            adviser_obtainments: Vec::new(),
            level_type: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.state_parameters = parameters;
        self
    }

    pub fn with_ref_object(mut self, ref_object: RefObject) -> Self {
        self.ref_objects.push(ref_object);
        self
    }

    pub fn with_facilitator(mut self, obtainment: FacilitatorObtainment) -> Self {
        self.facilitator_obtainments.push(obtainment);
        self
    }

    pub fn with_adviser(mut self, obtainment: AdviserObtainment) -> Self {
        self.adviser_obtainments.push(obtainment);
        self
    }

    pub fn with_level(mut self, level_type: impl Into<String>) -> Self {
        self.level_type = Some(LevelType::new(level_type));
        self
    }

    /// Facilitator tags in declared order, for diagnostics
    pub fn facilitator_types(&self) -> Vec<&FacilitatorType> {
        self.facilitator_obtainments
            .iter()
            .map(|o| &o.facilitator_type)
            .collect()
    }
}

// ── Plan ─────────────────────────────────────────────────────────────

/// A static graph of nodes to execute
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique identifier
    pub id: PlanId,
    /// All nodes, in insertion order
    pub nodes: Vec<ExecutionNode>,
    /// The node execution starts from
    pub starting_node_id: PlanNodeId,
    /// Abstractions every node inherits (account, org, project, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub setup_abstractions: BTreeMap<String, String>,
}

impl Plan {
    /// Create an empty plan starting at `starting_node_id`
    pub fn new(starting_node_id: impl Into<String>) -> Self {
        Self {
            id: PlanId::generate(),
            nodes: Vec::new(),
            starting_node_id: PlanNodeId::new(starting_node_id),
            setup_abstractions: BTreeMap::new(),
        }
    }

    pub fn with_setup_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    /// Add a node to the plan
    pub fn add_node(&mut self, node: ExecutionNode) -> PlanResult<()> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(PlanError::DuplicateNode(node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Builder-style [`Plan::add_node`]
    pub fn with_node(mut self, node: ExecutionNode) -> PlanResult<Self> {
        self.add_node(node)?;
        Ok(self)
    }

    /// The starting node, if it resolves
    pub fn fetch_starting_node(&self) -> Option<&ExecutionNode> {
        self.fetch_node(&self.starting_node_id)
    }

    /// Look up a node by its setup id
    pub fn fetch_node(&self, id: &PlanNodeId) -> Option<&ExecutionNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Like [`Plan::fetch_node`], failing with [`PlanError::NodeNotFound`]
    pub fn require_node(&self, id: &PlanNodeId) -> PlanResult<&ExecutionNode> {
        self.fetch_node(id)
            .ok_or_else(|| PlanError::NodeNotFound(id.clone()))
    }

    /// Total number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
