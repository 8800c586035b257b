//! Shared behaviors and builders for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use plan_engine::advising::{OnFailAdviser, OnSuccessAdviser};
use plan_engine::{
    EngineConfig, ExecutionEngine, Facilitator, ModeFacilitator, OutcomeResolver, Registries,
    Resolver, ResponseMap, State, StateContext, StateError,
};
use plan_store::{ExecutionStore, InMemoryExecutionStore};
use plan_types::{
    AdviserObtainment, Ambiance, ExecutionMode, ExecutionNode, FacilitatorObtainment,
    FacilitatorResponse, NodeExecution, NodeExecutionId, PlanNodeId, RefObject, RefType,
    StateResponse,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Harness {
    pub engine: ExecutionEngine,
    pub store: Arc<InMemoryExecutionStore>,
}

pub fn harness(registries: Registries) -> Harness {
    let store = Arc::new(InMemoryExecutionStore::new());
    let engine = ExecutionEngine::builder()
        .store(store.clone() as Arc<dyn ExecutionStore>)
        .registries(registries)
        .config(EngineConfig::default())
        .build()
        .unwrap();
    Harness { engine, store }
}

/// Built-in registries plus the test behaviors under their usual tags
pub fn registries() -> Registries {
    let mut registries = Registries::with_defaults();
    registries.register_state("succeed", Arc::new(Succeed)).unwrap();
    registries.register_state("fail", Arc::new(Fail)).unwrap();
    registries.register_state("panic", Arc::new(Panics)).unwrap();
    registries
}

/// Sync and async facilitation, the routing advisers, the test behaviors
/// and an outcome resolver the test keeps a handle on
pub fn registries_with_outcomes() -> (Registries, Arc<OutcomeResolver>) {
    let outcomes = Arc::new(OutcomeResolver::new());
    let mut registries = Registries::new();
    registries
        .register_facilitator("SYNC", Arc::new(ModeFacilitator::new(ExecutionMode::Sync)))
        .unwrap();
    registries
        .register_facilitator("ASYNC", Arc::new(ModeFacilitator::new(ExecutionMode::Async)))
        .unwrap();
    registries.register_adviser("ON_SUCCESS", Arc::new(OnSuccessAdviser)).unwrap();
    registries.register_adviser("ON_FAIL", Arc::new(OnFailAdviser)).unwrap();
    registries
        .register_resolver(RefType::OUTCOME, outcomes.clone())
        .unwrap();
    registries.register_state("succeed", Arc::new(Succeed)).unwrap();
    registries.register_state("fail", Arc::new(Fail)).unwrap();
    (registries, outcomes)
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

pub fn node(id: &str, state: &str, mode: &str) -> ExecutionNode {
    ExecutionNode::new(id, id, state).with_facilitator(FacilitatorObtainment::new(mode))
}

pub fn sync_node(id: &str, state: &str) -> ExecutionNode {
    node(id, state, "SYNC")
}

pub fn on_success(next: &str) -> AdviserObtainment {
    AdviserObtainment::new("ON_SUCCESS").with_parameters(serde_json::json!({"next_node_id": next}))
}

pub fn on_fail(next: &str) -> AdviserObtainment {
    AdviserObtainment::new("ON_FAIL").with_parameters(serde_json::json!({"next_node_id": next}))
}

/// Records of one plan execution whose node id is `node_id`, oldest first
pub fn records_for<'a>(records: &'a [NodeExecution], node_id: &str) -> Vec<&'a NodeExecution> {
    records.iter().filter(|r| r.node.id.as_str() == node_id).collect()
}

// ---------------------------------------------------------------------------
// Behaviors
// ---------------------------------------------------------------------------

/// Succeeds, publishing `{"outcome": {name: value}}` from its parameters
pub struct Succeed;

#[async_trait]
impl State for Succeed {
    async fn execute_sync(&self, ctx: &StateContext) -> Result<StateResponse, StateError> {
        let mut response = StateResponse::succeeded();
        if let Some(outcomes) = ctx.state_parameters.get("outcome").and_then(|o| o.as_object()) {
            for (name, value) in outcomes {
                response = response.with_outcome(name.clone(), value.clone());
            }
        }
        Ok(response)
    }
}

/// Fails with the reason in `{"reason": ...}`
pub struct Fail;

#[async_trait]
impl State for Fail {
    async fn execute_sync(&self, ctx: &StateContext) -> Result<StateResponse, StateError> {
        let reason = ctx
            .state_parameters
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("failed");
        Ok(StateResponse::failed(reason))
    }
}

pub struct Panics;

#[async_trait]
impl State for Panics {
    async fn execute_sync(&self, _ctx: &StateContext) -> Result<StateResponse, StateError> {
        panic!("state blew up");
    }
}

/// Fails its first `failures` invocations, then succeeds
pub struct Flaky {
    failures: usize,
    pub calls: AtomicUsize,
}

impl Flaky {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl State for Flaky {
    async fn execute_sync(&self, _ctx: &StateContext) -> Result<StateResponse, StateError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Ok(StateResponse::failed(format!("attempt {} failed", call + 1)))
        } else {
            Ok(StateResponse::succeeded())
        }
    }
}

/// Starts external work named by `{"tasks": [...]}` and counts resumes
#[derive(Default)]
pub struct External {
    pub started: AtomicUsize,
    pub resumed: AtomicUsize,
}

#[async_trait]
impl State for External {
    async fn execute_async(&self, ctx: &StateContext) -> Result<Vec<String>, StateError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        #[derive(serde::Deserialize)]
        struct Params {
            tasks: Vec<String>,
        }
        let params: Params = ctx.parameters()?;
        Ok(params.tasks)
    }

    async fn handle_async_response(
        &self,
        _ctx: &StateContext,
        responses: &ResponseMap,
    ) -> Result<StateResponse, StateError> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        let mut response = StateResponse::succeeded();
        for (id, data) in responses {
            response = response.with_outcome(id.clone(), serde_json::to_value(data).unwrap_or_default());
        }
        Ok(response)
    }
}

/// Runs the nodes in `{"children": [...]}` or `{"child": ...}`
#[derive(Default)]
pub struct Parent {
    pub resumed: AtomicUsize,
    /// Report failure even when every child succeeded
    pub fail_anyway: bool,
}

#[async_trait]
impl State for Parent {
    async fn obtain_child(&self, ctx: &StateContext) -> Result<PlanNodeId, StateError> {
        ctx.state_parameters
            .get("child")
            .and_then(|c| c.as_str())
            .map(PlanNodeId::new)
            .ok_or_else(|| StateError::InvalidParameters("child is required".into()))
    }

    async fn obtain_children(&self, ctx: &StateContext) -> Result<Vec<PlanNodeId>, StateError> {
        #[derive(serde::Deserialize)]
        struct Params {
            children: Vec<String>,
        }
        let params: Params = ctx.parameters()?;
        Ok(params.children.into_iter().map(PlanNodeId::new).collect())
    }

    async fn handle_child_response(
        &self,
        _ctx: &StateContext,
        responses: &ResponseMap,
    ) -> Result<StateResponse, StateError> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        if self.fail_anyway {
            return Ok(StateResponse::failed("parent rejected child results"));
        }
        let all_ok = responses.values().all(|data| {
            matches!(
                data,
                plan_types::ResponseData::Status {
                    status: plan_types::NodeExecutionStatus::Succeeded
                }
            )
        });
        Ok(if all_ok {
            StateResponse::succeeded()
        } else {
            StateResponse::failed("a child branch failed")
        })
    }
}

/// Requires the input named in `{"input": ...}` and echoes it as outcome `seen`
pub struct NeedsInput;

#[async_trait]
impl State for NeedsInput {
    async fn execute_sync(&self, ctx: &StateContext) -> Result<StateResponse, StateError> {
        let name = ctx
            .state_parameters
            .get("input")
            .and_then(|i| i.as_str())
            .unwrap_or("input");
        let value = ctx.input(name)?;
        Ok(StateResponse::succeeded().with_outcome("seen", value.clone()))
    }
}

/// Publishes every top-level state parameter as an outcome of the same name
pub struct EchoParameters;

#[async_trait]
impl State for EchoParameters {
    async fn execute_sync(&self, ctx: &StateContext) -> Result<StateResponse, StateError> {
        let mut response = StateResponse::succeeded();
        if let Some(params) = ctx.state_parameters.as_object() {
            for (name, value) in params {
                response = response.with_outcome(name.clone(), value.clone());
            }
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Resolves every key to its own name and counts lookups
#[derive(Default)]
pub struct CountingResolver {
    pub resolves: AtomicUsize,
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve(
        &self,
        _ambiance: &Ambiance,
        ref_object: &RefObject,
    ) -> plan_engine::EngineResult<Option<serde_json::Value>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(Some(serde_json::Value::String(ref_object.key.clone())))
    }

    async fn consume(
        &self,
        _ambiance: &Ambiance,
        _name: &str,
        _value: serde_json::Value,
    ) -> plan_engine::EngineResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Facilitators
// ---------------------------------------------------------------------------

/// Answers with `mode` (or defers when `None`) and counts its calls
pub struct Counting {
    mode: Option<ExecutionMode>,
    pub calls: AtomicUsize,
}

impl Counting {
    pub fn new(mode: Option<ExecutionMode>) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Facilitator for Counting {
    async fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _state_parameters: &serde_json::Value,
        _facilitator_parameters: &serde_json::Value,
        _inputs: &BTreeMap<String, serde_json::Value>,
    ) -> plan_engine::EngineResult<Option<FacilitatorResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.mode.map(FacilitatorResponse::new))
    }
}

/// Follow `previous_id` from `latest` back to the first hop of its branch
pub fn chain_back(records: &[NodeExecution], latest: &NodeExecutionId) -> Vec<NodeExecutionId> {
    let by_id: HashMap<&NodeExecutionId, &NodeExecution> = records.iter().map(|r| (&r.id, r)).collect();
    let mut chain = vec![latest.clone()];
    let mut current = by_id[latest];
    while let Some(previous) = &current.previous_id {
        chain.push(previous.clone());
        current = by_id[previous];
    }
    chain.reverse();
    chain
}
