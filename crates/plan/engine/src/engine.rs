//! Execution engine: the orchestrator driving plans to completion
//!
//! The engine never holds a lock over a plan. Every branch advances one
//! hop at a time through this chain:
//!
//! 1. `trigger_execution` persists a QUEUED node execution and dispatches it
//! 2. `start_node_instance` facilitates and marks it RUNNING (or TIMED_WAITING)
//! 3. `invoke_state` hands the behavior to the invoker for its mode
//! 4. `handle_state_response` records the terminal status and asks the advisers
//! 5. the advise triggers the next hop, or the branch ends
//!
//! Suspending modes leave the chain at step 3 and re-enter at step 4
//! through `resume`, called by the wait/resume broker. Every status write
//! is a guarded per-record update, so a stale or duplicate call finds the
//! record moved on and becomes a logged no-op.

use async_trait::async_trait;
use chrono::Utc;
use plan_store::{
    ExecutionStore, InMemoryExecutionStore, NodeExecutionFilter, NodeExecutionUpdate,
};
use plan_types::{
    Advise, Ambiance, AdvisingEvent, ExecutionMode, ExecutionNode, ExecutionStatus,
    ExecutionUser, FacilitatorResponse, LevelExecution, NodeExecution, NodeExecutionId,
    NodeExecutionStatus, Plan, PlanError, PlanExecution, PlanExecutionId, PlanNodeId, RefObject,
    RefType, ResponseData, StateResponse,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::expression;
use crate::invoker::{ExecutableInvokerFactory, InvokerPackage};
use crate::registry::Registries;
use crate::state::{ResponseMap, StateContext};
use crate::waiter::{WaitBroker, WaitCallback, WaitId};
use crate::worker::Worker;
use crate::{EngineConfig, EngineError, EngineResult};

struct EngineInner {
    store: Arc<dyn ExecutionStore>,
    registries: Arc<Registries>,
    invokers: ExecutableInvokerFactory,
    worker: Worker,
    broker: WaitBroker,
    config: EngineConfig,
}

/// Cheaply clonable handle to a running engine
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

/// How a new node execution attaches to its branch
enum Linkage {
    /// Next hop of the calling branch
    Continue {
        retry_ids: Vec<NodeExecutionId>,
        initial_wait: Option<Duration>,
    },
    /// First hop of a child branch
    Child {
        parent_id: NodeExecutionId,
        notify_id: String,
    },
}

/// Builder for [`ExecutionEngine`]
#[derive(Default)]
pub struct ExecutionEngineBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    registries: Option<Registries>,
    invokers: Option<ExecutableInvokerFactory>,
    config: EngineConfig,
}

impl ExecutionEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registries(mut self, registries: Registries) -> Self {
        self.registries = Some(registries);
        self
    }

    pub fn invokers(mut self, invokers: ExecutableInvokerFactory) -> Self {
        self.invokers = Some(invokers);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine. Defaults: in-memory store, built-in registries
    /// (no states), built-in invokers.
    pub fn build(self) -> EngineResult<ExecutionEngine> {
        self.config.validate()?;

        let worker = Worker::new(&self.config.worker);
        let broker = WaitBroker::new(worker.clone(), self.config.broker.clone());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()) as Arc<dyn ExecutionStore>);

        tracing::info!(
            max_concurrent_tasks = self.config.worker.max_concurrent_tasks,
            "Execution engine initialized"
        );

        Ok(ExecutionEngine {
            inner: Arc::new(EngineInner {
                store,
                registries: Arc::new(self.registries.unwrap_or_else(Registries::with_defaults)),
                invokers: self.invokers.unwrap_or_default(),
                worker,
                broker,
                config: self.config,
            }),
        })
    }
}

impl ExecutionEngine {
    pub fn builder() -> ExecutionEngineBuilder {
        ExecutionEngineBuilder::new()
    }

    fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<EngineInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    /// The broker producers report asynchronous completions to
    pub fn broker(&self) -> &WaitBroker {
        &self.inner.broker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Plan lifecycle ───────────────────────────────────────────────

    /// Start running `plan`.
    ///
    /// Fails without persisting anything if the plan's starting node does
    /// not resolve.
    pub async fn start_execution(&self, plan: Plan, created_by: ExecutionUser) -> EngineResult<PlanExecution> {
        self.start_execution_with_inputs(plan, created_by, BTreeMap::new())
            .await
    }

    /// Start running `plan` with an input set that node parameters
    /// reference as `<+input.name>`
    pub async fn start_execution_with_inputs(
        &self,
        plan: Plan,
        created_by: ExecutionUser,
        inputs: BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<PlanExecution> {
        let start = match plan.fetch_starting_node() {
            Some(node) => node.clone(),
            None => {
                tracing::error!(
                    plan_id = %plan.id,
                    starting_node_id = %plan.starting_node_id,
                    "Plan has no starting node"
                );
                return Err(PlanError::NoStartingNode(plan.id.clone()).into());
            }
        };

        let execution = PlanExecution::new(plan, created_by).with_inputs(inputs);
        self.inner.store.save_plan_execution(execution.clone()).await?;

        tracing::info!(
            plan_execution_id = %execution.id,
            plan_id = %execution.plan.id,
            created_by = %execution.created_by.id,
            inputs = execution.inputs.len(),
            "Plan execution started"
        );

        let ambiance = Ambiance::new(execution.id.clone(), execution.plan.setup_abstractions.clone());
        if let Err(e) = self.trigger_execution(&ambiance, &start).await {
            tracing::error!(plan_execution_id = %execution.id, error = %e, "Failed to trigger starting node");
            self.inner
                .store
                .update_plan_execution_status(&execution.id, ExecutionStatus::Failed)
                .await?;
            return Err(e);
        }
        Ok(execution)
    }

    /// Queue `node` as the next hop after the current node of `ambiance`.
    ///
    /// If `ambiance` has a current node, that node execution's `next_id`
    /// is set to the new record, which takes over its parent and notify
    /// linkage. A root ambiance starts a new branch.
    pub async fn trigger_execution(&self, ambiance: &Ambiance, node: &ExecutionNode) -> EngineResult<NodeExecutionId> {
        self.trigger(
            ambiance,
            node,
            Linkage::Continue {
                retry_ids: Vec::new(),
                initial_wait: None,
            },
        )
        .await
    }

    /// Start one child branch per node under the node execution of `context`,
    /// and wait for all of them to end.
    pub async fn trigger_children(&self, context: &StateContext, children: Vec<PlanNodeId>) -> EngineResult<()> {
        let plan_execution = self
            .require_plan_execution(context.ambiance.plan_execution_id())
            .await?;
        let nodes = children
            .iter()
            .map(|id| plan_execution.plan.require_node(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        let notify_ids: Vec<String> = nodes
            .iter()
            .map(|_| format!("notify-{}", uuid::Uuid::new_v4()))
            .collect();
        self.wait_for_resume(&context.node_execution_id, notify_ids.clone());

        for (node, notify_id) in nodes.iter().zip(notify_ids) {
            self.trigger(
                &context.ambiance,
                node,
                Linkage::Child {
                    parent_id: context.node_execution_id.clone(),
                    notify_id,
                },
            )
            .await?;
        }

        tracing::debug!(
            node_execution_id = %context.node_execution_id,
            children = nodes.len(),
            "Child branches started"
        );
        Ok(())
    }

    async fn trigger(&self, ambiance: &Ambiance, node: &ExecutionNode, linkage: Linkage) -> EngineResult<NodeExecutionId> {
        let plan_execution_id = ambiance.plan_execution_id();
        let plan_execution = self.require_plan_execution(plan_execution_id).await?;
        if plan_execution.is_terminal() {
            return Err(EngineError::PlanExecutionFinished(plan_execution_id.clone()));
        }

        let level = self.level_for(node)?;
        let id = level.runtime_id.clone();

        let (record, previous_id) = match linkage {
            Linkage::Continue {
                retry_ids,
                initial_wait,
            } => match ambiance.current_runtime_id() {
                Some(previous_id) => {
                    let previous = self.require_node_execution(previous_id).await?;
                    let mut record =
                        NodeExecution::queued(id.clone(), ambiance.derive_for_sibling(level), node.clone())
                            .with_previous(Some(previous.id.clone()))
                            .with_parent(previous.parent_id.clone())
                            .with_notify(previous.notify_id.clone())
                            .with_retry_ids(retry_ids);
                    record.initial_wait = initial_wait;
                    (record, Some(previous.id))
                }
                None => {
                    let mut record =
                        NodeExecution::queued(id.clone(), ambiance.derive_for_child(level), node.clone())
                            .with_retry_ids(retry_ids);
                    record.initial_wait = initial_wait;
                    (record, None)
                }
            },
            Linkage::Child {
                parent_id,
                notify_id,
            } => {
                let record = NodeExecution::queued(id.clone(), ambiance.derive_for_child(level), node.clone())
                    .with_parent(Some(parent_id))
                    .with_notify(Some(notify_id));
                (record, None)
            }
        };

        let retry_count = record.retry_count();
        self.inner.store.save_node_execution(record).await?;

        if let Some(previous_id) = previous_id {
            self.inner
                .store
                .update_node_execution(
                    &previous_id,
                    &NodeExecutionFilter::any(),
                    NodeExecutionUpdate::new().next_id(id.clone()),
                )
                .await?;
        }

        tracing::info!(
            plan_execution_id = %plan_execution_id,
            node_execution_id = %id,
            node_id = %node.id,
            retry_count,
            "Node execution queued"
        );

        self.dispatch_start(id.clone());
        Ok(id)
    }

    fn level_for(&self, node: &ExecutionNode) -> EngineResult<LevelExecution> {
        match &node.level_type {
            Some(level_type) => Ok(self
                .inner
                .registries
                .levels
                .obtain(&level_type.0)?
                .level_execution(node)),
            None => Ok(LevelExecution::for_node(node)),
        }
    }

    // ── Node lifecycle ───────────────────────────────────────────────

    /// Facilitate a QUEUED node execution and run it, or park it for its
    /// initial wait. A record that is no longer QUEUED is left alone; one
    /// whose plan execution already finished is aborted.
    pub async fn start_node_instance(&self, node_execution_id: &NodeExecutionId) -> EngineResult<()> {
        let record = self.require_node_execution(node_execution_id).await?;
        if record.status != NodeExecutionStatus::Queued {
            tracing::debug!(
                node_execution_id = %node_execution_id,
                status = %record.status,
                "Node execution already started"
            );
            return Ok(());
        }

        let plan_execution = self
            .require_plan_execution(record.ambiance.plan_execution_id())
            .await?;
        if plan_execution.is_terminal() {
            return self.abort_orphan(&record.id, &plan_execution).await;
        }

        let resolved = self.resolve_state_parameters(&record, &plan_execution).await?;
        let state_parameters = resolved.as_ref().unwrap_or(&record.node.state_parameters);
        let inputs = self.resolve_inputs(&record).await?;
        let response = self.facilitate(&record, state_parameters, &inputs).await?;
        let mode = response.execution_mode;
        let queued = NodeExecutionFilter::status_in([NodeExecutionStatus::Queued]);

        let mut update = NodeExecutionUpdate::new().mode(mode);
        if let Some(parameters) = resolved {
            update = update.resolved_state_parameters(parameters);
        }

        if let Some(wait) = record.initial_wait.or_else(|| response.effective_wait()) {
            let update = update
                .status(NodeExecutionStatus::TimedWaiting)
                .initial_wait(wait);
            if self
                .inner
                .store
                .update_node_execution(node_execution_id, &queued, update)
                .await?
                .is_none()
            {
                tracing::debug!(node_execution_id = %node_execution_id, "Node execution started elsewhere");
                return Ok(());
            }

            tracing::info!(
                node_execution_id = %node_execution_id,
                mode = %mode,
                wait_ms = wait.as_millis() as u64,
                "Node execution waiting before invocation"
            );
            let callback = Arc::new(StartCallback {
                engine: self.downgrade(),
                node_execution_id: node_execution_id.clone(),
                response,
            });
            self.inner
                .broker
                .delay(node_execution_id.as_str(), wait, callback);
            return Ok(());
        }

        let update = update.status(NodeExecutionStatus::Running);
        let Some(record) = self
            .inner
            .store
            .update_node_execution(node_execution_id, &queued, update)
            .await?
        else {
            tracing::debug!(node_execution_id = %node_execution_id, "Node execution started elsewhere");
            return Ok(());
        };

        tracing::info!(node_execution_id = %node_execution_id, mode = %mode, "Node execution running");
        self.invoke_state(&record.ambiance, &response, &record, inputs).await
    }

    async fn start_after_wait(&self, node_execution_id: &NodeExecutionId, response: FacilitatorResponse) -> EngineResult<()> {
        let record = self.require_node_execution(node_execution_id).await?;
        let plan_execution = self
            .require_plan_execution(record.ambiance.plan_execution_id())
            .await?;
        if plan_execution.is_terminal() {
            return self.abort_orphan(&record.id, &plan_execution).await;
        }

        let update = NodeExecutionUpdate::new().status(NodeExecutionStatus::Running);
        let Some(record) = self
            .inner
            .store
            .update_node_execution(
                node_execution_id,
                &NodeExecutionFilter::status_in([NodeExecutionStatus::TimedWaiting]),
                update,
            )
            .await?
        else {
            tracing::warn!(node_execution_id = %node_execution_id, "Wait elapsed for a node execution no longer waiting");
            return Ok(());
        };

        tracing::info!(
            node_execution_id = %node_execution_id,
            mode = %response.execution_mode,
            "Node execution running"
        );
        let inputs = self.resolve_inputs(&record).await?;
        self.invoke_state(&record.ambiance, &response, &record, inputs).await
    }

    /// Abort a record that was about to start under a finished plan execution
    async fn abort_orphan(&self, node_execution_id: &NodeExecutionId, plan_execution: &PlanExecution) -> EngineResult<()> {
        tracing::warn!(
            node_execution_id = %node_execution_id,
            plan_execution_id = %plan_execution.id,
            status = %plan_execution.status,
            "Plan execution already finished; node execution aborted before start"
        );
        self.abort_one(node_execution_id).await?;
        Ok(())
    }

    async fn facilitate(
        &self,
        record: &NodeExecution,
        state_parameters: &serde_json::Value,
        inputs: &BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<FacilitatorResponse> {
        for obtainment in &record.node.facilitator_obtainments {
            let facilitator = self
                .inner
                .registries
                .facilitators
                .obtain(&obtainment.facilitator_type.0)?;
            let response = facilitator
                .facilitate(
                    &record.ambiance,
                    state_parameters,
                    &obtainment.parameters,
                    inputs,
                )
                .await?;
            if let Some(response) = response {
                tracing::debug!(
                    node_execution_id = %record.id,
                    facilitator = %obtainment.facilitator_type,
                    mode = %response.execution_mode,
                    "Facilitated"
                );
                return Ok(response);
            }
        }

        let configured: Vec<String> = record
            .node
            .facilitator_types()
            .into_iter()
            .map(|t| t.0.clone())
            .collect();
        tracing::warn!(
            node_execution_id = %record.id,
            node_id = %record.node.id,
            ?configured,
            "No facilitator responded"
        );
        Err(EngineError::NoFacilitatorResponse {
            node_id: record.node.id.clone(),
            configured,
        })
    }

    async fn resolve_inputs(&self, record: &NodeExecution) -> EngineResult<BTreeMap<String, serde_json::Value>> {
        let mut inputs = BTreeMap::new();
        for ref_object in &record.node.ref_objects {
            let resolver = self
                .inner
                .registries
                .resolvers
                .obtain(&ref_object.ref_type.0)?;
            match resolver.resolve(&record.ambiance, ref_object).await? {
                Some(value) => {
                    inputs.insert(ref_object.name.clone(), value);
                }
                None => tracing::debug!(
                    node_execution_id = %record.id,
                    input = %ref_object.name,
                    key = %ref_object.key,
                    "Input not resolved"
                ),
            }
        }
        Ok(inputs)
    }

    /// The node's state parameters with every `<+scope.key>` expression
    /// replaced, or `None` when they reference nothing.
    ///
    /// Scopes: `input` reads the plan execution's input set, `setup` the
    /// ambiance's setup abstractions and `outcome` the outcome resolver.
    async fn resolve_state_parameters(
        &self,
        record: &NodeExecution,
        plan_execution: &PlanExecution,
    ) -> EngineResult<Option<serde_json::Value>> {
        let parameters = &record.node.state_parameters;
        let references = expression::references(parameters);
        if references.is_empty() {
            return Ok(None);
        }

        let mut values = HashMap::with_capacity(references.len());
        for reference in references {
            let value = match reference.split_once('.') {
                Some(("input", name)) => plan_execution.inputs.get(name).cloned(),
                Some(("setup", key)) => record
                    .ambiance
                    .setup_abstraction(key)
                    .map(|v| serde_json::Value::String(v.to_string())),
                Some(("outcome", key)) => self.resolve_outcome(&record.ambiance, key).await?,
                _ => None,
            };
            let Some(value) = value else {
                return Err(EngineError::UnresolvedExpression {
                    node_id: record.node.id.clone(),
                    expression: reference,
                });
            };
            values.insert(reference, value);
        }

        tracing::debug!(
            node_execution_id = %record.id,
            expressions = values.len(),
            "State parameters resolved"
        );
        Ok(Some(expression::substitute(parameters, &values)))
    }

    async fn resolve_outcome(&self, ambiance: &Ambiance, key: &str) -> EngineResult<Option<serde_json::Value>> {
        let resolvers = &self.inner.registries.resolvers;
        if !resolvers.contains(RefType::OUTCOME) {
            return Ok(None);
        }
        resolvers
            .obtain(RefType::OUTCOME)?
            .resolve(ambiance, &RefObject::outcome(key, key))
            .await
    }

    /// Resolve the behavior and run it through the invoker for the
    /// facilitated mode
    pub async fn invoke_state(
        &self,
        ambiance: &Ambiance,
        facilitator_response: &FacilitatorResponse,
        node_execution: &NodeExecution,
        inputs: BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<()> {
        let state = self
            .inner
            .registries
            .states
            .obtain(&node_execution.node.state_type.0)?;
        let context = StateContext {
            ambiance: ambiance.clone(),
            node_execution_id: node_execution.id.clone(),
            state_parameters: node_execution.state_parameters().clone(),
            inputs,
            pass_through_data: facilitator_response.pass_through_data.clone(),
        };

        let invoker = self
            .inner
            .invokers
            .obtain(facilitator_response.execution_mode);
        invoker.invoke(self, InvokerPackage { state, context }).await
    }

    /// Record the end of a node execution and move its branch on.
    ///
    /// Only a RUNNING record accepts a response; anything else is a stale
    /// or duplicate report and is ignored.
    pub async fn handle_state_response(
        &self,
        node_execution_id: &NodeExecutionId,
        response: StateResponse,
    ) -> EngineResult<()> {
        let response = if response.status.is_terminal() {
            response
        } else {
            tracing::warn!(
                node_execution_id = %node_execution_id,
                status = %response.status,
                "State reported a non-terminal status"
            );
            StateResponse {
                failure_info: Some(format!("state reported non-terminal status {}", response.status)),
                ..StateResponse::new(NodeExecutionStatus::Failed)
            }
        };

        let mut update = NodeExecutionUpdate::finish(response.status);
        if let Some(info) = &response.failure_info {
            update = update.failure_info(info.clone());
        }
        if !response.outcomes.is_empty() {
            update = update.outcomes(response.outcomes.clone());
        }

        let Some(record) = self
            .inner
            .store
            .update_node_execution(
                node_execution_id,
                &NodeExecutionFilter::status_in([NodeExecutionStatus::Running]),
                update,
            )
            .await?
        else {
            tracing::warn!(
                node_execution_id = %node_execution_id,
                status = %response.status,
                "Stale response ignored; node execution is not running"
            );
            return Ok(());
        };

        tracing::info!(
            plan_execution_id = %record.ambiance.plan_execution_id(),
            node_execution_id = %record.id,
            node_id = %record.node.id,
            status = %record.status,
            "Node execution finished"
        );

        if let Err(e) = self.transition(&record, &response).await {
            tracing::error!(
                node_execution_id = %record.id,
                error = %e,
                "Transition failed; ending branch"
            );
            let info = match &record.failure_info {
                Some(existing) => format!("{}; transition failed: {}", existing, e),
                None => format!("transition failed: {}", e),
            };
            self.inner
                .store
                .update_node_execution(
                    &record.id,
                    &NodeExecutionFilter::any(),
                    NodeExecutionUpdate::new().failure_info(info),
                )
                .await?;
            self.end_branch(&record, NodeExecutionStatus::Failed).await?;
        }
        Ok(())
    }

    async fn transition(&self, record: &NodeExecution, response: &StateResponse) -> EngineResult<()> {
        let plan_execution = self
            .require_plan_execution(record.ambiance.plan_execution_id())
            .await?;
        if plan_execution.is_terminal() {
            tracing::info!(
                plan_execution_id = %plan_execution.id,
                status = %plan_execution.status,
                "Plan execution already finished; branch stops"
            );
            return Ok(());
        }
        self.publish_outcomes(record, response).await?;

        match self.advise(record, response)? {
            None | Some(Advise::EndBranch) => self.end_branch(record, record.status).await,
            Some(Advise::NextStep { next_node_id }) => {
                let node = plan_execution.plan.require_node(&next_node_id)?;
                self.trigger_execution(&record.ambiance, node).await?;
                Ok(())
            }
            Some(Advise::Retry { wait }) => {
                let mut retry_ids = record.retry_ids.clone();
                retry_ids.push(record.id.clone());
                self.trigger(
                    &record.ambiance,
                    &record.node,
                    Linkage::Continue {
                        retry_ids,
                        initial_wait: wait.filter(|w| !w.is_zero()),
                    },
                )
                .await?;
                Ok(())
            }
            Some(Advise::Fail { reason }) => {
                if record.failure_info.is_none() {
                    self.inner
                        .store
                        .update_node_execution(
                            &record.id,
                            &NodeExecutionFilter::any(),
                            NodeExecutionUpdate::new().failure_info(reason.clone()),
                        )
                        .await?;
                }
                tracing::info!(node_execution_id = %record.id, reason = %reason, "Branch failed by adviser");
                self.end_branch(record, NodeExecutionStatus::Failed).await
            }
        }
    }

    fn advise(&self, record: &NodeExecution, response: &StateResponse) -> EngineResult<Option<Advise>> {
        for obtainment in &record.node.adviser_obtainments {
            let adviser = self
                .inner
                .registries
                .advisers
                .obtain(&obtainment.adviser_type.0)?;
            let event = AdvisingEvent {
                ambiance: &record.ambiance,
                state_response: response,
                adviser_parameters: &obtainment.parameters,
                retry_count: record.retry_count(),
            };
            if let Some(advise) = adviser.on_advise_event(&event)? {
                tracing::info!(
                    node_execution_id = %record.id,
                    adviser = %obtainment.adviser_type,
                    advise = advise.kind(),
                    "Advised"
                );
                return Ok(Some(advise));
            }
        }
        tracing::debug!(node_execution_id = %record.id, "No adviser matched");
        Ok(None)
    }

    async fn publish_outcomes(&self, record: &NodeExecution, response: &StateResponse) -> EngineResult<()> {
        if response.outcomes.is_empty() {
            return Ok(());
        }
        let registries = &self.inner.registries;
        if !registries.resolvers.contains(RefType::OUTCOME) {
            tracing::debug!(node_execution_id = %record.id, "No outcome resolver; outcomes kept on record only");
            return Ok(());
        }
        let resolver = registries.resolvers.obtain(RefType::OUTCOME)?;
        for (name, value) in &response.outcomes {
            resolver.consume(&record.ambiance, name, value.clone()).await?;
        }
        Ok(())
    }

    /// End the branch `record` terminated: wake the waiting parent, or
    /// finish the plan execution for a top-level branch
    async fn end_branch(&self, record: &NodeExecution, status: NodeExecutionStatus) -> EngineResult<()> {
        match &record.notify_id {
            Some(notify_id) => {
                tracing::info!(
                    node_execution_id = %record.id,
                    notify_id = %notify_id,
                    status = %status,
                    "Branch ended; notifying parent"
                );
                self.inner
                    .broker
                    .done_with(notify_id, ResponseData::status(status));
            }
            None => {
                let plan_execution_id = record.ambiance.plan_execution_id();
                match self
                    .inner
                    .store
                    .update_plan_execution_status(plan_execution_id, status.as_execution_status())
                    .await?
                {
                    Some(execution) => {
                        tracing::info!(
                            plan_execution_id = %plan_execution_id,
                            status = %execution.status,
                            "Plan execution finished"
                        );
                        self.release_plan_execution(plan_execution_id).await;
                    }
                    None => tracing::debug!(
                        plan_execution_id = %plan_execution_id,
                        "Plan execution already finished"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Let every resolver drop what it holds for a finished plan execution
    async fn release_plan_execution(&self, plan_execution_id: &PlanExecutionId) {
        for resolver in self.inner.registries.resolvers.implementations() {
            if let Err(e) = resolver.release(plan_execution_id).await {
                tracing::warn!(
                    plan_execution_id = %plan_execution_id,
                    error = %e,
                    "Resolver release failed"
                );
            }
        }
    }

    // ── Suspension and resume ────────────────────────────────────────

    /// Resume `node_execution_id` when every correlation id is delivered
    pub fn wait_for_resume(&self, node_execution_id: &NodeExecutionId, correlation_ids: Vec<String>) -> WaitId {
        let callback = Arc::new(ResumeCallback {
            engine: self.downgrade(),
            node_execution_id: node_execution_id.clone(),
        });
        self.inner
            .broker
            .wait_for_all_on(node_execution_id.as_str(), correlation_ids, callback)
    }

    /// Complete a suspended node execution.
    ///
    /// Runs at most once per record: the first call claims the resume and
    /// later calls, or calls for a record that is not RUNNING, are logged
    /// and ignored. With `async_error` set the node fails without calling
    /// the behavior.
    pub async fn resume(
        &self,
        node_execution_id: &NodeExecutionId,
        responses: ResponseMap,
        async_error: bool,
    ) -> EngineResult<()> {
        let filter = NodeExecutionFilter::status_in([NodeExecutionStatus::Running]).not_resumed();
        let Some(record) = self
            .inner
            .store
            .update_node_execution(
                node_execution_id,
                &filter,
                NodeExecutionUpdate::new().resumed_ts(Utc::now()),
            )
            .await?
        else {
            tracing::warn!(
                node_execution_id = %node_execution_id,
                "Resume ignored; node execution is not running or was already resumed"
            );
            return Ok(());
        };

        tracing::info!(
            node_execution_id = %node_execution_id,
            responses = responses.len(),
            async_error,
            "Node execution resumed"
        );

        if async_error {
            let messages: Vec<&str> = responses
                .values()
                .filter_map(|data| match data {
                    ResponseData::Error { message } => Some(message.as_str()),
                    _ => None,
                })
                .collect();
            let reason = if messages.is_empty() {
                "asynchronous task failed".to_string()
            } else {
                messages.join("; ")
            };
            return self
                .handle_state_response(node_execution_id, StateResponse::failed(reason))
                .await;
        }

        let state = self
            .inner
            .registries
            .states
            .obtain(&record.node.state_type.0)?;
        let context = StateContext {
            ambiance: record.ambiance.clone(),
            node_execution_id: record.id.clone(),
            state_parameters: record.state_parameters().clone(),
            inputs: self.resolve_inputs(&record).await?,
            pass_through_data: None,
        };

        let result = match record.mode {
            Some(ExecutionMode::Async) => state.handle_async_response(&context, &responses).await,
            Some(ExecutionMode::Child | ExecutionMode::Children) => {
                state.handle_child_response(&context, &responses).await
            }
            Some(ExecutionMode::Sync) | None => {
                return Err(EngineError::NotSuspended(node_execution_id.clone()))
            }
        };
        let response = result.unwrap_or_else(|e| StateResponse::failed(e.to_string()));
        self.handle_state_response(node_execution_id, response).await
    }

    // ── Abort ────────────────────────────────────────────────────────

    /// Abort one node execution and the child branches below it, then end
    /// its branch as ABORTED. Returns `None` if it had already finished.
    pub async fn abort_node_execution(&self, node_execution_id: &NodeExecutionId) -> EngineResult<Option<NodeExecution>> {
        let Some(record) = self.abort_one(node_execution_id).await? else {
            tracing::debug!(node_execution_id = %node_execution_id, "Nothing to abort");
            return Ok(None);
        };
        self.abort_descendants(&record).await?;
        self.end_branch(&record, NodeExecutionStatus::Aborted).await?;
        Ok(Some(record))
    }

    /// Abort a plan execution and every node execution still in progress
    pub async fn abort_plan_execution(&self, plan_execution_id: &PlanExecutionId) -> EngineResult<PlanExecution> {
        if self
            .inner
            .store
            .update_plan_execution_status(plan_execution_id, ExecutionStatus::Aborted)
            .await?
            .is_some()
        {
            tracing::info!(plan_execution_id = %plan_execution_id, "Plan execution aborted");
        }

        for record in self.inner.store.list_node_executions(plan_execution_id).await? {
            if !record.is_terminal() {
                self.abort_one(&record.id).await?;
            }
        }
        self.release_plan_execution(plan_execution_id).await;
        self.require_plan_execution(plan_execution_id).await
    }

    async fn abort_one(&self, node_execution_id: &NodeExecutionId) -> EngineResult<Option<NodeExecution>> {
        self.inner.broker.cancel_waits(node_execution_id.as_str());
        let aborted = self
            .inner
            .store
            .update_node_execution(
                node_execution_id,
                &NodeExecutionFilter::non_terminal(),
                NodeExecutionUpdate::finish(NodeExecutionStatus::Aborted),
            )
            .await?;
        if aborted.is_some() {
            tracing::info!(node_execution_id = %node_execution_id, "Node execution aborted");
        }
        Ok(aborted)
    }

    async fn abort_descendants(&self, record: &NodeExecution) -> EngineResult<()> {
        let all = self
            .inner
            .store
            .list_node_executions(record.ambiance.plan_execution_id())
            .await?;
        let mut frontier = vec![record.id.clone()];
        while let Some(parent_id) = frontier.pop() {
            for child in all.iter().filter(|r| r.parent_id.as_ref() == Some(&parent_id)) {
                if !child.is_terminal() {
                    self.abort_one(&child.id).await?;
                }
                frontier.push(child.id.clone());
            }
        }
        Ok(())
    }

    /// Mark a node execution FAILED after an internal error and end its branch
    async fn fail_node_execution(&self, node_execution_id: &NodeExecutionId, reason: String) -> EngineResult<()> {
        self.inner.broker.cancel_waits(node_execution_id.as_str());
        let Some(record) = self
            .inner
            .store
            .update_node_execution(
                node_execution_id,
                &NodeExecutionFilter::non_terminal(),
                NodeExecutionUpdate::finish(NodeExecutionStatus::Failed).failure_info(reason),
            )
            .await?
        else {
            return Ok(());
        };
        self.abort_descendants(&record).await?;
        self.end_branch(&record, NodeExecutionStatus::Failed).await
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Re-dispatch every QUEUED node execution of a running plan execution.
    ///
    /// Meant for start-up after a restart, when dispatches may have been
    /// lost. Records already started elsewhere are skipped on pickup.
    pub async fn requeue_pending(&self) -> EngineResult<usize> {
        let queued = self
            .inner
            .store
            .list_node_executions_by_status(NodeExecutionStatus::Queued)
            .await?;

        let mut requeued = 0;
        for record in queued {
            let running = self
                .inner
                .store
                .get_plan_execution(record.ambiance.plan_execution_id())
                .await?
                .is_some_and(|execution| !execution.is_terminal());
            if running {
                self.dispatch_start(record.id);
                requeued += 1;
            }
        }

        tracing::info!(requeued, "Pending node executions requeued");
        Ok(requeued)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn plan_execution(&self, id: &PlanExecutionId) -> EngineResult<Option<PlanExecution>> {
        Ok(self.inner.store.get_plan_execution(id).await?)
    }

    pub async fn node_execution(&self, id: &NodeExecutionId) -> EngineResult<Option<NodeExecution>> {
        Ok(self.inner.store.get_node_execution(id).await?)
    }

    /// Node executions of a plan execution, in creation order
    pub async fn node_executions(&self, plan_execution_id: &PlanExecutionId) -> EngineResult<Vec<NodeExecution>> {
        Ok(self.inner.store.list_node_executions(plan_execution_id).await?)
    }

    /// Resolve once no dispatched work is in flight. Suspended nodes hold
    /// no work; pending timers do.
    pub async fn wait_idle(&self) {
        self.inner.worker.wait_idle().await
    }

    /// Stop dispatching. Work already running finishes.
    pub fn shutdown(&self) {
        tracing::info!("Execution engine shutting down");
        self.inner.worker.close();
    }

    async fn require_plan_execution(&self, id: &PlanExecutionId) -> EngineResult<PlanExecution> {
        self.inner
            .store
            .get_plan_execution(id)
            .await?
            .ok_or_else(|| EngineError::PlanExecutionNotFound(id.clone()))
    }

    async fn require_node_execution(&self, id: &NodeExecutionId) -> EngineResult<NodeExecution> {
        self.inner
            .store
            .get_node_execution(id)
            .await?
            .ok_or_else(|| EngineError::NodeExecutionNotFound(id.clone()))
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn dispatch_start(&self, node_execution_id: NodeExecutionId) {
        let engine = self.clone();
        let id = node_execution_id.clone();
        self.dispatch(node_execution_id, "start_node_instance", async move {
            engine.start_node_instance(&id).await
        });
    }

    /// Run `work` for a node execution on the worker.
    ///
    /// This is the outermost boundary for that work: an error or a panic
    /// fails the node execution and ends its branch, so the plan execution
    /// never hangs on it.
    fn dispatch<F>(&self, node_execution_id: NodeExecutionId, label: &'static str, work: F)
    where
        F: Future<Output = EngineResult<()>> + Send + 'static,
    {
        let engine = self.clone();
        self.inner.worker.submit(label, async move {
            let reason = match tokio::spawn(work).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(join) if join.is_panic() => format!("{} panicked: {}", label, panic_message(join)),
                Err(_) => return,
            };

            tracing::error!(
                node_execution_id = %node_execution_id,
                task = label,
                error = %reason,
                "Node execution failed internally"
            );
            if let Err(e) = engine.fail_node_execution(&node_execution_id, reason).await {
                tracing::error!(
                    node_execution_id = %node_execution_id,
                    error = %e,
                    "Could not record internal failure"
                );
            }
        });
    }
}

fn panic_message(join: tokio::task::JoinError) -> String {
    match join.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(join) => join.to_string(),
    }
}

/// Resumes a suspended node when its wait completes
struct ResumeCallback {
    engine: Weak<EngineInner>,
    node_execution_id: NodeExecutionId,
}

#[async_trait]
impl WaitCallback for ResumeCallback {
    async fn on_done(&self, responses: ResponseMap) {
        let Some(engine) = ExecutionEngine::upgrade(&self.engine) else {
            tracing::warn!(node_execution_id = %self.node_execution_id, "Engine gone; resume dropped");
            return;
        };
        let async_error = responses.values().any(ResponseData::is_error);
        let id = self.node_execution_id.clone();
        let handle = engine.clone();
        engine.dispatch(self.node_execution_id.clone(), "resume", async move {
            handle.resume(&id, responses, async_error).await
        });
    }
}

/// Invokes a node once its initial wait has elapsed
struct StartCallback {
    engine: Weak<EngineInner>,
    node_execution_id: NodeExecutionId,
    response: FacilitatorResponse,
}

#[async_trait]
impl WaitCallback for StartCallback {
    async fn on_done(&self, _responses: ResponseMap) {
        let Some(engine) = ExecutionEngine::upgrade(&self.engine) else {
            tracing::warn!(node_execution_id = %self.node_execution_id, "Engine gone; start dropped");
            return;
        };
        let id = self.node_execution_id.clone();
        let response = self.response.clone();
        let handle = engine.clone();
        engine.dispatch(self.node_execution_id.clone(), "start_after_wait", async move {
            handle.start_after_wait(&id, response).await
        });
    }
}
