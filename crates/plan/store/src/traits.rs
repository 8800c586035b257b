use crate::update::{NodeExecutionFilter, NodeExecutionUpdate};
use crate::StoreResult;
use async_trait::async_trait;
use plan_types::{
    ExecutionStatus, NodeExecution, NodeExecutionId, NodeExecutionStatus, PlanExecution,
    PlanExecutionId,
};

/// Storage interface for node execution records.
///
/// Every write is scoped to one record. Implementations must apply an
/// update atomically with respect to other writers of the same record;
/// no multi-record transaction is required.
#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id exists.
    async fn save_node_execution(&self, record: NodeExecution) -> StoreResult<()>;

    /// Get one record by id.
    async fn get_node_execution(&self, id: &NodeExecutionId) -> StoreResult<Option<NodeExecution>>;

    /// Apply `update` if the record matches `filter`.
    ///
    /// Returns the record as written, or `None` when the filter did not
    /// match or the update would move the status backwards or out of a
    /// terminal status. Fails with `NotFound` if the id is unknown.
    async fn update_node_execution(
        &self,
        id: &NodeExecutionId,
        filter: &NodeExecutionFilter,
        update: NodeExecutionUpdate,
    ) -> StoreResult<Option<NodeExecution>>;

    /// All records of a plan execution, in creation order.
    async fn list_node_executions(
        &self,
        plan_execution_id: &PlanExecutionId,
    ) -> StoreResult<Vec<NodeExecution>>;

    /// All records currently in `status`, across plan executions.
    async fn list_node_executions_by_status(
        &self,
        status: NodeExecutionStatus,
    ) -> StoreResult<Vec<NodeExecution>>;
}

/// Storage interface for plan execution records.
#[async_trait]
pub trait PlanExecutionStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id exists.
    async fn save_plan_execution(&self, execution: PlanExecution) -> StoreResult<()>;

    /// Get one record by id.
    async fn get_plan_execution(&self, id: &PlanExecutionId) -> StoreResult<Option<PlanExecution>>;

    /// Move a RUNNING execution to `status`, stamping the end time when
    /// the status is terminal. Returns `None` if the execution had
    /// already reached a terminal status.
    async fn update_plan_execution_status(
        &self,
        id: &PlanExecutionId,
        status: ExecutionStatus,
    ) -> StoreResult<Option<PlanExecution>>;
}

/// Unified store bundle used by the engine.
pub trait ExecutionStore: NodeExecutionStore + PlanExecutionStore + Send + Sync {}

impl<T> ExecutionStore for T where T: NodeExecutionStore + PlanExecutionStore + Send + Sync {}
