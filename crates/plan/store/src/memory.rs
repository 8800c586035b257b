//! In-memory reference implementation of the execution store traits.
//!
//! Each record lives in its own `DashMap` entry, so an update holds the
//! entry lock for exactly one record while it checks the filter and
//! writes its fields. This gives the per-record atomicity the engine
//! relies on. Production deployments should use a durable backend.

use crate::traits::{NodeExecutionStore, PlanExecutionStore};
use crate::update::{NodeExecutionFilter, NodeExecutionUpdate};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use plan_types::{
    ExecutionStatus, NodeExecution, NodeExecutionId, NodeExecutionStatus, PlanExecution,
    PlanExecutionId,
};

/// In-memory execution store.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    plan_executions: DashMap<PlanExecutionId, PlanExecution>,
    node_executions: DashMap<NodeExecutionId, NodeExecution>,
    /// Node execution ids per plan execution, in creation order.
    by_plan_execution: DashMap<PlanExecutionId, Vec<NodeExecutionId>>,
    /// Every status a node execution was written with, in order.
    status_history: DashMap<NodeExecutionId, Vec<NodeExecutionStatus>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses written to a node execution, starting with its initial one.
    pub fn status_history(&self, id: &NodeExecutionId) -> Vec<NodeExecutionStatus> {
        self.status_history
            .get(id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn node_execution_count(&self) -> usize {
        self.node_executions.len()
    }

    pub fn plan_execution_count(&self) -> usize {
        self.plan_executions.len()
    }
}

#[async_trait]
impl NodeExecutionStore for InMemoryExecutionStore {
    async fn save_node_execution(&self, record: NodeExecution) -> StoreResult<()> {
        let id = record.id.clone();
        let plan_execution_id = record.ambiance.plan_execution_id().clone();
        let status = record.status;

        match self.node_executions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::Conflict(format!(
                    "node execution {} already exists",
                    id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        self.by_plan_execution
            .entry(plan_execution_id)
            .or_default()
            .push(id.clone());
        self.status_history.entry(id).or_default().push(status);
        Ok(())
    }

    async fn get_node_execution(&self, id: &NodeExecutionId) -> StoreResult<Option<NodeExecution>> {
        Ok(self.node_executions.get(id).map(|r| r.clone()))
    }

    async fn update_node_execution(
        &self,
        id: &NodeExecutionId,
        filter: &NodeExecutionFilter,
        update: NodeExecutionUpdate,
    ) -> StoreResult<Option<NodeExecution>> {
        let mut record = self
            .node_executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node execution {} not found", id)))?;

        if !filter.matches(&record) || !update.is_legal_for(&record) {
            return Ok(None);
        }

        let status = update.status;
        update.apply(&mut record);
        let written = record.clone();
        drop(record);

        if let Some(status) = status {
            self.status_history
                .entry(id.clone())
                .or_default()
                .push(status);
        }
        Ok(Some(written))
    }

    async fn list_node_executions(
        &self,
        plan_execution_id: &PlanExecutionId,
    ) -> StoreResult<Vec<NodeExecution>> {
        let ids = self
            .by_plan_execution
            .get(plan_execution_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.node_executions.get(id).map(|r| r.clone()))
            .collect())
    }

    async fn list_node_executions_by_status(
        &self,
        status: NodeExecutionStatus,
    ) -> StoreResult<Vec<NodeExecution>> {
        let mut records = self
            .node_executions
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.start_ts.cmp(&b.start_ts));
        Ok(records)
    }
}

#[async_trait]
impl PlanExecutionStore for InMemoryExecutionStore {
    async fn save_plan_execution(&self, execution: PlanExecution) -> StoreResult<()> {
        match self.plan_executions.entry(execution.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "plan execution {} already exists",
                execution.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(())
            }
        }
    }

    async fn get_plan_execution(&self, id: &PlanExecutionId) -> StoreResult<Option<PlanExecution>> {
        Ok(self.plan_executions.get(id).map(|r| r.clone()))
    }

    async fn update_plan_execution_status(
        &self,
        id: &PlanExecutionId,
        status: ExecutionStatus,
    ) -> StoreResult<Option<PlanExecution>> {
        let mut execution = self
            .plan_executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("plan execution {} not found", id)))?;

        if execution.status.is_terminal() {
            return Ok(None);
        }

        execution.status = status;
        if status.is_terminal() {
            execution.end_ts = Some(Utc::now());
        }
        Ok(Some(execution.clone()))
    }
}
