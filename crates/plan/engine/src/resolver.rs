//! Resolvers: node inputs and outcomes

use async_trait::async_trait;
use dashmap::DashMap;
use plan_types::{Ambiance, PlanExecutionId, RefObject};

use crate::EngineResult;

/// Strategy resolving a node's declared inputs and consuming its outcomes.
///
/// Resolved by the ref object's `ref_type`.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Value for `ref_object`, or `None` if nothing was published under its key
    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> EngineResult<Option<serde_json::Value>>;

    /// Publish an outcome so later nodes can reference it
    async fn consume(&self, ambiance: &Ambiance, name: &str, value: serde_json::Value) -> EngineResult<()>;

    /// Forget everything held for a plan execution that has finished
    async fn release(&self, _plan_execution_id: &PlanExecutionId) -> EngineResult<()> {
        Ok(())
    }
}

/// Outcomes published by nodes, scoped to their plan execution.
///
/// A later publish under the same name replaces the earlier value, so a
/// retried node's last outcome wins.
#[derive(Default)]
pub struct OutcomeResolver {
    outcomes: DashMap<(PlanExecutionId, String), serde_json::Value>,
}

impl OutcomeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[async_trait]
impl Resolver for OutcomeResolver {
    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> EngineResult<Option<serde_json::Value>> {
        let key = (ambiance.plan_execution_id().clone(), ref_object.key.clone());
        Ok(self.outcomes.get(&key).map(|v| v.clone()))
    }

    async fn consume(&self, ambiance: &Ambiance, name: &str, value: serde_json::Value) -> EngineResult<()> {
        tracing::debug!(
            plan_execution_id = %ambiance.plan_execution_id(),
            outcome = name,
            "Outcome published"
        );
        self.outcomes
            .insert((ambiance.plan_execution_id().clone(), name.to_string()), value);
        Ok(())
    }

    async fn release(&self, plan_execution_id: &PlanExecutionId) -> EngineResult<()> {
        let before = self.outcomes.len();
        self.outcomes.retain(|(id, _), _| id != plan_execution_id);
        tracing::debug!(
            plan_execution_id = %plan_execution_id,
            released = before.saturating_sub(self.outcomes.len()),
            "Outcomes released"
        );
        Ok(())
    }
}
