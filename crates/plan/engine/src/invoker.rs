//! Invocation: running a behavior under its execution mode
//!
//! An invoker only decides how the behavior is called. Whatever happens,
//! the engine's `handle_state_response` is eventually reached exactly once
//! for the node execution: inline for SYNC, through a broker resume for the
//! suspending modes. Behavior errors become FAILED responses.

use async_trait::async_trait;
use plan_types::{ExecutionMode, StateResponse};
use std::sync::Arc;

use crate::state::{State, StateContext, StateError};
use crate::{EngineResult, ExecutionEngine};

/// A behavior and everything it is invoked with
pub struct InvokerPackage {
    pub state: Arc<dyn State>,
    pub context: StateContext,
}

/// Runs a behavior under one execution mode
#[async_trait]
pub trait ExecutableInvoker: Send + Sync {
    async fn invoke(&self, engine: &ExecutionEngine, package: InvokerPackage) -> EngineResult<()>;
}

async fn fail_with(engine: &ExecutionEngine, context: &StateContext, error: StateError) -> EngineResult<()> {
    tracing::warn!(
        node_execution_id = %context.node_execution_id,
        error = %error,
        "State failed"
    );
    engine
        .handle_state_response(&context.node_execution_id, StateResponse::failed(error.to_string()))
        .await
}

/// SYNC: run to completion and hand the response straight back
#[derive(Debug, Default)]
pub struct SyncInvoker;

#[async_trait]
impl ExecutableInvoker for SyncInvoker {
    async fn invoke(&self, engine: &ExecutionEngine, package: InvokerPackage) -> EngineResult<()> {
        let InvokerPackage { state, context } = package;
        match state.execute_sync(&context).await {
            Ok(response) => {
                engine
                    .handle_state_response(&context.node_execution_id, response)
                    .await
            }
            Err(error) => fail_with(engine, &context, error).await,
        }
    }
}

/// ASYNC: start the work and wait for its correlation ids
#[derive(Debug, Default)]
pub struct AsyncInvoker;

#[async_trait]
impl ExecutableInvoker for AsyncInvoker {
    async fn invoke(&self, engine: &ExecutionEngine, package: InvokerPackage) -> EngineResult<()> {
        let InvokerPackage { state, context } = package;
        match state.execute_async(&context).await {
            Ok(correlation_ids) => {
                tracing::debug!(
                    node_execution_id = %context.node_execution_id,
                    callbacks = correlation_ids.len(),
                    "Node execution suspended"
                );
                engine.wait_for_resume(&context.node_execution_id, correlation_ids);
                Ok(())
            }
            Err(error) => fail_with(engine, &context, error).await,
        }
    }
}

/// CHILD: run one child branch and wait for it to end
#[derive(Debug, Default)]
pub struct ChildInvoker;

#[async_trait]
impl ExecutableInvoker for ChildInvoker {
    async fn invoke(&self, engine: &ExecutionEngine, package: InvokerPackage) -> EngineResult<()> {
        let InvokerPackage { state, context } = package;
        match state.obtain_child(&context).await {
            Ok(child) => engine.trigger_children(&context, vec![child]).await,
            Err(error) => fail_with(engine, &context, error).await,
        }
    }
}

/// CHILDREN: run child branches in parallel and wait for all of them
#[derive(Debug, Default)]
pub struct ChildrenInvoker;

#[async_trait]
impl ExecutableInvoker for ChildrenInvoker {
    async fn invoke(&self, engine: &ExecutionEngine, package: InvokerPackage) -> EngineResult<()> {
        let InvokerPackage { state, context } = package;
        match state.obtain_children(&context).await {
            Ok(children) => engine.trigger_children(&context, children).await,
            Err(error) => fail_with(engine, &context, error).await,
        }
    }
}

/// Resolves the invoker for an execution mode
#[derive(Clone)]
pub struct ExecutableInvokerFactory {
    sync: Arc<dyn ExecutableInvoker>,
    async_: Arc<dyn ExecutableInvoker>,
    child: Arc<dyn ExecutableInvoker>,
    children: Arc<dyn ExecutableInvoker>,
}

impl Default for ExecutableInvokerFactory {
    fn default() -> Self {
        Self {
            sync: Arc::new(SyncInvoker),
            async_: Arc::new(AsyncInvoker),
            child: Arc::new(ChildInvoker),
            children: Arc::new(ChildrenInvoker),
        }
    }
}

impl ExecutableInvokerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the invoker used for `mode`
    pub fn with_invoker(mut self, mode: ExecutionMode, invoker: Arc<dyn ExecutableInvoker>) -> Self {
        match mode {
            ExecutionMode::Sync => self.sync = invoker,
            ExecutionMode::Async => self.async_ = invoker,
            ExecutionMode::Child => self.child = invoker,
            ExecutionMode::Children => self.children = invoker,
        }
        self
    }

    pub fn obtain(&self, mode: ExecutionMode) -> Arc<dyn ExecutableInvoker> {
        match mode {
            ExecutionMode::Sync => self.sync.clone(),
            ExecutionMode::Async => self.async_.clone(),
            ExecutionMode::Child => self.child.clone(),
            ExecutionMode::Children => self.children.clone(),
        }
    }
}
