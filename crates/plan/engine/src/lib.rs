//! Plan execution engine
//!
//! Drives a [`Plan`](plan_types::Plan) to completion one node invocation
//! at a time, persisting every step so execution can resume after a
//! restart or an arbitrarily long asynchronous wait.
//!
//! The engine is assembled from pluggable strategies resolved by tag:
//! - [`State`]: what a node does
//! - [`Facilitator`]: how a node runs (sync, async, child, children)
//! - [`Adviser`]: what happens after a node finishes
//! - [`Level`]: how a node appears on the ambiance stack
//! - [`Resolver`]: how node inputs and outcomes are looked up
//!
//! ```ignore
//! let mut registries = Registries::with_defaults();
//! registries.register_state("shell", Arc::new(ShellState::new()))?;
//!
//! let engine = ExecutionEngine::builder()
//!     .registries(registries)
//!     .config(EngineConfig::load(Some("plan-engine"))?)
//!     .build()?;
//!
//! let execution = engine.start_execution(plan, ExecutionUser::system()).await?;
//! ```

#![deny(unsafe_code)]

pub mod advising;
mod config;
mod engine;
mod error;
mod expression;
pub mod facilitation;
pub mod invoker;
pub mod level;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod telemetry;
pub mod waiter;
pub mod worker;

pub use advising::Adviser;
pub use config::*;
pub use engine::{ExecutionEngine, ExecutionEngineBuilder};
pub use error::{EngineError, EngineResult};
pub use facilitation::{Facilitator, ModeFacilitator};
pub use invoker::{ExecutableInvoker, ExecutableInvokerFactory, InvokerPackage};
pub use level::Level;
pub use registry::{Registries, Registry};
pub use resolver::{OutcomeResolver, Resolver};
pub use state::{ResponseMap, State, StateContext, StateError};
pub use waiter::{WaitBroker, WaitCallback, WaitId};
pub use worker::Worker;
