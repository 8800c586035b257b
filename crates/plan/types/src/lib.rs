//! Plan domain types
//!
//! A **Plan** is a static graph of declarative nodes. Executing it
//! produces durable records: one **PlanExecution** for the run and one
//! **NodeExecution** per node invocation.
//!
//! # Key Concepts
//!
//! - **ExecutionNode**: a unit of work. It names the behavior to run
//!   (`state_type`), the facilitators that pick *how* to run it, and the
//!   advisers that pick *what comes next*.
//! - **Ambiance**: the context carried from hop to hop. A stack of levels
//!   records where in nested scopes the current hop sits.
//! - **ExecutionMode**: sync, async, child or children; decided per
//!   invocation by facilitation.
//! - **StateResponse**: what a behavior reports when a node finishes.
//! - **Advise**: the transition an adviser picks from a state response.
//!
//! # Design Principles
//!
//! 1. Plans never change once submitted.
//! 2. Ambiances are values. Deriving one never touches its source.
//! 3. Node status only moves forward; terminal statuses are final.

#![deny(unsafe_code)]

mod advise;
mod ambiance;
mod errors;
mod execution;
mod facilitation;
mod plan;
mod response;

pub use advise::*;
pub use ambiance::*;
pub use errors::*;
pub use execution::*;
pub use facilitation::*;
pub use plan::*;
pub use response::*;
