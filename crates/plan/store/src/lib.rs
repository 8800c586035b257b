//! Execution store abstractions.
//!
//! This crate defines the storage contract for the plan engine:
//! - plan execution records (one per run)
//! - node execution records (one per node invocation)
//!
//! Design stance:
//! - All mutation is field-scoped and per record. Writers name the fields
//!   they own and the condition the record must meet; they never
//!   read-modify-write a whole record.
//! - No multi-record transaction is assumed.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod traits;
mod update;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryExecutionStore;
pub use traits::{ExecutionStore, NodeExecutionStore, PlanExecutionStore};
pub use update::{NodeExecutionFilter, NodeExecutionUpdate};
