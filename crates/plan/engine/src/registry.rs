//! Lookup-by-tag tables for pluggable engine strategies
//!
//! Each registry maps a type tag to one shared implementation. Tables are
//! populated once at start-up and are read-only afterwards; the engine
//! holds them behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::advising::{Adviser, FailAdviser, OnFailAdviser, OnSuccessAdviser, RetryAdviser};
use crate::facilitation::{Facilitator, ModeFacilitator};
use crate::level::Level;
use crate::resolver::{OutcomeResolver, Resolver};
use crate::state::State;
use crate::{EngineError, EngineResult};
use plan_types::{AdviserType, ExecutionMode, FacilitatorType, RefType};

/// Tag to implementation table for one strategy role
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Register `implementation` under `tag`. A tag can be registered once.
    pub fn register(&mut self, tag: impl Into<String>, implementation: Arc<T>) -> EngineResult<()> {
        let tag = tag.into();
        if self.entries.contains_key(&tag) {
            return Err(EngineError::DuplicateRegistration {
                kind: self.kind,
                tag,
            });
        }
        tracing::debug!(kind = self.kind, tag = %tag, "Registered implementation");
        self.entries.insert(tag, implementation);
        Ok(())
    }

    /// Resolve `tag`, failing fast if nothing is registered for it
    pub fn obtain(&self, tag: &str) -> EngineResult<Arc<T>> {
        self.entries
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::UnknownType {
                kind: self.kind,
                tag: tag.to_string(),
            })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every registered implementation, in no particular order
    pub fn implementations(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.values()
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

/// All registries the engine resolves against
pub struct Registries {
    pub states: Registry<dyn State>,
    pub facilitators: Registry<dyn Facilitator>,
    pub advisers: Registry<dyn Adviser>,
    pub levels: Registry<dyn Level>,
    pub resolvers: Registry<dyn Resolver>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    /// Empty registries
    pub fn new() -> Self {
        Self {
            states: Registry::new("state"),
            facilitators: Registry::new("facilitator"),
            advisers: Registry::new("adviser"),
            levels: Registry::new("level"),
            resolvers: Registry::new("resolver"),
        }
    }

    /// Registries with the built-in facilitators, advisers and the
    /// outcome resolver. States are always supplied by the caller.
    pub fn with_defaults() -> Self {
        let mut registries = Self::new();

        let facilitators: [(&str, ExecutionMode); 4] = [
            (FacilitatorType::SYNC, ExecutionMode::Sync),
            (FacilitatorType::ASYNC, ExecutionMode::Async),
            (FacilitatorType::CHILD, ExecutionMode::Child),
            (FacilitatorType::CHILDREN, ExecutionMode::Children),
        ];
        for (tag, mode) in facilitators {
            registries
                .facilitators
                .entries
                .insert(tag.to_string(), Arc::new(ModeFacilitator::new(mode)));
        }

        let advisers: [(&str, Arc<dyn Adviser>); 4] = [
            (AdviserType::ON_SUCCESS, Arc::new(OnSuccessAdviser)),
            (AdviserType::ON_FAIL, Arc::new(OnFailAdviser)),
            (AdviserType::RETRY, Arc::new(RetryAdviser)),
            (AdviserType::FAIL, Arc::new(FailAdviser)),
        ];
        for (tag, adviser) in advisers {
            registries.advisers.entries.insert(tag.to_string(), adviser);
        }

        registries
            .resolvers
            .entries
            .insert(RefType::OUTCOME.to_string(), Arc::new(OutcomeResolver::new()));

        registries
    }

    pub fn register_state(&mut self, tag: impl Into<String>, state: Arc<dyn State>) -> EngineResult<()> {
        self.states.register(tag, state)
    }

    pub fn register_facilitator(
        &mut self,
        tag: impl Into<String>,
        facilitator: Arc<dyn Facilitator>,
    ) -> EngineResult<()> {
        self.facilitators.register(tag, facilitator)
    }

    pub fn register_adviser(&mut self, tag: impl Into<String>, adviser: Arc<dyn Adviser>) -> EngineResult<()> {
        self.advisers.register(tag, adviser)
    }

    pub fn register_level(&mut self, tag: impl Into<String>, level: Arc<dyn Level>) -> EngineResult<()> {
        self.levels.register(tag, level)
    }

    pub fn register_resolver(&mut self, tag: impl Into<String>, resolver: Arc<dyn Resolver>) -> EngineResult<()> {
        self.resolvers.register(tag, resolver)
    }
}

/// Decode obtainment parameters, treating `null` as "all defaults"
pub(crate) fn decode_parameters<T>(
    kind: &'static str,
    tag: &str,
    parameters: &serde_json::Value,
) -> EngineResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(parameters.clone()).map_err(|e| EngineError::InvalidParameters {
        kind,
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// Seconds from configuration as a duration; negative or non-finite is rejected
pub(crate) fn seconds(kind: &'static str, tag: &str, secs: f64) -> EngineResult<std::time::Duration> {
    std::time::Duration::try_from_secs_f64(secs).map_err(|e| EngineError::InvalidParameters {
        kind,
        tag: tag.to_string(),
        reason: format!("{} is not a valid number of seconds: {}", secs, e),
    })
}
