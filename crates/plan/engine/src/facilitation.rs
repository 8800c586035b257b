//! Facilitation: deciding how a node runs

use async_trait::async_trait;
use plan_types::{Ambiance, ExecutionMode, FacilitatorResponse};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::registry::{decode_parameters, seconds};
use crate::EngineResult;

/// Strategy picking the execution mode of a node.
///
/// The engine asks a node's facilitators in declaration order and uses
/// the first `Some`. Returning `None` defers to the next facilitator.
#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn facilitate(
        &self,
        ambiance: &Ambiance,
        state_parameters: &serde_json::Value,
        facilitator_parameters: &serde_json::Value,
        inputs: &BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<Option<FacilitatorResponse>>;
}

#[derive(Debug, Default, Deserialize)]
struct WaitParameters {
    #[serde(default)]
    wait_seconds: f64,
}

/// Built-in facilitator that always answers with one fixed mode.
///
/// Reads `{"wait_seconds": n}` from its parameters to ask for an initial
/// wait before the behavior runs.
#[derive(Debug, Clone, Copy)]
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

#[async_trait]
impl Facilitator for ModeFacilitator {
    async fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _state_parameters: &serde_json::Value,
        facilitator_parameters: &serde_json::Value,
        _inputs: &BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        let tag = self.mode.to_string();
        let params: WaitParameters = decode_parameters("facilitator", &tag, facilitator_parameters)?;
        let wait = seconds("facilitator", &tag, params.wait_seconds)?;

        let mut response = FacilitatorResponse::new(self.mode);
        if !wait.is_zero() {
            response = response.with_initial_wait(wait);
        }
        Ok(Some(response))
    }
}
