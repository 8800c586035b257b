//! Advising: deciding what happens after a node finishes
//!
//! The engine asks a node's advisers in declaration order; the first
//! `Some(Advise)` wins. When nobody answers the branch ends.

use plan_types::{Advise, AdviserType, AdvisingEvent, NodeExecutionStatus};
use serde::Deserialize;

use crate::registry::{decode_parameters, seconds};
use crate::EngineResult;

/// Strategy picking the next transition for a finished node
pub trait Adviser: Send + Sync {
    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> EngineResult<Option<Advise>>;
}

#[derive(Debug, Default, Deserialize)]
struct NextNodeParameters {
    next_node_id: Option<String>,
}

fn next_step_on(
    tag: &str,
    wanted: NodeExecutionStatus,
    event: &AdvisingEvent<'_>,
) -> EngineResult<Option<Advise>> {
    if event.state_response.status != wanted {
        return Ok(None);
    }
    let params: NextNodeParameters = decode_parameters("adviser", tag, event.adviser_parameters)?;
    Ok(params.next_node_id.map(Advise::next_step))
}

/// Continue with `next_node_id` when the node succeeded
#[derive(Debug, Clone, Copy, Default)]
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> EngineResult<Option<Advise>> {
        next_step_on(AdviserType::ON_SUCCESS, NodeExecutionStatus::Succeeded, event)
    }
}

/// Continue with `next_node_id` when the node failed
#[derive(Debug, Clone, Copy, Default)]
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> EngineResult<Option<Advise>> {
        next_step_on(AdviserType::ON_FAIL, NodeExecutionStatus::Failed, event)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RetryParameters {
    #[serde(default)]
    retry_count: usize,
    /// Wait before each attempt, in seconds; the last entry repeats
    #[serde(default)]
    wait_intervals: Vec<f64>,
}

/// Run a failed node again while attempts remain.
///
/// Parameters: `{"retry_count": n, "wait_intervals": [s, ...]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> EngineResult<Option<Advise>> {
        if event.state_response.status != NodeExecutionStatus::Failed {
            return Ok(None);
        }
        let params: RetryParameters =
            decode_parameters("adviser", AdviserType::RETRY, event.adviser_parameters)?;
        if event.retry_count >= params.retry_count {
            return Ok(None);
        }

        let interval = params
            .wait_intervals
            .get(event.retry_count)
            .or_else(|| params.wait_intervals.last())
            .copied();
        match interval {
            Some(secs) => {
                let wait = seconds("adviser", AdviserType::RETRY, secs)?;
                Ok(Some(if wait.is_zero() {
                    Advise::retry()
                } else {
                    Advise::retry_after(wait)
                }))
            }
            None => Ok(Some(Advise::retry())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FailParameters {
    reason: Option<String>,
}

/// Fail the branch when the node failed
#[derive(Debug, Clone, Copy, Default)]
pub struct FailAdviser;

impl Adviser for FailAdviser {
    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> EngineResult<Option<Advise>> {
        if event.state_response.status != NodeExecutionStatus::Failed {
            return Ok(None);
        }
        let params: FailParameters =
            decode_parameters("adviser", AdviserType::FAIL, event.adviser_parameters)?;
        let reason = params
            .reason
            .or_else(|| event.state_response.failure_info.clone())
            .unwrap_or_else(|| "node failed".to_string());
        Ok(Some(Advise::fail(reason)))
    }
}
