//! Per-request execution context and the pipeline stage machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{RelayError, Result};

/// The seven fixed transforms of the pipeline chain, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    SwitchRequest,
    WorkflowRequest,
    CompatRequest,
    ProviderCall,
    CompatResponse,
    WorkflowResponse,
    SwitchResponse,
}

impl StepName {
    /// All seven steps in declared order.
    pub const ALL: [StepName; 7] = [
        StepName::SwitchRequest,
        StepName::WorkflowRequest,
        StepName::CompatRequest,
        StepName::ProviderCall,
        StepName::CompatResponse,
        StepName::WorkflowResponse,
        StepName::SwitchResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::SwitchRequest => "switch_request",
            StepName::WorkflowRequest => "workflow_request",
            StepName::CompatRequest => "compat_request",
            StepName::ProviderCall => "provider_call",
            StepName::CompatResponse => "compat_response",
            StepName::WorkflowResponse => "workflow_response",
            StepName::SwitchResponse => "switch_response",
        }
    }

    /// The stage the context enters while this step runs.
    pub fn stage(&self) -> ExecutionStage {
        match self {
            StepName::SwitchRequest => ExecutionStage::SwitchRequest,
            StepName::WorkflowRequest => ExecutionStage::WorkflowRequest,
            StepName::CompatRequest => ExecutionStage::CompatRequest,
            StepName::ProviderCall => ExecutionStage::ProviderCall,
            StepName::CompatResponse => ExecutionStage::CompatResponse,
            StepName::WorkflowResponse => ExecutionStage::WorkflowResponse,
            StepName::SwitchResponse => ExecutionStage::SwitchResponse,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage of a single execution.
///
/// Transitions run forward through the step stages into `Completed`;
/// `ErrorHandling` is reachable from any live stage. Both terminal stages
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    RequestInit,
    SwitchRequest,
    WorkflowRequest,
    CompatRequest,
    ProviderCall,
    CompatResponse,
    WorkflowResponse,
    SwitchResponse,
    Completed,
    ErrorHandling,
}

impl ExecutionStage {
    fn order(self) -> Option<u8> {
        match self {
            ExecutionStage::RequestInit => Some(0),
            ExecutionStage::SwitchRequest => Some(1),
            ExecutionStage::WorkflowRequest => Some(2),
            ExecutionStage::CompatRequest => Some(3),
            ExecutionStage::ProviderCall => Some(4),
            ExecutionStage::CompatResponse => Some(5),
            ExecutionStage::WorkflowResponse => Some(6),
            ExecutionStage::SwitchResponse => Some(7),
            ExecutionStage::Completed | ExecutionStage::ErrorHandling => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStage::Completed | ExecutionStage::ErrorHandling)
    }

    /// Whether the stage machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ExecutionStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ExecutionStage::ErrorHandling => true,
            ExecutionStage::Completed => self == ExecutionStage::SwitchResponse,
            _ => match (self.order(), next.order()) {
                (Some(cur), Some(n)) => n == cur + 1,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStage::RequestInit => "request_init",
            ExecutionStage::SwitchRequest => "switch_request",
            ExecutionStage::WorkflowRequest => "workflow_request",
            ExecutionStage::CompatRequest => "compat_request",
            ExecutionStage::ProviderCall => "provider_call",
            ExecutionStage::CompatResponse => "compat_response",
            ExecutionStage::WorkflowResponse => "workflow_response",
            ExecutionStage::SwitchResponse => "switch_response",
            ExecutionStage::Completed => "completed",
            ExecutionStage::ErrorHandling => "error_handling",
        }
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request context, exclusively owned by one executor invocation.
///
/// Modules receive it by shared reference; only the executor mutates the
/// stage and timings.
#[derive(Debug)]
pub struct ExecutionContext {
    pub session_id: String,
    pub request_id: String,
    pub execution_id: Uuid,
    pub trace_id: Uuid,
    pub virtual_model: String,
    pub provider_id: Option<String>,
    started_at: Instant,
    started_at_utc: chrono::DateTime<chrono::Utc>,
    stage: ExecutionStage,
    stage_timings: HashMap<StepName, Duration>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        virtual_model: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            execution_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            virtual_model: virtual_model.into(),
            provider_id: None,
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now(),
            stage: ExecutionStage::RequestInit,
            stage_timings: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn stage(&self) -> ExecutionStage {
        self.stage
    }

    /// Advance the stage machine, rejecting any transition the table forbids.
    pub fn advance(&mut self, next: ExecutionStage) -> Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(RelayError::Internal(format!(
                "illegal stage transition {} -> {}",
                self.stage, next
            )));
        }
        self.stage = next;
        Ok(())
    }

    pub fn record_stage_timing(&mut self, step: StepName, elapsed: Duration) {
        self.stage_timings.insert(step, elapsed);
    }

    pub fn stage_timings(&self) -> &HashMap<StepName, Duration> {
        &self.stage_timings
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn started_at_utc(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at_utc
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Serializable snapshot for result objects and debug records.
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            session_id: self.session_id.clone(),
            request_id: self.request_id.clone(),
            execution_id: self.execution_id,
            trace_id: self.trace_id,
            virtual_model: self.virtual_model.clone(),
            provider_id: self.provider_id.clone(),
            stage: self.stage,
            stage_timings_ms: self
                .stage_timings
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.as_millis() as u64))
                .collect(),
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }
}

/// Snapshot of an [`ExecutionContext`], attached to execution reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub session_id: String,
    pub request_id: String,
    pub execution_id: Uuid,
    pub trace_id: Uuid,
    pub virtual_model: String,
    pub provider_id: Option<String>,
    pub stage: ExecutionStage,
    pub stage_timings_ms: HashMap<String, u64>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_in_order() {
        let mut ctx = ExecutionContext::new("s", "r", "vm");
        for step in StepName::ALL {
            ctx.advance(step.stage()).unwrap();
        }
        ctx.advance(ExecutionStage::Completed).unwrap();
        assert!(ctx.stage().is_terminal());
    }

    #[test]
    fn terminal_stages_absorb() {
        let mut ctx = ExecutionContext::new("s", "r", "vm");
        ctx.advance(ExecutionStage::ErrorHandling).unwrap();
        assert!(ctx.advance(ExecutionStage::SwitchRequest).is_err());
        assert!(ctx.advance(ExecutionStage::Completed).is_err());
    }

    #[test]
    fn stages_cannot_skip() {
        let mut ctx = ExecutionContext::new("s", "r", "vm");
        assert!(ctx.advance(ExecutionStage::ProviderCall).is_err());
        ctx.advance(ExecutionStage::SwitchRequest).unwrap();
        assert!(ctx.advance(ExecutionStage::Completed).is_err());
    }

    #[test]
    fn error_handling_reachable_from_any_live_stage() {
        for step in StepName::ALL {
            let mut ctx = ExecutionContext::new("s", "r", "vm");
            let mut ok = true;
            for s in StepName::ALL {
                ctx.advance(s.stage()).unwrap();
                if s == step {
                    break;
                }
            }
            ok &= ctx.advance(ExecutionStage::ErrorHandling).is_ok();
            assert!(ok, "error_handling unreachable from {}", step);
        }
    }
}
