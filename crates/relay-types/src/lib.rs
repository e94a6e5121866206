//! Relay Types - shared contracts for the gateway data plane
//!
//! This crate is the foundation layer of the relay workspace. It defines the
//! canonical chat model, the four module-kind contracts (protocol switch,
//! workflow, compatibility, provider), the per-request execution context with
//! its stage machine, and the error taxonomy surfaced across the public
//! boundary. Every other relay crate depends on this one and nothing here
//! depends back, which keeps the construction order strictly layered.

use thiserror::Error;

pub mod chat;
pub mod context;
pub mod module;
pub mod virtual_model;

#[cfg(feature = "mock")]
pub mod mock;

pub use chat::{ChatRequest, ChatResponse, Message, Protocol, Role, StreamChunk, Usage};
pub use context::{ContextSummary, ExecutionContext, ExecutionStage, StepName};
pub use module::{
    AuthDescriptor, AuthKind, ChunkStream, Compatibility, ModuleKind, ModuleStatus, Provider,
    ProviderCaps, ProviderInfo, ProviderRequest, ProviderResponse, ProtocolSwitch, Workflow,
};
pub use virtual_model::{Target, VirtualModel};

#[cfg(feature = "mock")]
pub use mock::MockProvider;

/// Error taxonomy surfaced across the gateway boundary.
///
/// Variants carry enough structure for the execution optimizer to classify
/// them as retryable or terminal without string matching.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Invalid assembly or wiring; surfaced at initialization only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Routing found no candidate able to accept traffic.
    #[error("no provider can serve virtual model '{virtual_model}'")]
    NoHealthyProvider { virtual_model: String },

    /// The provider's circuit breaker is open.
    #[error("circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    /// A pipeline step failed; wraps the underlying cause.
    #[error("step {step} in module '{module_id}' failed: {cause}")]
    Step {
        module_id: String,
        step: StepName,
        cause: Box<RelayError>,
    },

    /// Transient transport-level failure (timeout, reset, DNS).
    #[error("network error: {0}")]
    Network(String),

    /// Upstream responded with a non-success status.
    #[error("upstream returned status {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Credentials were rejected by the upstream.
    #[error("authentication with provider '{provider}' failed")]
    Authentication { provider: String },

    /// The request failed schema or semantic validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A single pipeline step exceeded its time budget.
    #[error("step {step} timed out after {timeout_ms}ms")]
    StepTimeout { step: StepName, timeout_ms: u64 },

    /// The whole request exceeded its time budget.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    /// The caller cancelled the execution.
    #[error("execution cancelled")]
    Cancelled,

    /// Admission was denied under load.
    #[error("admission rejected after {waited_ms}ms at capacity {capacity}")]
    BackpressureRejected { capacity: usize, waited_ms: u64 },

    /// Invariant violation inside the gateway itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether the execution optimizer may retry after this error.
    ///
    /// Transient network failures, 5xx and 429 upstream statuses, step
    /// timeouts and circuit rejections are retryable; authentication,
    /// validation, cancellation and overall request timeout are terminal.
    pub fn retryable(&self) -> bool {
        match self {
            RelayError::Network(_) => true,
            RelayError::StepTimeout { .. } => true,
            RelayError::CircuitOpen { .. } => true,
            RelayError::NoHealthyProvider { .. } => true,
            RelayError::Upstream { status, .. } => *status >= 500 || *status == 429,
            RelayError::Step { cause, .. } => cause.retryable(),
            _ => false,
        }
    }

    /// Stable machine-readable kind for the user-visible failure object.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Configuration(_) => "configuration",
            RelayError::NoHealthyProvider { .. } => "no_healthy_provider",
            RelayError::CircuitOpen { .. } => "circuit_open",
            RelayError::Step { .. } => "step_error",
            RelayError::Network(_) => "network",
            RelayError::Upstream { .. } => "upstream",
            RelayError::Authentication { .. } => "authentication",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::StepTimeout { .. } => "step_timeout",
            RelayError::RequestTimeout { .. } => "request_timeout",
            RelayError::Cancelled => "cancelled",
            RelayError::BackpressureRejected { .. } => "backpressure_rejected",
            RelayError::Internal(_) => "internal",
        }
    }

    /// Server-provided backoff hint, if the upstream sent one (429/503).
    pub fn retry_after_hint(&self) -> Option<std::time::Duration> {
        match self {
            RelayError::Upstream {
                retry_after_ms: Some(ms),
                ..
            } => Some(std::time::Duration::from_millis(*ms)),
            RelayError::Step { cause, .. } => cause.retry_after_hint(),
            _ => None,
        }
    }

    /// The failing module and step, when the error originated inside the chain.
    pub fn step_origin(&self) -> Option<(&str, StepName)> {
        match self {
            RelayError::Step {
                module_id, step, ..
            } => Some((module_id.as_str(), *step)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RelayError::Network("reset".into()).retryable());
        assert!(RelayError::Upstream {
            status: 503,
            message: "unavailable".into(),
            retry_after_ms: None
        }
        .retryable());
        assert!(RelayError::Upstream {
            status: 429,
            message: "slow down".into(),
            retry_after_ms: Some(250)
        }
        .retryable());
        assert!(RelayError::StepTimeout {
            step: StepName::ProviderCall,
            timeout_ms: 30_000
        }
        .retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!RelayError::Authentication {
            provider: "p1".into()
        }
        .retryable());
        assert!(!RelayError::Upstream {
            status: 400,
            message: "bad field".into(),
            retry_after_ms: None
        }
        .retryable());
        assert!(!RelayError::Cancelled.retryable());
        assert!(!RelayError::RequestTimeout { timeout_ms: 60_000 }.retryable());
    }

    #[test]
    fn step_error_delegates_to_cause() {
        let retryable = RelayError::Step {
            module_id: "provider.mock".into(),
            step: StepName::ProviderCall,
            cause: Box::new(RelayError::Network("timeout".into())),
        };
        assert!(retryable.retryable());
        assert_eq!(
            retryable.step_origin(),
            Some(("provider.mock", StepName::ProviderCall))
        );

        let terminal = RelayError::Step {
            module_id: "provider.mock".into(),
            step: StepName::ProviderCall,
            cause: Box::new(RelayError::Authentication {
                provider: "p1".into(),
            }),
        };
        assert!(!terminal.retryable());
    }

    #[test]
    fn retry_after_hint_propagates_through_step() {
        let err = RelayError::Step {
            module_id: "provider.mock".into(),
            step: StepName::ProviderCall,
            cause: Box::new(RelayError::Upstream {
                status: 429,
                message: "rate limited".into(),
                retry_after_ms: Some(1_500),
            }),
        };
        assert_eq!(
            err.retry_after_hint(),
            Some(std::time::Duration::from_millis(1_500))
        );
    }
}
