//! Error types for the orchestration engine.

use std::fmt::{Display, Formatter};

/// Errors surfaced by engine operations.
///
/// Provider-level failures are recoverable inside the orchestrator and only
/// escape as `AllProvidersExhausted`; execution and timeout failures are
/// converted into completion-shaped domain events so the state machine has a
/// single failure pathway.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Malformed or unsatisfiable workflow definition. Never retried.
    Definition { message: String },
    /// Operation referenced an unknown workflow.
    NotFound { workflow_id: String },
    /// Operation is illegal in the workflow's current state. No side effects.
    InvalidState {
        workflow_id: String,
        state: String,
        operation: String,
    },
    /// A single provider attempt failed; handled by fallback inside the
    /// orchestrator.
    ProviderExecution { provider: String, message: String },
    /// Every configured provider was tried once and failed.
    AllProvidersExhausted { agent_type: String, attempts: u32 },
    /// A launched agent exceeded its timeout deadline.
    TimeoutExceeded { workflow_id: String, step_id: String },
    /// The durable store rejected an operation. The triggering mutation is
    /// aborted rather than left half-applied.
    Persistence { message: String },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Definition { message } => write!(f, "invalid definition: {}", message),
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {}", workflow_id),
            Self::InvalidState {
                workflow_id,
                state,
                operation,
            } => write!(
                f,
                "cannot {} workflow {} in state {}",
                operation, workflow_id, state
            ),
            Self::ProviderExecution { provider, message } => {
                write!(f, "provider {} failed: {}", provider, message)
            }
            Self::AllProvidersExhausted {
                agent_type,
                attempts,
            } => write!(
                f,
                "all providers exhausted for agent {} after {} attempts",
                agent_type, attempts
            ),
            Self::TimeoutExceeded {
                workflow_id,
                step_id,
            } => write!(f, "step {} of workflow {} timed out", step_id, workflow_id),
            Self::Persistence { message } => write!(f, "persistence failure: {}", message),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Wraps an underlying storage error.
    pub fn persistence(err: impl Display) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}
