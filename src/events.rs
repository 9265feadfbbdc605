//! Engine event emission for external notification/telemetry collaborators.
//!
//! Events are fanned out over a broadcast channel; delivery is best-effort
//! and never blocks engine progress. Lagging subscribers lose the oldest
//! events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{StepStatus, WorkflowState};

/// Outcome of a single provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Launched,
    Failed,
    Unavailable,
    CoolingDown,
}

/// Events emitted by the engine and orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StepStatusChanged {
        workflow_id: String,
        step_id: String,
        agent_type: String,
        status: StepStatus,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: String,
        state: WorkflowState,
        summary: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowPaused {
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowStopped {
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    ProviderAttempt {
        provider: String,
        agent_type: String,
        outcome: AttemptOutcome,
        latency_ms: u64,
    },
    AgentTimeout {
        workflow_id: String,
        step_id: String,
        agent_type: String,
        elapsed_seconds: u64,
    },
}

/// Broadcast fan-out for [`EngineEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. A send error only means there are no subscribers.
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("engine event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
