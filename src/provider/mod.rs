//! Execution backends for agent launches.
//!
//! A provider turns an [`ExecutionRequest`] into a running agent and hands
//! back a cancellable [`AgentHandle`]. The supervisor depends only on the
//! handle interface (never on OS process semantics), so subprocess and
//! API-backed agents are interchangeable.

pub mod http;
pub mod orchestrator;
pub mod process;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Context for one agent launch.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    pub step_id: String,
    pub agent_type: String,
    pub subject: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout_seconds: u64,
    pub metadata: BTreeMap<String, String>,
}

/// A cancellable reference to an in-flight agent execution.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Correlation id (PID-derived for subprocesses, server-issued for API
    /// calls).
    fn id(&self) -> String;

    /// OS process id, when the agent runs as a local subprocess.
    fn pid(&self) -> Option<u32>;

    /// Whether the underlying execution is still running.
    async fn is_alive(&self) -> bool;

    /// Requests termination. Idempotent; errors are advisory.
    async fn terminate(&self) -> anyhow::Result<()>;
}

/// An execution backend capable of launching agents.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend can currently accept launches.
    async fn check_availability(&self) -> bool;

    /// Starts an agent and returns its handle. Must return promptly; the
    /// agent itself completes out of band.
    async fn launch(&self, request: &ExecutionRequest) -> anyhow::Result<Box<dyn AgentHandle>>;
}

/// Result of a successful `execute` call on the orchestrator.
pub struct AgentResult {
    pub provider_used: String,
    pub output: String,
    pub attempts: u32,
    pub handle: Box<dyn AgentHandle>,
}

impl std::fmt::Debug for AgentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentResult")
            .field("provider_used", &self.provider_used)
            .field("output", &self.output)
            .field("attempts", &self.attempts)
            .field("handle", &"<dyn AgentHandle>")
            .finish()
    }
}

/// Substitutes `{placeholder}` variables in an argument template.
pub fn render_template(template: &str, request: &ExecutionRequest) -> String {
    template
        .replace("{workflow_id}", &request.workflow_id)
        .replace("{step_id}", &request.step_id)
        .replace("{agent_type}", &request.agent_type)
        .replace("{subject}", &request.subject)
        .replace("{prompt}", &request.prompt)
}

/// Handle for an execution known to be gone (used when reconstructing
/// launch state after a restart). Always dead, never terminable.
pub struct NullHandle {
    id: String,
}

impl NullHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl AgentHandle for NullHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn is_alive(&self) -> bool {
        false
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_placeholders() {
        let request = ExecutionRequest {
            workflow_id: "wf-1".into(),
            step_id: "triage".into(),
            agent_type: "triage".into(),
            subject: "42".into(),
            prompt: "classify the issue".into(),
            working_dir: PathBuf::from("."),
            timeout_seconds: 600,
            metadata: BTreeMap::new(),
        };
        let rendered = render_template("--agent={agent_type} --issue={subject}", &request);
        assert_eq!(rendered, "--agent=triage --issue=42");
        assert_eq!(render_template("{prompt}", &request), "classify the issue");
    }

    #[tokio::test]
    async fn null_handle_is_dead() {
        let handle = NullHandle::new("gone");
        assert!(!handle.is_alive().await);
        assert!(handle.terminate().await.is_ok());
        assert_eq!(handle.id(), "gone");
        assert_eq!(handle.pid(), None);
    }
}
