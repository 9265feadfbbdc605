//! Durable state store abstraction.
//!
//! The engine treats the store as the single source of truth: every
//! operation re-reads the workflow record under the per-workflow lock, and
//! every mutation is persisted before the operation returns. Concrete
//! drivers implement [`StateStore`]; the in-tree driver is the filesystem
//! JSON store in [`file`].

pub mod file;

use crate::error::EngineError;
use crate::model::{AuditEvent, Workflow, WorkflowState};
use async_trait::async_trait;

/// Abstract durable store for workflow records and audit trails.
///
/// Terminal workflows are archived, never deleted.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a workflow record, replacing any previous version.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), EngineError>;

    /// Loads a workflow by id.
    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, EngineError>;

    /// Lists workflows, optionally filtered by state.
    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
    ) -> Result<Vec<Workflow>, EngineError>;

    /// Appends an audit event.
    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), EngineError>;

    /// Returns the audit trail for a workflow in append order.
    async fn audit_log(&self, workflow_id: &str) -> Result<Vec<AuditEvent>, EngineError>;
}
