//! Filesystem JSON state store.
//!
//! One pretty-printed JSON document per workflow under
//! `<state_dir>/workflows/<id>.json`, written to a temp file and atomically
//! renamed into place so a crash never leaves a half-written record. Audit
//! events go to a shared JSONL log. A daemon opens the store exclusively via
//! an `fs2` lock file so two processes cannot drive the same state dir.

use crate::error::EngineError;
use crate::model::{AuditEvent, Workflow, WorkflowState};
use crate::storage::StateStore;
use crate::structured_logger::{read_events, StructuredLogger};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Filesystem-backed [`StateStore`].
pub struct FileStore {
    workflows_dir: PathBuf,
    audit_path: PathBuf,
    audit: StructuredLogger,
    /// Held exclusive lock for daemon mode; dropped on close.
    _lock: Option<File>,
}

impl FileStore {
    /// Opens the store without locking (control commands, inspection).
    pub fn open(state_dir: &Path) -> Result<Self, EngineError> {
        Self::open_inner(state_dir, false)
    }

    /// Opens the store and takes an exclusive lock on the state directory.
    ///
    /// Fails if another process already holds the lock.
    pub fn open_exclusive(state_dir: &Path) -> Result<Self, EngineError> {
        Self::open_inner(state_dir, true)
    }

    fn open_inner(state_dir: &Path, exclusive: bool) -> Result<Self, EngineError> {
        let workflows_dir = state_dir.join("workflows");
        fs::create_dir_all(&workflows_dir).map_err(EngineError::persistence)?;

        let lock = if exclusive {
            let lock_path = state_dir.join(".lock");
            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(EngineError::persistence)?;
            lock_file.try_lock_exclusive().map_err(|_| EngineError::Persistence {
                message: format!(
                    "state dir {} is locked by another conductor process",
                    state_dir.display()
                ),
            })?;
            Some(lock_file)
        } else {
            None
        };

        let audit_path = state_dir.join("audit").join("events.jsonl");
        let audit = StructuredLogger::open(&audit_path).map_err(EngineError::persistence)?;

        Ok(Self {
            workflows_dir,
            audit_path,
            audit,
            _lock: lock,
        })
    }

    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.workflows_dir.join(format!("{}.json", workflow_id))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let path = self.workflow_path(&workflow.id);
        let temp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(workflow).map_err(EngineError::persistence)?;
        fs::write(&temp_path, &content).map_err(EngineError::persistence)?;
        fs::rename(&temp_path, &path).map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, EngineError> {
        let path = self.workflow_path(workflow_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::persistence(e)),
        };
        let workflow = serde_json::from_str(&content).map_err(EngineError::persistence)?;
        Ok(Some(workflow))
    }

    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
    ) -> Result<Vec<Workflow>, EngineError> {
        let mut workflows = Vec::new();
        let entries = fs::read_dir(&self.workflows_dir).map_err(EngineError::persistence)?;
        for entry in entries {
            let entry = entry.map_err(EngineError::persistence)?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => continue,
            };
            match serde_json::from_str::<Workflow>(&content) {
                Ok(workflow) => {
                    if state.map_or(true, |wanted| workflow.state == wanted) {
                        workflows.push(workflow);
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping unparseable workflow file {}: {}", path.display(), e);
                }
            }
        }
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), EngineError> {
        self.audit.append(event);
        Ok(())
    }

    async fn audit_log(&self, workflow_id: &str) -> Result<Vec<AuditEvent>, EngineError> {
        read_events(&self.audit_path, workflow_id).map_err(EngineError::persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn sample_workflow() -> Workflow {
        let yaml = "\
name: issue-flow
steps:
  - id: triage
    agent_type: triage
    next_step_id: design
  - id: design
    agent_type: design
";
        WorkflowDefinition::from_yaml_str(yaml)
            .unwrap()
            .instantiate("42", BTreeMap::new())
    }

    #[tokio::test]
    async fn round_trip_preserves_structure() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut workflow = sample_workflow();
        workflow.state = WorkflowState::Running;
        workflow.current_step_index = 1;
        workflow.applied_events.insert("wf:triage:complete".into());
        store.save_workflow(&workflow).await.unwrap();

        let loaded = store.load_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, workflow.id);
        assert_eq!(loaded.state, WorkflowState::Running);
        assert_eq!(loaded.current_step_index, 1);
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].step_id, "triage");
        assert!(loaded.applied_events.contains("wf:triage:complete"));
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load_workflow("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let pending = sample_workflow();
        let mut running = sample_workflow();
        running.state = WorkflowState::Running;
        store.save_workflow(&pending).await.unwrap();
        store.save_workflow(&running).await.unwrap();

        let all = store.list_workflows(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_running = store
            .list_workflows(Some(WorkflowState::Running))
            .await
            .unwrap();
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running.id);
    }

    #[tokio::test]
    async fn audit_events_append_in_order() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store
            .append_audit_event(&AuditEvent::new("wf-1", "WORKFLOW_CREATED", json!({})))
            .await
            .unwrap();
        store
            .append_audit_event(&AuditEvent::new("wf-1", "WORKFLOW_STARTED", json!({})))
            .await
            .unwrap();

        let log = store.audit_log("wf-1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_type, "WORKFLOW_CREATED");
        assert_eq!(log[1].event_type, "WORKFLOW_STARTED");
    }

    #[test]
    fn exclusive_open_rejects_second_daemon() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open_exclusive(dir.path()).unwrap();
        let second = FileStore::open_exclusive(dir.path());
        assert!(second.is_err());
    }
}
