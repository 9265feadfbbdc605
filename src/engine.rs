//! Workflow state machine.
//!
//! This module is the ONLY place workflow state transitions happen. All
//! other components (detector, supervisor, facade) submit events or call
//! the public operations; none of them mutate `Workflow` records directly.
//!
//! Every operation holds the per-workflow lock for its full
//! load → mutate → persist span, so completion application is strictly
//! serialized within one workflow while different workflows proceed in
//! parallel. The durable store is the source of truth: operations re-read
//! the record instead of trusting any cached copy, and a persistence
//! failure aborts the mutation entirely.

use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::model::{
    AuditEvent, CompletionEvent, CompletionStatus, StepStatus, Workflow, WorkflowState,
};
use crate::storage::StateStore;
use crate::supervisor::delay_for_attempt;
use crate::transition::{
    activate_walk, build_context, complete_workflow, fail_workflow_at, launch_for,
    step_started_audit, successor_start, Advance,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Directive for the façade: launch this step's agent (no earlier than
/// `not_before` when a retry backoff applies).
#[derive(Debug, Clone)]
pub struct StepLaunch {
    pub workflow_id: String,
    pub step_id: String,
    pub agent_type: String,
    pub subject: String,
    pub prompt_template: String,
    pub timeout_seconds: u64,
    pub not_before: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

/// Result of applying a completion event.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// False when the event was a duplicate or stale; no mutation occurred.
    pub applied: bool,
    pub state: WorkflowState,
    /// Steps to launch as a consequence of this application.
    pub launches: Vec<StepLaunch>,
    /// Steps whose launch records are obsolete and should be untracked.
    pub finished_steps: Vec<String>,
}

impl ApplyOutcome {
    fn rejected(state: WorkflowState) -> Self {
        Self {
            applied: false,
            state,
            launches: Vec::new(),
            finished_steps: Vec::new(),
        }
    }
}

/// The workflow orchestration engine.
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    events: EventBus,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn StateStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_required(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.store.append_audit_event(&event).await {
            tracing::warn!("Audit append failed for {}: {}", event.workflow_id, e);
        }
    }

    async fn audit_all(&self, events: Vec<AuditEvent>) {
        for event in events {
            self.audit(event).await;
        }
    }

    fn emit_step_status(&self, workflow: &Workflow, index: usize) {
        if let Some(step) = workflow.steps.get(index) {
            self.events.emit(EngineEvent::StepStatusChanged {
                workflow_id: workflow.id.clone(),
                step_id: step.step_id.clone(),
                agent_type: step.agent_type.clone(),
                status: step.status,
                timestamp: Utc::now(),
            });
        }
    }

    /// Validates the definition and persists a new pending workflow.
    pub async fn create_workflow(
        &self,
        definition: &WorkflowDefinition,
        subject: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<Workflow, EngineError> {
        definition.validate()?;
        let workflow = definition.instantiate(subject, metadata);
        self.store.save_workflow(&workflow).await?;
        self.audit(AuditEvent::new(
            &workflow.id,
            "WORKFLOW_CREATED",
            json!({"definition": workflow.definition_ref, "subject": workflow.subject}),
        ))
        .await;
        tracing::info!(
            "Created workflow {} ({}) for subject {}",
            workflow.id,
            workflow.definition_ref,
            workflow.subject
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, EngineError> {
        self.store.load_workflow(workflow_id).await
    }

    pub async fn audit_log(&self, workflow_id: &str) -> Result<Vec<AuditEvent>, EngineError> {
        self.store.audit_log(workflow_id).await
    }

    /// Transitions `pending -> running` and activates the first step group.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<(Workflow, Vec<StepLaunch>), EngineError> {
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state != WorkflowState::Pending {
            return Err(EngineError::InvalidState {
                workflow_id: workflow_id.to_string(),
                state: workflow.state.to_string(),
                operation: "start".to_string(),
            });
        }

        let now = Utc::now();
        workflow.state = WorkflowState::Running;
        let ctx = build_context(&workflow, None);
        let mut audits = vec![AuditEvent::new(workflow_id, "WORKFLOW_STARTED", json!({}))];

        let mut launches = Vec::new();
        let mut activated = Vec::new();
        match activate_walk(&mut workflow, 0, &ctx, now, &mut audits) {
            Advance::Activated { anchor, members } => {
                workflow.current_step_index = anchor;
                for &member in &members {
                    launches.push(launch_for(&workflow, member));
                    audits.push(step_started_audit(&workflow, member));
                }
                activated = members;
            }
            Advance::Finished => {
                workflow.state = WorkflowState::Completed;
                workflow.completed_at = Some(now);
                audits.push(AuditEvent::new(
                    workflow_id,
                    "WORKFLOW_COMPLETED",
                    json!({"reason": "no runnable steps"}),
                ));
            }
            Advance::Failed(reason) => {
                workflow.state = WorkflowState::Failed;
                workflow.completed_at = Some(now);
                workflow.last_error = Some(reason.clone());
                audits.push(AuditEvent::new(
                    workflow_id,
                    "WORKFLOW_FAILED",
                    json!({"error": reason}),
                ));
            }
        }

        workflow.updated_at = now;
        self.store.save_workflow(&workflow).await?;
        self.audit_all(audits).await;
        for member in activated {
            self.emit_step_status(&workflow, member);
        }
        if workflow.is_terminal() {
            self.emit_workflow_done(&workflow);
        }

        tracing::info!("Started workflow {}", workflow_id);
        Ok((workflow, launches))
    }

    /// Applies a completion event. Idempotent: a dedup key already in the
    /// workflow's durable ledger is a no-op returning `applied = false`.
    pub async fn apply_completion(
        &self,
        event: &CompletionEvent,
    ) -> Result<ApplyOutcome, EngineError> {
        let lock = self.lock_for(&event.workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load_required(&event.workflow_id).await?;

        if workflow.is_terminal() {
            tracing::info!(
                "Ignoring late completion for {} workflow {} (step {})",
                workflow.state,
                workflow.id,
                event.step_id
            );
            return Ok(ApplyOutcome::rejected(workflow.state));
        }
        if workflow.applied_events.contains(&event.dedup_key) {
            tracing::debug!("Duplicate completion {} ignored", event.dedup_key);
            return Ok(ApplyOutcome::rejected(workflow.state));
        }

        let Some(index) = workflow.step_index(&event.step_id) else {
            tracing::warn!(
                "Completion for unknown step {} of workflow {}",
                event.step_id,
                workflow.id
            );
            return Ok(ApplyOutcome::rejected(workflow.state));
        };
        if workflow.steps[index].status != StepStatus::Running {
            tracing::debug!(
                "Stale completion for step {} of workflow {} (status {:?})",
                event.step_id,
                workflow.id,
                workflow.steps[index].status
            );
            return Ok(ApplyOutcome::rejected(workflow.state));
        }

        let now = Utc::now();
        workflow.applied_events.insert(event.dedup_key.clone());

        let mut audits = Vec::new();
        let mut launches = Vec::new();
        let mut finished_steps = Vec::new();
        let mut status_changed = Vec::new();

        match event.status {
            CompletionStatus::InProgress => {
                audits.push(AuditEvent::new(
                    &workflow.id,
                    "STEP_PROGRESS",
                    json!({"step_id": event.step_id, "summary": event.summary}),
                ));
            }
            CompletionStatus::Blocked => {
                finished_steps.push(event.step_id.clone());
                self.apply_blocked(
                    &mut workflow,
                    index,
                    event,
                    now,
                    &mut audits,
                    &mut launches,
                    &mut status_changed,
                );
            }
            CompletionStatus::Complete => {
                finished_steps.push(event.step_id.clone());
                self.apply_complete(
                    &mut workflow,
                    index,
                    event,
                    now,
                    &mut audits,
                    &mut launches,
                    &mut status_changed,
                );
            }
        }

        workflow.updated_at = now;
        self.store.save_workflow(&workflow).await?;
        self.audit_all(audits).await;
        for member in status_changed {
            self.emit_step_status(&workflow, member);
        }
        if workflow.is_terminal() {
            self.emit_workflow_done(&workflow);
        }

        Ok(ApplyOutcome {
            applied: true,
            state: workflow.state,
            launches,
            finished_steps,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_blocked(
        &self,
        workflow: &mut Workflow,
        index: usize,
        event: &CompletionEvent,
        now: DateTime<Utc>,
        audits: &mut Vec<AuditEvent>,
        launches: &mut Vec<StepLaunch>,
        status_changed: &mut Vec<usize>,
    ) {
        // Retry: the step goes straight back to running; the relaunch is
        // gated by the backoff deadline.
        let retry = {
            let step = &mut workflow.steps[index];
            step.error = Some(event.summary.clone());
            if step.attempt_count <= step.max_retries {
                step.attempt_count += 1;
                let retry_number = step.attempt_count.saturating_sub(1);
                let delay = delay_for_attempt(&step.retry_policy(), retry_number);
                step.next_attempt_at =
                    Some(now + ChronoDuration::milliseconds(delay.as_millis() as i64));
                step.launched_at = Some(now);
                step.completed_at = None;
                Some((step.attempt_count, delay))
            } else {
                None
            }
        };

        match retry {
            Some((attempt_count, delay)) => {
                audits.push(AuditEvent::new(
                    &workflow.id,
                    "STEP_RETRY",
                    json!({
                        "step_id": event.step_id,
                        "attempt_count": attempt_count,
                        "backoff_seconds": delay.as_secs_f64(),
                        "error": event.summary,
                    }),
                ));
                launches.push(launch_for(workflow, index));
                status_changed.push(index);
                tracing::info!(
                    "Retrying step {} of workflow {} (attempt {}, backoff {:?})",
                    event.step_id,
                    workflow.id,
                    attempt_count,
                    delay
                );
            }
            None => {
                fail_workflow_at(workflow, index, &event.summary, now, audits);
                status_changed.push(index);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_complete(
        &self,
        workflow: &mut Workflow,
        index: usize,
        event: &CompletionEvent,
        now: DateTime<Utc>,
        audits: &mut Vec<AuditEvent>,
        launches: &mut Vec<StepLaunch>,
        status_changed: &mut Vec<usize>,
    ) {
        {
            let step = &mut workflow.steps[index];
            step.status = StepStatus::Done;
            step.completed_at = Some(now);
            step.error = None;
            step.next_attempt_at = None;
            step.output = if event.raw_payload.is_object() {
                event.raw_payload.clone()
            } else {
                json!({"summary": event.summary})
            };
        }
        status_changed.push(index);
        audits.push(AuditEvent::new(
            &workflow.id,
            "STEP_COMPLETED",
            json!({"step_id": event.step_id, "summary": event.summary}),
        ));

        if workflow.state == WorkflowState::Paused {
            // Deferred advance: resume will pick the workflow up from here.
            return;
        }

        // A parallel group only advances once every sibling is done; partial
        // completion holds the workflow in step_complete.
        let group = workflow.parallel_group(index);
        let group_busy = group
            .iter()
            .any(|&i| workflow.steps[i].status == StepStatus::Running);
        if group_busy {
            workflow.state = WorkflowState::StepComplete;
            return;
        }

        let ctx = build_context(workflow, Some(event));
        match successor_start(workflow, index, &ctx) {
            Ok(Some(start)) => match activate_walk(workflow, start, &ctx, now, audits) {
                Advance::Activated { anchor, members } => {
                    workflow.current_step_index = anchor;
                    workflow.state = WorkflowState::Running;
                    for &member in &members {
                        launches.push(launch_for(workflow, member));
                        audits.push(step_started_audit(workflow, member));
                        status_changed.push(member);
                    }
                }
                Advance::Finished => complete_workflow(workflow, now, audits),
                Advance::Failed(reason) => {
                    workflow.last_error = Some(reason.clone());
                    workflow.state = WorkflowState::Failed;
                    workflow.completed_at = Some(now);
                    audits.push(AuditEvent::new(
                        &workflow.id,
                        "WORKFLOW_FAILED",
                        json!({"error": reason}),
                    ));
                }
            },
            Ok(None) => complete_workflow(workflow, now, audits),
            Err(reason) => {
                workflow.last_error = Some(reason.clone());
                workflow.state = WorkflowState::Failed;
                workflow.completed_at = Some(now);
                audits.push(AuditEvent::new(
                    &workflow.id,
                    "WORKFLOW_FAILED",
                    json!({"error": reason}),
                ));
            }
        }
    }

    /// Forces a step (and with it the workflow) into `failed`, bypassing the
    /// retry policy. Used for `timeout_action = fail_step` and
    /// `stale_running_step_action = fail_workflow`.
    pub async fn fail_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        reason: &str,
    ) -> Result<ApplyOutcome, EngineError> {
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.is_terminal() {
            return Ok(ApplyOutcome::rejected(workflow.state));
        }
        let Some(index) = workflow.step_index(step_id) else {
            return Ok(ApplyOutcome::rejected(workflow.state));
        };

        let now = Utc::now();
        let mut audits = Vec::new();
        fail_workflow_at(&mut workflow, index, reason, now, &mut audits);
        workflow.updated_at = now;
        self.store.save_workflow(&workflow).await?;
        self.audit_all(audits).await;
        self.emit_step_status(&workflow, index);
        self.emit_workflow_done(&workflow);

        Ok(ApplyOutcome {
            applied: true,
            state: workflow.state,
            launches: Vec::new(),
            finished_steps: vec![step_id.to_string()],
        })
    }

    /// Legal only from `running`/`step_complete`.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load_required(workflow_id).await?;
        if !matches!(
            workflow.state,
            WorkflowState::Running | WorkflowState::StepComplete
        ) {
            return Err(EngineError::InvalidState {
                workflow_id: workflow_id.to_string(),
                state: workflow.state.to_string(),
                operation: "pause".to_string(),
            });
        }
        workflow.state = WorkflowState::Paused;
        workflow.updated_at = Utc::now();
        self.store.save_workflow(&workflow).await?;
        self.audit(AuditEvent::new(workflow_id, "WORKFLOW_PAUSED", json!({})))
            .await;
        self.events.emit(EngineEvent::WorkflowPaused {
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!("Paused workflow {}", workflow_id);
        Ok(workflow)
    }

    /// Legal only from `paused`. Re-issues launch directives for deferred
    /// retries and performs any advance deferred while paused.
    pub async fn resume_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<(Workflow, Vec<StepLaunch>), EngineError> {
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load_required(workflow_id).await?;
        if workflow.state != WorkflowState::Paused {
            return Err(EngineError::InvalidState {
                workflow_id: workflow_id.to_string(),
                state: workflow.state.to_string(),
                operation: "resume".to_string(),
            });
        }

        let now = Utc::now();
        workflow.state = WorkflowState::Running;
        let mut audits = vec![AuditEvent::new(workflow_id, "WORKFLOW_RESUMED", json!({}))];
        let mut launches = Vec::new();
        let mut activated = Vec::new();

        if workflow.running_steps().count() > 0 {
            // Mid-flight steps continue; deferred retries are relaunched.
            for (i, step) in workflow.steps.iter().enumerate() {
                if step.status == StepStatus::Running && step.next_attempt_at.is_some() {
                    launches.push(launch_for(&workflow, i));
                }
            }
        } else {
            // A completion arrived while paused; perform the deferred advance.
            let anchor = workflow.current_step_index;
            let anchor_done = workflow
                .steps
                .get(anchor)
                .map(|s| matches!(s.status, StepStatus::Done | StepStatus::Skipped))
                .unwrap_or(false);
            if anchor_done {
                let ctx = build_context(&workflow, None);
                match successor_start(&workflow, anchor, &ctx) {
                    Ok(Some(start)) => {
                        match activate_walk(&mut workflow, start, &ctx, now, &mut audits) {
                            Advance::Activated { anchor, members } => {
                                workflow.current_step_index = anchor;
                                for &member in &members {
                                    launches.push(launch_for(&workflow, member));
                                    audits.push(step_started_audit(&workflow, member));
                                }
                                activated = members;
                            }
                            Advance::Finished => complete_workflow(&mut workflow, now, &mut audits),
                            Advance::Failed(reason) => {
                                workflow.last_error = Some(reason.clone());
                                workflow.state = WorkflowState::Failed;
                                workflow.completed_at = Some(now);
                                audits.push(AuditEvent::new(
                                    workflow_id,
                                    "WORKFLOW_FAILED",
                                    json!({"error": reason}),
                                ));
                            }
                        }
                    }
                    Ok(None) => complete_workflow(&mut workflow, now, &mut audits),
                    Err(reason) => {
                        workflow.last_error = Some(reason.clone());
                        workflow.state = WorkflowState::Failed;
                        workflow.completed_at = Some(now);
                        audits.push(AuditEvent::new(
                            workflow_id,
                            "WORKFLOW_FAILED",
                            json!({"error": reason}),
                        ));
                    }
                }
            }
        }

        workflow.updated_at = now;
        self.store.save_workflow(&workflow).await?;
        self.audit_all(audits).await;
        self.events.emit(EngineEvent::WorkflowResumed {
            workflow_id: workflow_id.to_string(),
            timestamp: now,
        });
        for member in activated {
            self.emit_step_status(&workflow, member);
        }
        if workflow.is_terminal() {
            self.emit_workflow_done(&workflow);
        }
        tracing::info!("Resumed workflow {}", workflow_id);
        Ok((workflow, launches))
    }

    /// Legal only from `running`/`step_complete`. Returns the running step
    /// ids so the caller can terminate their live launches.
    pub async fn stop_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<(Workflow, Vec<String>), EngineError> {
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        let mut workflow = self.load_required(workflow_id).await?;
        if !matches!(
            workflow.state,
            WorkflowState::Running | WorkflowState::StepComplete
        ) {
            return Err(EngineError::InvalidState {
                workflow_id: workflow_id.to_string(),
                state: workflow.state.to_string(),
                operation: "stop".to_string(),
            });
        }

        let now = Utc::now();
        let running: Vec<String> = workflow
            .running_steps()
            .map(|s| s.step_id.clone())
            .collect();
        workflow.state = WorkflowState::Stopped;
        workflow.completed_at = Some(now);
        workflow.updated_at = now;
        self.store.save_workflow(&workflow).await?;
        self.audit(AuditEvent::new(workflow_id, "WORKFLOW_STOPPED", json!({})))
            .await;
        self.events.emit(EngineEvent::WorkflowStopped {
            workflow_id: workflow_id.to_string(),
            timestamp: now,
        });
        self.emit_workflow_done(&workflow);
        tracing::info!("Stopped workflow {}", workflow_id);
        Ok((workflow, running))
    }

    fn emit_workflow_done(&self, workflow: &Workflow) {
        self.events.emit(EngineEvent::WorkflowCompleted {
            workflow_id: workflow.id.clone(),
            state: workflow.state,
            summary: workflow.last_error.clone().unwrap_or_default(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
