//! Orchestration façade: the coordinating loop.
//!
//! One `tick` per polling interval: start pending workflows, reconcile
//! running steps that lost their launch, scan completion sources, apply
//! events, reap timeouts back through the state machine as synthetic
//! completions, and launch whatever the engine asked for. The loop never
//! blocks on an agent; completions are observed on a later cycle.

use crate::completion::{CompletionDetector, SubjectIndex};
use crate::config::{OrchestrationSettings, StaleRunningStepAction};
use crate::engine::{ApplyOutcome, StepLaunch, WorkflowEngine};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::model::{AuditEvent, CompletionEvent, StepStatus, Workflow, WorkflowState};
use crate::provider::orchestrator::ProviderOrchestrator;
use crate::provider::{ExecutionRequest, NullHandle};
use crate::storage::StateStore;
use crate::supervisor::{Supervisor, TimeoutResult};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The coordinating loop tying detector, engine, supervisor, and provider
/// orchestrator together.
pub struct Conductor {
    engine: Arc<WorkflowEngine>,
    store: Arc<dyn StateStore>,
    supervisor: Supervisor,
    orchestrator: ProviderOrchestrator,
    detector: CompletionDetector,
    settings: OrchestrationSettings,
    working_dir: PathBuf,
    pending: Vec<StepLaunch>,
}

impl Conductor {
    pub fn new(
        store: Arc<dyn StateStore>,
        orchestrator: ProviderOrchestrator,
        detector: CompletionDetector,
        settings: OrchestrationSettings,
        working_dir: PathBuf,
        events: EventBus,
    ) -> Self {
        let supervisor = Supervisor::new(
            settings.liveness_miss_threshold,
            settings.timeout_action,
            events.clone(),
        );
        let engine = Arc::new(WorkflowEngine::new(store.clone(), events));
        Self {
            engine,
            store,
            supervisor,
            orchestrator,
            detector,
            settings,
            working_dir,
            pending: Vec::new(),
        }
    }

    /// The state machine, for control operations and tests.
    pub fn engine(&self) -> Arc<WorkflowEngine> {
        Arc::clone(&self.engine)
    }

    /// Startup recovery: every non-terminal workflow with a running step and
    /// no live launch is reconstructed as already timed out, so the first
    /// cycle reconciles it through the ordinary timeout path.
    pub async fn recover(&mut self) -> Result<(), EngineError> {
        let workflows = self.non_terminal_workflows().await?;
        self.reconcile_unattended(&workflows).await;
        tracing::info!(
            "Recovery complete: {} workflow(s) under supervision",
            workflows.len()
        );
        Ok(())
    }

    /// One polling cycle.
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        // Start workflows created since the last cycle.
        let pending_workflows = self
            .store
            .list_workflows(Some(WorkflowState::Pending))
            .await?;
        for workflow in pending_workflows {
            match self.engine.start_workflow(&workflow.id).await {
                Ok((_, launches)) => self.pending.extend(launches),
                Err(e) => tracing::warn!("Failed to start workflow {}: {}", workflow.id, e),
            }
        }

        let workflows = self.non_terminal_workflows().await?;

        // Workflows stopped or finished out-of-band still have live
        // launches; tear them down before anything else.
        let live_ids: std::collections::HashSet<&str> =
            workflows.iter().map(|w| w.id.as_str()).collect();
        for workflow_id in self.supervisor.tracked_workflow_ids() {
            if !live_ids.contains(workflow_id.as_str()) {
                tracing::info!(
                    "Terminating launches for terminal workflow {}",
                    workflow_id
                );
                self.supervisor.terminate_workflow(&workflow_id).await;
                self.pending.retain(|l| l.workflow_id != workflow_id);
            }
        }

        self.reconcile_unattended(&workflows).await;

        // Observe completions and apply them through the state machine.
        // Application is concurrent across workflows; the engine's
        // per-workflow locks serialize events for the same workflow.
        let index = SubjectIndex::from_workflows(workflows.iter());
        let events = self.detector.scan(&index).await;
        for event in &events {
            self.supervisor
                .record_heartbeat(&event.workflow_id, &event.step_id);
        }
        let results = futures::future::join_all(
            events.iter().map(|event| self.engine.apply_completion(event)),
        )
        .await;
        for (event, result) in events.iter().zip(results) {
            match result {
                Ok(outcome) => self.handle_outcome(&event.workflow_id, outcome).await,
                Err(e) => tracing::warn!(
                    "Failed to apply completion {} for workflow {}: {}",
                    event.dedup_key,
                    event.workflow_id,
                    e
                ),
            }
        }

        // Reap timeouts and feed them back as synthetic completions.
        let timeouts = self.supervisor.check_timeouts().await;
        for timeout in timeouts {
            self.process_timeout(timeout).await;
        }

        // Launch whatever became due.
        self.launch_due().await;

        Ok(())
    }

    /// Runs `tick` on the configured cadence until the shutdown signal.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        self.recover().await?;
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.interval_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!("Orchestration cycle failed: {}", e);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown requested, stopping orchestration loop");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn non_terminal_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        let all = self.store.list_workflows(None).await?;
        Ok(all.into_iter().filter(|w| !w.is_terminal()).collect())
    }

    /// Tracks a dead placeholder for running steps nobody is watching, or
    /// fails them outright per the configured recovery action. Paused
    /// workflows are left alone.
    async fn reconcile_unattended(&mut self, workflows: &[Workflow]) {
        for workflow in workflows {
            if workflow.state == WorkflowState::Paused {
                continue;
            }
            let running: Vec<(String, String)> = workflow
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Running)
                .map(|s| (s.step_id.clone(), s.agent_type.clone()))
                .collect();
            for (step_id, agent_type) in running {
                if self.supervisor.tracks(&workflow.id, &step_id) {
                    continue;
                }
                if self
                    .pending
                    .iter()
                    .any(|l| l.workflow_id == workflow.id && l.step_id == step_id)
                {
                    continue;
                }

                match self.settings.stale_running_step_action {
                    StaleRunningStepAction::Reconcile => {
                        tracing::warn!(
                            "Step {} of workflow {} is running with no live launch; \
                             treating as missed heartbeat",
                            step_id,
                            workflow.id
                        );
                        self.audit(AuditEvent::new(
                            &workflow.id,
                            "STALE_RUNNING_RECONCILED",
                            json!({"step_id": step_id, "agent_type": agent_type}),
                        ))
                        .await;
                        self.supervisor.track_launch(
                            &workflow.id,
                            &step_id,
                            &agent_type,
                            Box::new(NullHandle::new(format!("stale:{}:{}", workflow.id, step_id))),
                            0,
                        );
                    }
                    StaleRunningStepAction::FailWorkflow => {
                        match self
                            .engine
                            .fail_step(
                                &workflow.id,
                                &step_id,
                                "running step had no live process at recovery",
                            )
                            .await
                        {
                            Ok(outcome) => self.handle_outcome(&workflow.id, outcome).await,
                            Err(e) => {
                                tracing::warn!("Failed to fail stale step {}: {}", step_id, e);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn process_timeout(&mut self, timeout: TimeoutResult) {
        self.audit(AuditEvent::new(
            &timeout.workflow_id,
            "STEP_TIMEOUT",
            json!({
                "step_id": timeout.step_id,
                "agent_type": timeout.agent_type,
                "kind": format!("{:?}", timeout.kind),
                "elapsed_seconds": timeout.elapsed.as_secs(),
            }),
        ))
        .await;

        let result = if timeout.retry_allowed {
            let event = CompletionEvent::synthetic_blocked(
                &timeout.workflow_id,
                &timeout.step_id,
                &timeout.agent_type,
                &format!(
                    "agent timed out after {}s ({:?})",
                    timeout.elapsed.as_secs(),
                    timeout.kind
                ),
            );
            self.engine.apply_completion(&event).await
        } else {
            self.engine
                .fail_step(
                    &timeout.workflow_id,
                    &timeout.step_id,
                    "agent timed out; timeout_action=fail_step",
                )
                .await
        };

        match result {
            Ok(outcome) => self.handle_outcome(&timeout.workflow_id, outcome).await,
            Err(e) => tracing::warn!(
                "Failed to process timeout for workflow {} step {}: {}",
                timeout.workflow_id,
                timeout.step_id,
                e
            ),
        }
    }

    async fn handle_outcome(&mut self, workflow_id: &str, outcome: ApplyOutcome) {
        for step_id in &outcome.finished_steps {
            self.supervisor.untrack(workflow_id, step_id);
        }
        if outcome.state.is_terminal() {
            self.supervisor.terminate_workflow(workflow_id).await;
            self.pending.retain(|l| l.workflow_id != workflow_id);
            return;
        }
        if self.settings.chaining_enabled {
            self.pending.extend(outcome.launches);
        } else if !outcome.launches.is_empty() {
            tracing::info!(
                "Chaining disabled; not launching {} step(s) for workflow {}",
                outcome.launches.len(),
                workflow_id
            );
        }
    }

    /// Launches every queued directive whose backoff deadline has passed.
    async fn launch_due(&mut self) {
        let now = Utc::now();
        let due: Vec<StepLaunch> = {
            let (due, later): (Vec<StepLaunch>, Vec<StepLaunch>) = self
                .pending
                .drain(..)
                .partition(|l| l.not_before.map_or(true, |t| t <= now));
            self.pending = later;
            due
        };

        for launch in due {
            // The workflow may have been stopped or failed since the
            // directive was queued.
            let still_wanted = match self.engine.get_workflow(&launch.workflow_id).await {
                Ok(Some(workflow)) => {
                    !workflow.is_terminal()
                        && workflow.state != WorkflowState::Paused
                        && workflow
                            .step(&launch.step_id)
                            .map(|s| s.status == StepStatus::Running)
                            .unwrap_or(false)
                }
                _ => false,
            };
            if !still_wanted {
                tracing::debug!(
                    "Dropping launch for workflow {} step {}: no longer wanted",
                    launch.workflow_id,
                    launch.step_id
                );
                continue;
            }

            let request = ExecutionRequest {
                workflow_id: launch.workflow_id.clone(),
                step_id: launch.step_id.clone(),
                agent_type: launch.agent_type.clone(),
                subject: launch.subject.clone(),
                prompt: render_prompt(&launch),
                working_dir: self.working_dir.clone(),
                timeout_seconds: launch.timeout_seconds,
                metadata: launch.metadata.clone(),
            };

            match self.orchestrator.execute(&request).await {
                Ok(result) => {
                    tracing::info!(
                        "Launched step {} of workflow {} via {} (attempt {})",
                        launch.step_id,
                        launch.workflow_id,
                        result.provider_used,
                        result.attempts
                    );
                    self.supervisor.track_launch(
                        &launch.workflow_id,
                        &launch.step_id,
                        &launch.agent_type,
                        result.handle,
                        launch.timeout_seconds,
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "Launch failed for workflow {} step {}: {}",
                        launch.workflow_id,
                        launch.step_id,
                        e
                    );
                    self.audit(AuditEvent::new(
                        &launch.workflow_id,
                        "LAUNCH_FAILED",
                        json!({"step_id": launch.step_id, "error": e.to_string()}),
                    ))
                    .await;
                    // Exhausted providers travel the same failure pathway as
                    // an agent-reported blocked completion.
                    let event = CompletionEvent::synthetic_blocked(
                        &launch.workflow_id,
                        &launch.step_id,
                        &launch.agent_type,
                        &e.to_string(),
                    );
                    match self.engine.apply_completion(&event).await {
                        Ok(outcome) => self.handle_outcome(&launch.workflow_id, outcome).await,
                        Err(apply_err) => tracing::warn!(
                            "Failed to record launch failure for workflow {}: {}",
                            launch.workflow_id,
                            apply_err
                        ),
                    }
                }
            }
        }
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.store.append_audit_event(&event).await {
            tracing::warn!("Audit append failed for {}: {}", event.workflow_id, e);
        }
    }
}

/// Renders a step's prompt template: built-in placeholders first, then the
/// workflow metadata as `{key}` substitutions. Unknown placeholders are left
/// intact.
fn render_prompt(launch: &StepLaunch) -> String {
    let mut prompt = launch
        .prompt_template
        .replace("{subject}", &launch.subject)
        .replace("{agent_type}", &launch.agent_type)
        .replace("{workflow_id}", &launch.workflow_id)
        .replace("{step_id}", &launch.step_id);
    for (key, value) in &launch.metadata {
        prompt = prompt.replace(&format!("{{{}}}", key), value);
    }
    prompt
}

#[cfg(test)]
#[path = "tests/facade_tests.rs"]
mod tests;
