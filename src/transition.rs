//! Step-transition helpers used by the state machine.
//!
//! These functions mutate a loaded `Workflow` in memory only; the engine
//! persists the record (and emits events) after they return. Routing is
//! fail-closed throughout: an unresolvable router or an explicit target
//! that is no longer pending is an error, never a silent skip.

use crate::condition::{self, Context};
use crate::engine::StepLaunch;
use crate::model::{AuditEvent, CompletionEvent, StepRecord, StepStatus, Workflow, WorkflowState};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Result of an activation walk.
pub(crate) enum Advance {
    Activated { anchor: usize, members: Vec<usize> },
    Finished,
    Failed(String),
}

pub(crate) fn complete_workflow(
    workflow: &mut Workflow,
    now: DateTime<Utc>,
    audits: &mut Vec<AuditEvent>,
) {
    workflow.state = WorkflowState::Completed;
    workflow.completed_at = Some(now);
    audits.push(AuditEvent::new(&workflow.id, "WORKFLOW_COMPLETED", json!({})));
    tracing::info!("Workflow {} completed", workflow.id);
}

pub(crate) fn fail_workflow_at(
    workflow: &mut Workflow,
    index: usize,
    reason: &str,
    now: DateTime<Utc>,
    audits: &mut Vec<AuditEvent>,
) {
    let step_id = {
        let step = &mut workflow.steps[index];
        step.status = StepStatus::Failed;
        step.completed_at = Some(now);
        step.error = Some(reason.to_string());
        step.next_attempt_at = None;
        step.step_id.clone()
    };
    workflow.state = WorkflowState::Failed;
    workflow.completed_at = Some(now);
    workflow.last_error = Some(reason.to_string());
    audits.push(AuditEvent::new(
        &workflow.id,
        "STEP_FAILED",
        json!({"step_id": step_id, "error": reason}),
    ));
    audits.push(AuditEvent::new(
        &workflow.id,
        "WORKFLOW_FAILED",
        json!({"error": reason}),
    ));
    tracing::warn!(
        "Workflow {} failed at step {}: {}",
        workflow.id,
        step_id,
        reason
    );
}

pub(crate) fn launch_for(workflow: &Workflow, index: usize) -> StepLaunch {
    let step = &workflow.steps[index];
    StepLaunch {
        workflow_id: workflow.id.clone(),
        step_id: step.step_id.clone(),
        agent_type: step.agent_type.clone(),
        subject: workflow.subject.clone(),
        prompt_template: step.prompt_template.clone(),
        timeout_seconds: step.timeout_seconds,
        not_before: step.next_attempt_at,
        metadata: workflow.metadata.clone(),
    }
}

pub(crate) fn step_started_audit(workflow: &Workflow, index: usize) -> AuditEvent {
    let step = &workflow.steps[index];
    AuditEvent::new(
        &workflow.id,
        "STEP_STARTED",
        json!({
            "step_id": step.step_id,
            "agent_type": step.agent_type,
            "attempt_count": step.attempt_count,
        }),
    )
}

/// Builds the expression-evaluation context: workflow metadata, flattened
/// outputs of finished steps (most recent winning, also exposed as
/// `result`), and the triggering event's summary fields.
pub(crate) fn build_context(workflow: &Workflow, event: Option<&CompletionEvent>) -> Context {
    let mut ctx = Context::new();
    for (key, value) in &workflow.metadata {
        ctx.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    ctx.insert(
        "subject".to_string(),
        serde_json::Value::String(workflow.subject.clone()),
    );

    for step in &workflow.steps {
        if !matches!(step.status, StepStatus::Done | StepStatus::Skipped) {
            continue;
        }
        if let Some(fields) = step.output.as_object() {
            for (key, value) in fields {
                ctx.insert(key.clone(), value.clone());
            }
        }
        if step.status == StepStatus::Done {
            ctx.insert("result".to_string(), step.output.clone());
        }
    }

    if let Some(event) = event {
        if let Some(fields) = event.raw_payload.as_object() {
            for (key, value) in fields {
                ctx.insert(key.clone(), value.clone());
            }
        }
        ctx.insert(
            "status".to_string(),
            serde_json::Value::String(event.status.as_str().to_string()),
        );
        ctx.insert(
            "summary".to_string(),
            serde_json::Value::String(event.summary.clone()),
        );
        if let Some(next_agent) = &event.next_agent {
            ctx.insert(
                "next_agent".to_string(),
                serde_json::Value::String(next_agent.clone()),
            );
        }
    }

    ctx
}

/// Resolves where to continue after `completed_idx` finished successfully.
///
/// Routes are evaluated fail-closed: an unresolvable router (no matching
/// branch and no default) or an explicit target that is no longer pending is
/// an error, never a silent skip. `Ok(None)` means the sequence ran out.
pub(crate) fn successor_start(
    workflow: &Workflow,
    completed_idx: usize,
    ctx: &Context,
) -> Result<Option<usize>, String> {
    let step = &workflow.steps[completed_idx];

    if !step.routes.is_empty() {
        let mut target: Option<&str> = None;
        for route in &step.routes {
            let Some(when) = &route.when else { continue };
            match condition::evaluate(when, ctx) {
                Ok(true) => {
                    target = Some(route.then.as_str());
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    return Err(format!(
                        "route condition on step '{}' failed to evaluate: {}",
                        step.step_id, e
                    ));
                }
            }
        }
        if target.is_none() {
            target = step
                .routes
                .iter()
                .find(|r| r.default)
                .map(|r| r.then.as_str());
        }
        let Some(target) = target else {
            return Err(format!(
                "no route matched on step '{}' and no default is declared",
                step.step_id
            ));
        };
        return explicit_target(workflow, step, target);
    }

    if let Some(next) = &step.next_step_id {
        return explicit_target(workflow, step, next);
    }

    Ok(Some(completed_idx + 1))
}

fn explicit_target(
    workflow: &Workflow,
    from: &StepRecord,
    target: &str,
) -> Result<Option<usize>, String> {
    let Some(index) = workflow.step_index(target) else {
        return Err(format!(
            "step '{}' routes to unknown step '{}'",
            from.step_id, target
        ));
    };
    if workflow.steps[index].status != StepStatus::Pending {
        return Err(format!(
            "step '{}' routes to step '{}' which is already {:?}",
            from.step_id, target, workflow.steps[index].status
        ));
    }
    Ok(Some(index))
}

/// Walks forward from `start`, skipping finished steps and steps whose
/// condition evaluates false, and activates the first runnable step together
/// with its parallel siblings.
pub(crate) fn activate_walk(
    workflow: &mut Workflow,
    start: usize,
    ctx: &Context,
    now: DateTime<Utc>,
    audits: &mut Vec<AuditEvent>,
) -> Advance {
    let mut idx = start;
    let mut hops = 0usize;
    let hop_limit = workflow.steps.len() * 2 + 2;

    loop {
        hops += 1;
        if hops > hop_limit {
            return Advance::Failed("routing loop detected while advancing".to_string());
        }
        if idx >= workflow.steps.len() {
            return Advance::Finished;
        }
        if workflow.steps[idx].status != StepStatus::Pending {
            idx += 1;
            continue;
        }

        if let Some(cond) = workflow.steps[idx].condition.clone() {
            match condition::evaluate(&cond, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    workflow.steps[idx].status = StepStatus::Skipped;
                    workflow.steps[idx].completed_at = Some(now);
                    audits.push(AuditEvent::new(
                        &workflow.id,
                        "STEP_SKIPPED",
                        json!({
                            "step_id": workflow.steps[idx].step_id,
                            "condition": cond,
                        }),
                    ));
                    if let Some(next) = workflow.steps[idx].next_step_id.clone() {
                        match workflow.step_index(&next) {
                            Some(n) => {
                                idx = n;
                                continue;
                            }
                            None => {
                                return Advance::Failed(format!(
                                    "skipped step '{}' routes to unknown step '{}'",
                                    workflow.steps[idx].step_id, next
                                ));
                            }
                        }
                    }
                    idx += 1;
                    continue;
                }
                Err(e) => {
                    return Advance::Failed(format!(
                        "condition on step '{}' failed to evaluate: {}",
                        workflow.steps[idx].step_id, e
                    ));
                }
            }
        }

        let members: Vec<usize> = workflow
            .parallel_group(idx)
            .into_iter()
            .filter(|&i| workflow.steps[i].status == StepStatus::Pending)
            .collect();
        for &member in &members {
            let step = &mut workflow.steps[member];
            step.status = StepStatus::Running;
            step.launched_at = Some(now);
            step.attempt_count += 1;
            step.next_attempt_at = None;
        }
        return Advance::Activated {
            anchor: idx,
            members,
        };
    }
}
