//! Core data model: workflows, steps, completion events, provider state.
//!
//! All records are serde-serializable; the durable store persists them as
//! plain JSON documents. The engine is the only writer of `Workflow` and
//! `StepRecord`; every other component submits events instead of mutating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Workflow execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    StepComplete,
    Completed,
    Stopped,
    Failed,
}

impl WorkflowState {
    /// Terminal states are final; no operation mutates a terminal workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::StepComplete => "step_complete",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Individual step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// Backoff strategy for step retries and provider cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Retry policy attached to a step (or supplied as the config default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffStrategy::default(),
            initial_delay_seconds: default_initial_delay(),
            max_delay_seconds: default_max_delay(),
        }
    }
}

/// A conditional routing entry: when `when` evaluates true, the workflow
/// continues at the step named by `then`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub when: Option<String>,
    pub then: String,
    /// Marks the fallback branch taken when no `when` clause matches.
    #[serde(default)]
    pub default: bool,
}

/// One step's execution slot within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub agent_type: String,
    pub status: StepStatus,
    /// Number of launches so far. Invariant: `attempt_count <= max_retries + 1`.
    pub attempt_count: u32,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_seconds: f64,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub next_step_id: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Sibling steps that launch together with this one. The workflow only
    /// advances past the group once every member reports complete.
    #[serde(default)]
    pub parallel_with: Vec<String>,
    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest relaunch time after a retry backoff.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepRecord {
    /// The retry policy effective for this step.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.backoff,
            initial_delay_seconds: self.initial_delay_seconds,
            max_delay_seconds: default_max_delay(),
        }
    }
}

/// Normalized agent outcome carried by a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionStatus {
    Complete,
    InProgress,
    Blocked,
}

impl CompletionStatus {
    /// Parses the status field of a raw completion payload.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "complete" => Some(Self::Complete),
            "in-progress" | "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
        }
    }
}

/// A normalized signal that an agent finished (or stalled on) a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub workflow_id: String,
    pub step_id: String,
    pub agent_type: String,
    pub status: CompletionStatus,
    pub summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    /// Agent-proposed successor. Advisory only; definition routing wins.
    #[serde(default)]
    pub next_agent: Option<String>,
    /// Applying the same dedup key twice is a no-op.
    pub dedup_key: String,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    pub observed_at: DateTime<Utc>,
}

impl CompletionEvent {
    /// The normal-form dedup key used when a source has nothing stronger.
    pub fn default_dedup_key(workflow_id: &str, step_id: &str, status: CompletionStatus) -> String {
        format!("{}:{}:{}", workflow_id, step_id, status.as_str())
    }

    /// Builds a synthetic blocked completion for a timeout or launch failure.
    ///
    /// Synthetic events are generated once per occurrence, so the dedup key
    /// carries the observation timestamp instead of the status.
    pub fn synthetic_blocked(
        workflow_id: &str,
        step_id: &str,
        agent_type: &str,
        reason: &str,
    ) -> Self {
        let observed_at = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            agent_type: agent_type.to_string(),
            status: CompletionStatus::Blocked,
            summary: reason.to_string(),
            key_findings: Vec::new(),
            next_agent: None,
            dedup_key: format!(
                "{}:{}:blocked:{}",
                workflow_id,
                step_id,
                observed_at.timestamp_millis()
            ),
            raw_payload: serde_json::Value::Null,
            observed_at,
        }
    }
}

/// One execution instance of a workflow definition against a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub definition_ref: String,
    /// External correlation key (e.g. an issue number) used by completion
    /// sources to address this workflow.
    pub subject: String,
    pub state: WorkflowState,
    pub current_step_index: usize,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Durable idempotency ledger of applied completion dedup keys.
    #[serde(default)]
    pub applied_events: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Workflow {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Index of the step with the given id.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Steps currently marked running.
    pub fn running_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
    }

    /// Indices of the parallel group anchored at `index`: the step itself plus
    /// every step that names it (or that it names) in `parallel_with`.
    pub fn parallel_group(&self, index: usize) -> Vec<usize> {
        let mut group = vec![index];
        let anchor_id = match self.steps.get(index) {
            Some(step) => step.step_id.clone(),
            None => return group,
        };
        let anchor_siblings = self.steps[index].parallel_with.clone();
        for (i, step) in self.steps.iter().enumerate() {
            if i == index {
                continue;
            }
            let linked = step.parallel_with.iter().any(|p| *p == anchor_id)
                || anchor_siblings.iter().any(|p| *p == step.step_id);
            if linked {
                group.push(i);
            }
        }
        group
    }
}

/// Single audit log entry. Every transition appends one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AuditEvent {
    pub fn new(workflow_id: &str, event_type: &str, data: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data,
        }
    }
}

/// Availability and fallback bookkeeping for one AI provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ProviderStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            cooldown_until: None,
            consecutive_failures: 0,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Stopped.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
        assert!(!WorkflowState::StepComplete.is_terminal());
    }

    #[test]
    fn completion_status_parse() {
        assert_eq!(
            CompletionStatus::parse("complete"),
            Some(CompletionStatus::Complete)
        );
        assert_eq!(
            CompletionStatus::parse(" In-Progress "),
            Some(CompletionStatus::InProgress)
        );
        assert_eq!(
            CompletionStatus::parse("in_progress"),
            Some(CompletionStatus::InProgress)
        );
        assert_eq!(
            CompletionStatus::parse("blocked"),
            Some(CompletionStatus::Blocked)
        );
        assert_eq!(CompletionStatus::parse("unknown"), None);
    }

    #[test]
    fn dedup_key_normal_form() {
        let key = CompletionEvent::default_dedup_key("wf-1", "triage", CompletionStatus::Complete);
        assert_eq!(key, "wf-1:triage:complete");
    }

    #[test]
    fn workflow_state_serde_round_trip() {
        let json = serde_json::to_string(&WorkflowState::StepComplete).unwrap();
        assert_eq!(json, "\"step_complete\"");
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WorkflowState::StepComplete);
    }

    #[test]
    fn parallel_group_is_symmetric() {
        let step = |id: &str, parallel: &[&str]| StepRecord {
            step_id: id.to_string(),
            agent_type: id.to_string(),
            status: StepStatus::Pending,
            attempt_count: 0,
            max_retries: 2,
            backoff: BackoffStrategy::Exponential,
            initial_delay_seconds: 1.0,
            timeout_seconds: 600,
            prompt_template: String::new(),
            condition: None,
            next_step_id: None,
            routes: Vec::new(),
            parallel_with: parallel.iter().map(|p| p.to_string()).collect(),
            launched_at: None,
            completed_at: None,
            next_attempt_at: None,
            output: serde_json::Value::Null,
            error: None,
        };
        let workflow = Workflow {
            id: "wf".into(),
            definition_ref: "def".into(),
            subject: "1".into(),
            state: WorkflowState::Running,
            current_step_index: 0,
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &[])],
            metadata: BTreeMap::new(),
            applied_events: BTreeSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            last_error: None,
        };

        let mut group = workflow.parallel_group(0);
        group.sort_unstable();
        assert_eq!(group, vec![0, 1]);

        // The declaration is one-sided but the grouping is symmetric.
        let mut group_b = workflow.parallel_group(1);
        group_b.sort_unstable();
        assert_eq!(group_b, vec![0, 1]);

        assert_eq!(workflow.parallel_group(2), vec![2]);
    }
}
