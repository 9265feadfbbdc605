//! Workflow definitions and their instantiation into runnable workflows.
//!
//! Definitions arrive pre-validated at the schema level (YAML parsing happens
//! at the boundary); this module enforces the structural invariants the
//! engine depends on: non-empty step list, unique step ids, resolvable
//! routing targets, and parseable condition expressions.

use crate::condition;
use crate::error::EngineError;
use crate::model::{RetryPolicy, Route, StepRecord, StepStatus, Workflow, WorkflowState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub agent_type: String,
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub next_step_id: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub parallel_with: Vec<String>,
}

/// A declarative step sequence, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDefinition>,
    /// Fallback timeout applied to steps without their own.
    #[serde(default = "default_step_timeout")]
    pub default_timeout_seconds: u64,
    /// Fallback retry policy applied to steps without their own.
    #[serde(default)]
    pub retry_defaults: RetryPolicy,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_step_timeout() -> u64 {
    3600
}

impl WorkflowDefinition {
    /// Parses a definition from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, EngineError> {
        let definition: Self = serde_yaml::from_str(text).map_err(|e| EngineError::Definition {
            message: format!("failed to parse definition YAML: {}", e),
        })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks structural invariants; returns `Definition` errors for anything
    /// the engine could not execute.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::Definition {
                message: "definition must include at least one step".to_string(),
            });
        }

        let mut ids = BTreeSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::Definition {
                    message: "step id must be non-empty".to_string(),
                });
            }
            if step.agent_type.trim().is_empty() {
                return Err(EngineError::Definition {
                    message: format!("step '{}' is missing agent_type", step.id),
                });
            }
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::Definition {
                    message: format!("duplicate step id '{}'", step.id),
                });
            }
        }

        for step in &self.steps {
            if let Some(target) = &step.next_step_id {
                if !ids.contains(target.as_str()) {
                    return Err(EngineError::Definition {
                        message: format!(
                            "step '{}' routes to unknown step '{}'",
                            step.id, target
                        ),
                    });
                }
            }
            for route in &step.routes {
                if !ids.contains(route.then.as_str()) {
                    return Err(EngineError::Definition {
                        message: format!(
                            "route on step '{}' targets unknown step '{}'",
                            step.id, route.then
                        ),
                    });
                }
                if let Some(when) = &route.when {
                    condition::parse(when).map_err(|e| EngineError::Definition {
                        message: format!("route on step '{}': {}", step.id, e),
                    })?;
                } else if !route.default {
                    return Err(EngineError::Definition {
                        message: format!(
                            "route on step '{}' has neither 'when' nor 'default'",
                            step.id
                        ),
                    });
                }
            }
            if let Some(cond) = &step.condition {
                condition::parse(cond).map_err(|e| EngineError::Definition {
                    message: format!("condition on step '{}': {}", step.id, e),
                })?;
            }
            for sibling in &step.parallel_with {
                if !ids.contains(sibling.as_str()) {
                    return Err(EngineError::Definition {
                        message: format!(
                            "step '{}' declares unknown parallel sibling '{}'",
                            step.id, sibling
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    /// Builds a pending [`Workflow`] for the given subject.
    pub fn instantiate(&self, subject: &str, metadata: BTreeMap<String, String>) -> Workflow {
        let now = Utc::now();
        let steps = self
            .steps
            .iter()
            .map(|step| {
                let retry = step.retry.clone().unwrap_or_else(|| self.retry_defaults.clone());
                StepRecord {
                    step_id: step.id.clone(),
                    agent_type: step.agent_type.clone(),
                    status: StepStatus::Pending,
                    attempt_count: 0,
                    max_retries: retry.max_retries,
                    backoff: retry.backoff,
                    initial_delay_seconds: retry.initial_delay_seconds,
                    timeout_seconds: step.timeout_seconds.unwrap_or(self.default_timeout_seconds),
                    prompt_template: step.prompt_template.clone(),
                    condition: step.condition.clone(),
                    next_step_id: step.next_step_id.clone(),
                    routes: step.routes.clone(),
                    parallel_with: step.parallel_with.clone(),
                    launched_at: None,
                    completed_at: None,
                    next_attempt_at: None,
                    output: serde_json::Value::Null,
                    error: None,
                }
            })
            .collect();

        Workflow {
            id: Uuid::new_v4().to_string(),
            definition_ref: self.name.clone(),
            subject: subject.to_string(),
            state: WorkflowState::Pending,
            current_step_index: 0,
            steps,
            metadata,
            applied_events: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_yaml() -> &'static str {
        "\
name: issue-flow
steps:
  - id: triage
    agent_type: triage
    next_step_id: design
  - id: design
    agent_type: design
"
    }

    #[test]
    fn parses_and_instantiates() {
        let definition = WorkflowDefinition::from_yaml_str(two_step_yaml()).unwrap();
        assert_eq!(definition.steps.len(), 2);

        let workflow = definition.instantiate("42", BTreeMap::new());
        assert_eq!(workflow.state, WorkflowState::Pending);
        assert_eq!(workflow.subject, "42");
        assert_eq!(workflow.steps[0].timeout_seconds, 3600);
        assert_eq!(workflow.steps[0].max_retries, 2);
        assert_eq!(workflow.steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn rejects_empty_steps() {
        let err = WorkflowDefinition::from_yaml_str("name: empty\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn rejects_unknown_routing_target() {
        let yaml = "\
name: broken
steps:
  - id: triage
    agent_type: triage
    next_step_id: nowhere
";
        let err = WorkflowDefinition::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown step 'nowhere'"));
    }

    #[test]
    fn rejects_unknown_route_then_target() {
        let yaml = "\
name: broken
steps:
  - id: triage
    agent_type: triage
    routes:
      - when: \"severity == 'high'\"
        then: missing
";
        let err = WorkflowDefinition::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn rejects_malformed_condition() {
        let yaml = "\
name: broken
steps:
  - id: triage
    agent_type: triage
    condition: \"severity = 'high'\"
";
        let err = WorkflowDefinition::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("condition on step 'triage'"));
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let yaml = "\
name: broken
steps:
  - id: triage
    agent_type: triage
  - id: triage
    agent_type: other
";
        let err = WorkflowDefinition::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn step_retry_overrides_defaults() {
        let yaml = "\
name: flow
retry_defaults:
  max_retries: 1
steps:
  - id: triage
    agent_type: triage
    retry:
      max_retries: 5
    timeout_seconds: 60
  - id: design
    agent_type: design
";
        let definition = WorkflowDefinition::from_yaml_str(yaml).unwrap();
        let workflow = definition.instantiate("7", BTreeMap::new());
        assert_eq!(workflow.steps[0].max_retries, 5);
        assert_eq!(workflow.steps[0].timeout_seconds, 60);
        assert_eq!(workflow.steps[1].max_retries, 1);
    }
}
