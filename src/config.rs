//! Orchestration configuration.
//!
//! An explicit [`ConductorConfig`] is constructed once at startup and passed
//! into component constructors; engine logic never consults ambient globals
//! or environment variables. Unknown enum-like values are validation errors,
//! not silent aliases.

use crate::model::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What to do when a launched agent exceeds its timeout deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Kill the agent and retry the step per its retry policy.
    #[default]
    Retry,
    /// Kill the agent and fail the step without retrying.
    FailStep,
    /// Emit an event but leave the agent running.
    AlertOnly,
}

/// Recovery action for steps found running with no live process at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleRunningStepAction {
    /// Treat the step as a missed heartbeat; the first cycle reconciles it
    /// through the ordinary timeout path.
    #[default]
    Reconcile,
    /// Fail the workflow immediately.
    FailWorkflow,
}

/// Polling-loop and completion-detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSettings {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// File name pattern scanned for agent completion summaries. The
    /// `{subject}` placeholder is captured as the workflow's subject key.
    #[serde(default = "default_completion_pattern")]
    pub completion_pattern: String,
    #[serde(default = "default_dedupe_cache_size")]
    pub dedupe_cache_size: usize,
    #[serde(default = "default_agent_timeout")]
    pub default_timeout_seconds: u64,
    /// Consecutive missed liveness checks before a dead agent is acted on.
    #[serde(default = "default_liveness_miss_threshold")]
    pub liveness_miss_threshold: u32,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
    /// When false, completed steps never auto-launch their successor.
    #[serde(default = "default_true")]
    pub chaining_enabled: bool,
    #[serde(default)]
    pub stale_running_step_action: StaleRunningStepAction,
}

fn default_interval_seconds() -> u64 {
    15
}

fn default_completion_pattern() -> String {
    "completion_summary_{subject}.json".to_string()
}

fn default_dedupe_cache_size() -> usize {
    500
}

fn default_agent_timeout() -> u64 {
    3600
}

fn default_liveness_miss_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            completion_pattern: default_completion_pattern(),
            dedupe_cache_size: default_dedupe_cache_size(),
            default_timeout_seconds: default_agent_timeout(),
            liveness_miss_threshold: default_liveness_miss_threshold(),
            timeout_action: TimeoutAction::default(),
            chaining_enabled: default_true(),
            stale_running_step_action: StaleRunningStepAction::default(),
        }
    }
}

/// Execution backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Spawns a local CLI subprocess.
    Process,
    /// POSTs the request to an execution gateway.
    Http,
}

/// One configured execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// CLI binary for `process` providers.
    #[serde(default)]
    pub command: Option<String>,
    /// Argument template for `process` providers. `{agent_type}`,
    /// `{subject}`, `{workflow_id}` and `{prompt}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Base URL for `http` providers.
    #[serde(default)]
    pub url: Option<String>,
    /// Consecutive failures before the provider enters cooldown.
    #[serde(default = "default_cooldown_threshold")]
    pub cooldown_threshold: u32,
}

fn default_cooldown_threshold() -> u32 {
    3
}

/// Provider-orchestrator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Timeout applied to a single launch attempt.
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_seconds: u64,
    /// Base cooldown delay; grows exponentially with consecutive failures.
    #[serde(default = "default_cooldown_base")]
    pub cooldown_base_seconds: f64,
    #[serde(default = "default_cooldown_max")]
    pub cooldown_max_seconds: f64,
    /// Permit a second pass over the provider list within one execute call.
    #[serde(default)]
    pub retry_same_provider: bool,
}

fn default_launch_timeout() -> u64 {
    120
}

fn default_cooldown_base() -> f64 {
    30.0
}

fn default_cooldown_max() -> f64 {
    1800.0
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            launch_timeout_seconds: default_launch_timeout(),
            cooldown_base_seconds: default_cooldown_base(),
            cooldown_max_seconds: default_cooldown_max(),
            retry_same_provider: false,
        }
    }
}

/// Top-level configuration document.
///
/// An absent `orchestration`/`retry` block means safe defaults; an absent
/// `version` means the legacy (version 1) defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub provider_settings: ProviderSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Preference map: agent_type -> provider name tried first.
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
    /// Durable state directory. Defaults to `~/.agent-conductor`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl ConductorConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants the serde layer cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(version) = self.version {
            anyhow::ensure!(version == 1, "unsupported config version {}", version);
        }
        anyhow::ensure!(
            self.orchestration.interval_seconds > 0,
            "interval_seconds must be positive"
        );
        anyhow::ensure!(
            self.orchestration.dedupe_cache_size > 0,
            "dedupe_cache_size must be positive"
        );
        anyhow::ensure!(
            self.orchestration.completion_pattern.contains("{subject}"),
            "completion_pattern must contain the {{subject}} placeholder"
        );

        let mut names = std::collections::BTreeSet::new();
        for provider in &self.providers {
            anyhow::ensure!(
                names.insert(provider.name.as_str()),
                "duplicate provider name '{}'",
                provider.name
            );
            match provider.kind {
                ProviderKind::Process => anyhow::ensure!(
                    provider.command.is_some(),
                    "process provider '{}' requires a command",
                    provider.name
                ),
                ProviderKind::Http => anyhow::ensure!(
                    provider.url.is_some(),
                    "http provider '{}' requires a url",
                    provider.name
                ),
            }
        }
        for (agent_type, provider) in &self.preferences {
            anyhow::ensure!(
                names.contains(provider.as_str()),
                "preference for agent '{}' names unknown provider '{}'",
                agent_type,
                provider
            );
        }
        Ok(())
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".agent-conductor")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_safe_defaults() {
        let config: ConductorConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.orchestration.interval_seconds, 15);
        assert_eq!(config.orchestration.dedupe_cache_size, 500);
        assert_eq!(config.orchestration.liveness_miss_threshold, 3);
        assert_eq!(config.orchestration.timeout_action, TimeoutAction::Retry);
        assert_eq!(
            config.orchestration.stale_running_step_action,
            StaleRunningStepAction::Reconcile
        );
        assert!(config.orchestration.chaining_enabled);
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn unknown_timeout_action_is_rejected() {
        let yaml = "orchestration:\n  timeout_action: explode\n";
        let parsed: Result<ConductorConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_recovery_action_is_rejected() {
        let yaml = "orchestration:\n  stale_running_step_action: both\n";
        let parsed: Result<ConductorConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn process_provider_requires_command() {
        let yaml = "\
providers:
  - name: copilot
    kind: process
";
        let config: ConductorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn preference_must_name_known_provider() {
        let yaml = "\
providers:
  - name: copilot
    kind: process
    command: copilot
preferences:
  developer: gemini
";
        let config: ConductorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_document_parses() {
        let yaml = "\
version: 1
orchestration:
  interval_seconds: 5
  liveness_miss_threshold: 2
  timeout_action: fail_step
retry:
  max_retries: 1
  backoff: linear
providers:
  - name: copilot
    kind: process
    command: copilot
    args: [\"--agent\", \"{agent_type}\", \"--issue\", \"{subject}\"]
  - name: gateway
    kind: http
    url: http://localhost:8081
preferences:
  developer: copilot
";
        let config: ConductorConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.orchestration.interval_seconds, 5);
        assert_eq!(config.orchestration.timeout_action, TimeoutAction::FailStep);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.retry.max_retries, 1);
    }
}
