//! Liveness tracking and timeout handling for launched agents.
//!
//! The supervisor owns the ephemeral launch records and the retry-delay
//! computation. It never mutates workflow state: expired or dead launches
//! are reported as [`TimeoutResult`]s which the façade feeds back into the
//! state machine as synthetic completion events, so timeout handling and
//! agent-reported failure travel the same pathway.

use crate::config::TimeoutAction;
use crate::events::{EngineEvent, EventBus};
use crate::model::{BackoffStrategy, RetryPolicy};
use crate::provider::AgentHandle;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Tracks one in-flight agent execution.
pub struct LaunchRecord {
    pub handle: Box<dyn AgentHandle>,
    pub agent_type: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub timeout_deadline: DateTime<Utc>,
    liveness_misses: u32,
}

/// Why a launch was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The timeout deadline passed without a completion.
    DeadlineExceeded,
    /// The handle went dead before the deadline and stayed dead for the
    /// configured number of consecutive checks.
    AgentDied,
}

/// One reaped launch, to be converted into a synthetic completion.
#[derive(Debug, Clone)]
pub struct TimeoutResult {
    pub workflow_id: String,
    pub step_id: String,
    pub agent_type: String,
    pub kind: TimeoutKind,
    pub elapsed: Duration,
    /// False when `timeout_action` is `fail_step`: the step must fail
    /// without consulting its retry policy.
    pub retry_allowed: bool,
}

/// Retry/timeout supervisor.
pub struct Supervisor {
    launches: HashMap<(String, String), LaunchRecord>,
    liveness_miss_threshold: u32,
    timeout_action: TimeoutAction,
    events: EventBus,
}

impl Supervisor {
    pub fn new(liveness_miss_threshold: u32, timeout_action: TimeoutAction, events: EventBus) -> Self {
        Self {
            launches: HashMap::new(),
            liveness_miss_threshold: liveness_miss_threshold.max(1),
            timeout_action,
            events,
        }
    }

    /// Registers a launched agent. Replaces any stale record for the step.
    pub fn track_launch(
        &mut self,
        workflow_id: &str,
        step_id: &str,
        agent_type: &str,
        handle: Box<dyn AgentHandle>,
        timeout_seconds: u64,
    ) {
        let now = Utc::now();
        self.launches.insert(
            (workflow_id.to_string(), step_id.to_string()),
            LaunchRecord {
                handle,
                agent_type: agent_type.to_string(),
                started_at: now,
                last_heartbeat_at: now,
                timeout_deadline: now + ChronoDuration::seconds(timeout_seconds as i64),
                liveness_misses: 0,
            },
        );
    }

    /// Whether a launch is tracked for the given step.
    pub fn tracks(&self, workflow_id: &str, step_id: &str) -> bool {
        self.launches
            .contains_key(&(workflow_id.to_string(), step_id.to_string()))
    }

    /// Records evidence that the agent is still executing.
    pub fn record_heartbeat(&mut self, workflow_id: &str, step_id: &str) {
        if let Some(record) = self
            .launches
            .get_mut(&(workflow_id.to_string(), step_id.to_string()))
        {
            record.last_heartbeat_at = Utc::now();
            record.liveness_misses = 0;
        }
    }

    /// Drops the launch record once its completion has been applied.
    pub fn untrack(&mut self, workflow_id: &str, step_id: &str) -> Option<LaunchRecord> {
        self.launches
            .remove(&(workflow_id.to_string(), step_id.to_string()))
    }

    /// Terminates and drops every launch belonging to a workflow. Used when
    /// the workflow is stopped or reaches a terminal state.
    pub async fn terminate_workflow(&mut self, workflow_id: &str) {
        let keys: Vec<(String, String)> = self
            .launches
            .keys()
            .filter(|(wf, _)| wf == workflow_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(record) = self.launches.remove(&key) {
                if let Err(e) = record.handle.terminate().await {
                    tracing::warn!(
                        "Failed to terminate agent for workflow {} step {}: {}",
                        key.0,
                        key.1,
                        e
                    );
                }
            }
        }
    }

    /// Reaps launches whose deadline passed or whose agent died, issuing a
    /// forced termination and returning one result per reaped launch.
    ///
    /// With `timeout_action = alert_only`, an expired launch emits an event
    /// and stays tracked.
    pub async fn check_timeouts(&mut self) -> Vec<TimeoutResult> {
        let now = Utc::now();
        let mut results = Vec::new();
        let mut reap = Vec::new();
        let mut alerted = Vec::new();

        for ((workflow_id, step_id), record) in &mut self.launches {
            let elapsed = (now - record.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);

            if now >= record.timeout_deadline {
                if self.timeout_action == TimeoutAction::AlertOnly {
                    alerted.push((workflow_id.clone(), step_id.clone(), elapsed));
                    continue;
                }
                reap.push((workflow_id.clone(), step_id.clone(), TimeoutKind::DeadlineExceeded, elapsed));
                continue;
            }

            // Liveness probe: a transiently unobservable agent is tolerated
            // until the miss threshold is reached.
            if record.handle.is_alive().await {
                record.liveness_misses = 0;
            } else {
                record.liveness_misses += 1;
                if record.liveness_misses >= self.liveness_miss_threshold {
                    reap.push((workflow_id.clone(), step_id.clone(), TimeoutKind::AgentDied, elapsed));
                }
            }
        }

        for (workflow_id, step_id, elapsed) in alerted {
            let agent_type = self
                .launches
                .get(&(workflow_id.clone(), step_id.clone()))
                .map(|r| r.agent_type.clone())
                .unwrap_or_default();
            tracing::warn!(
                "Agent timeout for workflow {} step {} ({}); timeout_action=alert_only, leaving it running",
                workflow_id,
                step_id,
                agent_type
            );
            self.events.emit(EngineEvent::AgentTimeout {
                workflow_id,
                step_id,
                agent_type,
                elapsed_seconds: elapsed.as_secs(),
            });
        }

        for (workflow_id, step_id, kind, elapsed) in reap {
            let Some(record) = self.launches.remove(&(workflow_id.clone(), step_id.clone())) else {
                continue;
            };
            if kind == TimeoutKind::DeadlineExceeded {
                if let Err(e) = record.handle.terminate().await {
                    tracing::warn!(
                        "Failed to kill timed-out agent for workflow {} step {}: {}",
                        workflow_id,
                        step_id,
                        e
                    );
                }
            }
            tracing::warn!(
                "Reaped launch for workflow {} step {} ({:?} after {:?})",
                workflow_id,
                step_id,
                kind,
                elapsed
            );
            self.events.emit(EngineEvent::AgentTimeout {
                workflow_id: workflow_id.clone(),
                step_id: step_id.clone(),
                agent_type: record.agent_type.clone(),
                elapsed_seconds: elapsed.as_secs(),
            });
            results.push(TimeoutResult {
                workflow_id,
                step_id,
                agent_type: record.agent_type,
                kind,
                elapsed,
                retry_allowed: self.timeout_action != TimeoutAction::FailStep,
            });
        }

        results
    }

    /// Number of tracked launches.
    pub fn tracked_count(&self) -> usize {
        self.launches.len()
    }

    /// Workflow ids with at least one tracked launch.
    pub fn tracked_workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.launches.keys().map(|(wf, _)| wf.clone()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Backoff delay before attempt `attempt` may be relaunched.
///
/// `attempt` is 1-based: the delay after the first failed attempt is the
/// initial delay. Capped at `max_delay_seconds`.
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = if policy.initial_delay_seconds > 0.0 {
        policy.initial_delay_seconds
    } else {
        1.0
    };
    let attempt = attempt.max(1);
    let raw = match policy.backoff {
        BackoffStrategy::Constant => base,
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Exponential => base * 2f64.powi((attempt - 1).min(24) as i32),
    };
    Duration::from_secs_f64(raw.min(policy.max_delay_seconds.max(base)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NullHandle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeHandle {
        alive: Arc<AtomicBool>,
        terminations: Arc<AtomicU32>,
    }

    impl FakeHandle {
        fn pair(alive: bool) -> (Box<dyn AgentHandle>, Arc<AtomicBool>, Arc<AtomicU32>) {
            let alive = Arc::new(AtomicBool::new(alive));
            let terminations = Arc::new(AtomicU32::new(0));
            (
                Box::new(Self {
                    alive: alive.clone(),
                    terminations: terminations.clone(),
                }),
                alive,
                terminations,
            )
        }
    }

    #[async_trait]
    impl AgentHandle for FakeHandle {
        fn id(&self) -> String {
            "fake".to_string()
        }

        fn pid(&self) -> Option<u32> {
            None
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&self) -> anyhow::Result<()> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn deadline_timeout_kills_and_reports() {
        let mut supervisor = Supervisor::new(3, TimeoutAction::Retry, EventBus::new(16));
        let (handle, _, terminations) = FakeHandle::pair(true);
        supervisor.track_launch("wf-1", "triage", "triage", handle, 0);

        let results = supervisor.check_timeouts().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, TimeoutKind::DeadlineExceeded);
        assert!(results[0].retry_allowed);
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn dead_agent_needs_consecutive_misses() {
        let mut supervisor = Supervisor::new(3, TimeoutAction::Retry, EventBus::new(16));
        let (handle, alive, _) = FakeHandle::pair(false);
        supervisor.track_launch("wf-1", "triage", "triage", handle, 3600);

        // Two misses: still tolerated.
        assert!(supervisor.check_timeouts().await.is_empty());
        assert!(supervisor.check_timeouts().await.is_empty());
        assert_eq!(supervisor.tracked_count(), 1);

        // A heartbeat (or an observed-alive probe) resets the count.
        alive.store(true, Ordering::SeqCst);
        assert!(supervisor.check_timeouts().await.is_empty());
        alive.store(false, Ordering::SeqCst);
        assert!(supervisor.check_timeouts().await.is_empty());
        assert!(supervisor.check_timeouts().await.is_empty());

        // Third consecutive miss reaps the launch.
        let results = supervisor.check_timeouts().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, TimeoutKind::AgentDied);
        assert_eq!(supervisor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn alert_only_keeps_launch_tracked() {
        let mut supervisor = Supervisor::new(3, TimeoutAction::AlertOnly, EventBus::new(16));
        let (handle, _, terminations) = FakeHandle::pair(true);
        supervisor.track_launch("wf-1", "triage", "triage", handle, 0);

        let results = supervisor.check_timeouts().await;
        assert!(results.is_empty());
        assert_eq!(supervisor.tracked_count(), 1);
        assert_eq!(terminations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fail_step_disallows_retry() {
        let mut supervisor = Supervisor::new(3, TimeoutAction::FailStep, EventBus::new(16));
        supervisor.track_launch("wf-1", "triage", "triage", Box::new(NullHandle::new("x")), 0);

        let results = supervisor.check_timeouts().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].retry_allowed);
    }

    #[tokio::test]
    async fn terminate_workflow_tears_down_all_launches() {
        let mut supervisor = Supervisor::new(3, TimeoutAction::Retry, EventBus::new(16));
        let (first, _, first_kills) = FakeHandle::pair(true);
        let (second, _, second_kills) = FakeHandle::pair(true);
        supervisor.track_launch("wf-1", "a", "a", first, 3600);
        supervisor.track_launch("wf-1", "b", "b", second, 3600);
        supervisor.track_launch("wf-2", "a", "a", Box::new(NullHandle::new("other")), 3600);

        supervisor.terminate_workflow("wf-1").await;
        assert_eq!(supervisor.tracked_count(), 1);
        assert_eq!(first_kills.load(Ordering::SeqCst), 1);
        assert_eq!(second_kills.load(Ordering::SeqCst), 1);
        assert!(supervisor.tracks("wf-2", "a"));
    }

    #[test]
    fn backoff_strategies() {
        let policy = |backoff| RetryPolicy {
            max_retries: 3,
            backoff,
            initial_delay_seconds: 2.0,
            max_delay_seconds: 60.0,
        };
        assert_eq!(
            delay_for_attempt(&policy(BackoffStrategy::Constant), 3),
            Duration::from_secs_f64(2.0)
        );
        assert_eq!(
            delay_for_attempt(&policy(BackoffStrategy::Linear), 3),
            Duration::from_secs_f64(6.0)
        );
        assert_eq!(
            delay_for_attempt(&policy(BackoffStrategy::Exponential), 3),
            Duration::from_secs_f64(8.0)
        );
    }

    mod backoff_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn backoff_is_positive_and_capped(
                attempt in 1u32..64,
                initial in 0.1f64..30.0,
                max in 1.0f64..600.0,
            ) {
                let policy = RetryPolicy {
                    max_retries: 3,
                    backoff: BackoffStrategy::Exponential,
                    initial_delay_seconds: initial,
                    max_delay_seconds: max,
                };
                let delay = delay_for_attempt(&policy, attempt);
                prop_assert!(delay > Duration::ZERO);
                prop_assert!(delay.as_secs_f64() <= max.max(initial) + 1e-9);
            }
        }
    }
}
