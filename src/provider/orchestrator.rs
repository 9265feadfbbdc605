//! Provider selection, fallback, and cooldown bookkeeping.
//!
//! `execute` tries providers in preference order, skipping ones that are
//! unavailable or cooling down, and falls back to the next on failure. A
//! provider that keeps failing enters an exponentially growing, jittered
//! cooldown so a single flaky backend cannot absorb every launch.

use crate::error::EngineError;
use crate::events::{AttemptOutcome, EngineEvent, EventBus};
use crate::model::ProviderStatus;
use crate::provider::{AgentProvider, AgentResult, ExecutionRequest};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Orchestrator tuning knobs, resolved from [`crate::config::ProviderSettings`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub launch_timeout: Duration,
    pub cooldown_base_seconds: f64,
    pub cooldown_max_seconds: f64,
    pub retry_same_provider: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(120),
            cooldown_base_seconds: 30.0,
            cooldown_max_seconds: 1800.0,
            retry_same_provider: false,
        }
    }
}

impl From<&crate::config::ProviderSettings> for OrchestratorSettings {
    fn from(settings: &crate::config::ProviderSettings) -> Self {
        Self {
            launch_timeout: Duration::from_secs(settings.launch_timeout_seconds),
            cooldown_base_seconds: settings.cooldown_base_seconds,
            cooldown_max_seconds: settings.cooldown_max_seconds,
            retry_same_provider: settings.retry_same_provider,
        }
    }
}

/// A provider plus its cooldown threshold.
pub struct RegisteredProvider {
    pub provider: Arc<dyn AgentProvider>,
    pub cooldown_threshold: u32,
}

/// Routes agent launches to the best available provider.
pub struct ProviderOrchestrator {
    providers: Vec<Arc<dyn AgentProvider>>,
    thresholds: HashMap<String, u32>,
    preferences: BTreeMap<String, String>,
    states: Mutex<HashMap<String, ProviderStatus>>,
    settings: OrchestratorSettings,
    events: EventBus,
}

impl ProviderOrchestrator {
    pub fn new(
        providers: Vec<RegisteredProvider>,
        preferences: BTreeMap<String, String>,
        settings: OrchestratorSettings,
        events: EventBus,
    ) -> Self {
        let mut thresholds = HashMap::new();
        let mut states = HashMap::new();
        let mut ordered = Vec::new();
        for registered in providers {
            let name = registered.provider.name().to_string();
            thresholds.insert(name.clone(), registered.cooldown_threshold.max(1));
            states.insert(name.clone(), ProviderStatus::new(&name));
            ordered.push(registered.provider);
        }
        Self {
            providers: ordered,
            thresholds,
            preferences,
            states: Mutex::new(states),
            settings,
            events,
        }
    }

    /// Launches an agent with the highest-preference available provider,
    /// falling back through the configured list. Each provider is tried at
    /// most once per call unless `retry_same_provider` is set.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<AgentResult, EngineError> {
        let candidates = self.ranked(&request.agent_type);
        if candidates.is_empty() {
            return Err(EngineError::AllProvidersExhausted {
                agent_type: request.agent_type.clone(),
                attempts: 0,
            });
        }

        let passes = if self.settings.retry_same_provider { 2 } else { 1 };
        let mut attempts = 0u32;

        for _ in 0..passes {
            for provider in &candidates {
                let name = provider.name().to_string();

                if self.in_cooldown(&name).await {
                    tracing::debug!("Provider {} in cooldown, skipping", name);
                    self.emit_attempt(&name, request, AttemptOutcome::CoolingDown, 0);
                    continue;
                }

                if !provider.check_availability().await {
                    tracing::info!("Provider {} unavailable, trying next", name);
                    self.mark_availability(&name, false).await;
                    self.emit_attempt(&name, request, AttemptOutcome::Unavailable, 0);
                    continue;
                }
                self.mark_availability(&name, true).await;

                attempts += 1;
                let started = Instant::now();
                let launch = tokio::time::timeout(
                    self.settings.launch_timeout,
                    provider.launch(request),
                )
                .await;
                let latency_ms = started.elapsed().as_millis() as u64;

                match launch {
                    Ok(Ok(handle)) => {
                        self.record_success(&name).await;
                        self.emit_attempt(&name, request, AttemptOutcome::Launched, latency_ms);
                        return Ok(AgentResult {
                            provider_used: name.clone(),
                            output: format!("agent {} launched via {}", request.agent_type, name),
                            attempts,
                            handle,
                        });
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Provider {} failed: {}", name, e);
                        self.record_failure(&name).await;
                        self.emit_attempt(&name, request, AttemptOutcome::Failed, latency_ms);
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Provider {} launch timed out after {:?}",
                            name,
                            self.settings.launch_timeout
                        );
                        self.record_failure(&name).await;
                        self.emit_attempt(&name, request, AttemptOutcome::Failed, latency_ms);
                    }
                }
            }
        }

        Err(EngineError::AllProvidersExhausted {
            agent_type: request.agent_type.clone(),
            attempts,
        })
    }

    /// Snapshot of the provider state table.
    pub async fn provider_states(&self) -> Vec<ProviderStatus> {
        let states = self.states.lock().await;
        let mut all: Vec<ProviderStatus> = states.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn ranked(&self, agent_type: &str) -> Vec<Arc<dyn AgentProvider>> {
        let preferred = self.preferences.get(agent_type);
        let mut ordered = Vec::with_capacity(self.providers.len());
        if let Some(preferred) = preferred {
            if let Some(provider) = self.providers.iter().find(|p| p.name() == preferred) {
                ordered.push(Arc::clone(provider));
            }
        }
        for provider in &self.providers {
            if preferred.map(|p| p.as_str()) == Some(provider.name()) {
                continue;
            }
            ordered.push(Arc::clone(provider));
        }
        ordered
    }

    async fn in_cooldown(&self, name: &str) -> bool {
        let states = self.states.lock().await;
        states
            .get(name)
            .map(|state| state.in_cooldown(Utc::now()))
            .unwrap_or(false)
    }

    async fn mark_availability(&self, name: &str, available: bool) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(name) {
            state.available = available;
        }
    }

    async fn record_success(&self, name: &str) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(name) {
            state.consecutive_failures = 0;
            state.cooldown_until = None;
            state.available = true;
        }
    }

    async fn record_failure(&self, name: &str) {
        let threshold = self.thresholds.get(name).copied().unwrap_or(3);
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(name) {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= threshold {
                let excess = state.consecutive_failures - threshold;
                let delay = cooldown_delay_seconds(
                    self.settings.cooldown_base_seconds,
                    self.settings.cooldown_max_seconds,
                    excess,
                );
                state.cooldown_until =
                    Some(Utc::now() + ChronoDuration::milliseconds((delay * 1000.0) as i64));
                tracing::warn!(
                    "Provider {} entering cooldown for {:.0}s after {} consecutive failures",
                    name,
                    delay,
                    state.consecutive_failures
                );
            }
        }
    }

    fn emit_attempt(
        &self,
        provider: &str,
        request: &ExecutionRequest,
        outcome: AttemptOutcome,
        latency_ms: u64,
    ) {
        self.events.emit(EngineEvent::ProviderAttempt {
            provider: provider.to_string(),
            agent_type: request.agent_type.clone(),
            outcome,
            latency_ms,
        });
    }
}

/// Exponential cooldown with jitter, capped at `max_seconds`.
fn cooldown_delay_seconds(base_seconds: f64, max_seconds: f64, excess_failures: u32) -> f64 {
    let exponent = excess_failures.min(16);
    let raw = base_seconds * 2f64.powi(exponent as i32);
    let capped = raw.min(max_seconds);
    let jitter = capped * rand::thread_rng().gen_range(0.0..0.1);
    (capped + jitter).min(max_seconds * 1.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AgentHandle, NullHandle};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProvider {
        name: String,
        available: bool,
        fail: bool,
        launches: AtomicU32,
    }

    impl StubProvider {
        fn new(name: &str, available: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                available,
                fail,
                launches: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentProvider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check_availability(&self) -> bool {
            self.available
        }

        async fn launch(
            &self,
            _request: &ExecutionRequest,
        ) -> anyhow::Result<Box<dyn AgentHandle>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("simulated launch failure");
            }
            Ok(Box::new(NullHandle::new(format!("{}-handle", self.name))))
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            workflow_id: "wf-1".into(),
            step_id: "implement".into(),
            agent_type: "developer".into(),
            subject: "42".into(),
            prompt: "build it".into(),
            working_dir: PathBuf::from("."),
            timeout_seconds: 600,
            metadata: BTreeMap::new(),
        }
    }

    fn orchestrator(providers: Vec<Arc<StubProvider>>) -> ProviderOrchestrator {
        orchestrator_with_prefs(providers, BTreeMap::new())
    }

    fn orchestrator_with_prefs(
        providers: Vec<Arc<StubProvider>>,
        preferences: BTreeMap<String, String>,
    ) -> ProviderOrchestrator {
        let registered = providers
            .into_iter()
            .map(|p| RegisteredProvider {
                provider: p as Arc<dyn AgentProvider>,
                cooldown_threshold: 2,
            })
            .collect();
        ProviderOrchestrator::new(
            registered,
            preferences,
            OrchestratorSettings::default(),
            EventBus::new(64),
        )
    }

    #[tokio::test]
    async fn falls_back_past_unavailable_provider() {
        let a = StubProvider::new("a", false, false);
        let b = StubProvider::new("b", true, false);
        let c = StubProvider::new("c", true, false);
        let orchestrator = orchestrator(vec![a.clone(), b.clone(), c.clone()]);

        let result = orchestrator.execute(&request()).await.unwrap();
        assert_eq!(result.provider_used, "b");
        assert_eq!(result.attempts, 1);
        assert_eq!(a.launches.load(Ordering::SeqCst), 0);
        assert_eq!(c.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cooldown_provider_is_never_invoked() {
        let copilot = StubProvider::new("copilot", true, true);
        let gemini = StubProvider::new("gemini", true, false);
        let orchestrator = orchestrator(vec![copilot.clone(), gemini.clone()]);

        // Two failing calls push copilot past its threshold into cooldown.
        for _ in 0..2 {
            let result = orchestrator.execute(&request()).await.unwrap();
            assert_eq!(result.provider_used, "gemini");
        }
        let states = orchestrator.provider_states().await;
        let copilot_state = states.iter().find(|s| s.name == "copilot").unwrap();
        assert!(copilot_state.cooldown_until.is_some());
        assert_eq!(copilot_state.consecutive_failures, 2);

        // While cooling down, copilot is skipped without an invocation.
        let before = copilot.launches.load(Ordering::SeqCst);
        let result = orchestrator.execute(&request()).await.unwrap();
        assert_eq!(result.provider_used, "gemini");
        assert_eq!(copilot.launches.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn preference_reorders_candidates() {
        let a = StubProvider::new("a", true, false);
        let b = StubProvider::new("b", true, false);
        let mut preferences = BTreeMap::new();
        preferences.insert("developer".to_string(), "b".to_string());
        let orchestrator = orchestrator_with_prefs(vec![a, b], preferences);

        let result = orchestrator.execute(&request()).await.unwrap();
        assert_eq!(result.provider_used, "b");
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let a = StubProvider::new("a", true, true);
        let b = StubProvider::new("b", true, true);
        let orchestrator = orchestrator(vec![a, b]);

        let err = orchestrator.execute(&request()).await.unwrap_err();
        match err {
            EngineError::AllProvidersExhausted {
                agent_type,
                attempts,
            } => {
                assert_eq!(agent_type, "developer");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let flaky = StubProvider::new("flaky", true, true);
        let orchestrator = orchestrator(vec![flaky.clone()]);
        let _ = orchestrator.execute(&request()).await;

        let states = orchestrator.provider_states().await;
        assert_eq!(states[0].consecutive_failures, 1);

        orchestrator.record_success("flaky").await;
        let states = orchestrator.provider_states().await;
        assert_eq!(states[0].consecutive_failures, 0);
        assert!(states[0].cooldown_until.is_none());
    }

    #[tokio::test]
    async fn attempt_events_are_emitted() {
        let a = StubProvider::new("a", true, false);
        let registered = vec![RegisteredProvider {
            provider: a as Arc<dyn AgentProvider>,
            cooldown_threshold: 2,
        }];
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let orchestrator = ProviderOrchestrator::new(
            registered,
            BTreeMap::new(),
            OrchestratorSettings::default(),
            events,
        );

        orchestrator.execute(&request()).await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::ProviderAttempt {
                provider, outcome, ..
            } => {
                assert_eq!(provider, "a");
                assert_eq!(outcome, AttemptOutcome::Launched);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn cooldown_delay_is_capped() {
        for excess in 0..20 {
            let delay = cooldown_delay_seconds(30.0, 1800.0, excess);
            assert!(delay >= 30.0);
            assert!(delay <= 1800.0 * 1.1);
        }
    }
}
