//! Subprocess execution backend.
//!
//! Spawns a configured CLI with placeholder-substituted arguments. The
//! agent runs detached from the engine loop, with stdout/stderr going to a
//! log file under the state dir, and reports completion out of band through a
//! completion source.

use crate::config::ProviderConfig;
use crate::provider::{render_template, AgentHandle, AgentProvider, ExecutionRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// CLI-backed [`AgentProvider`].
pub struct ProcessProvider {
    name: String,
    command: String,
    args: Vec<String>,
    log_dir: Option<PathBuf>,
}

impl ProcessProvider {
    pub fn new(name: &str, command: &str, args: Vec<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args,
            log_dir,
        }
    }

    pub fn from_config(config: &ProviderConfig, log_dir: Option<PathBuf>) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .with_context(|| format!("process provider '{}' has no command", config.name))?;
        Ok(Self::new(&config.name, command, config.args.clone(), log_dir))
    }

    fn rendered_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| render_template(arg, request))
            .collect();
        // Providers that don't template the prompt receive it as the last
        // argument.
        if !self.args.iter().any(|arg| arg.contains("{prompt}")) {
            args.push(request.prompt.clone());
        }
        args
    }

    fn open_log(&self, request: &ExecutionRequest) -> Option<std::fs::File> {
        let dir = self.log_dir.as_ref()?;
        if std::fs::create_dir_all(dir).is_err() {
            return None;
        }
        let path = dir.join(format!(
            "{}_{}_{}.log",
            self.name,
            request.subject,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::File::create(path).ok()
    }
}

#[async_trait]
impl AgentProvider for ProcessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_availability(&self) -> bool {
        which::which(&self.command).is_ok()
    }

    async fn launch(&self, request: &ExecutionRequest) -> Result<Box<dyn AgentHandle>> {
        let mut command = Command::new(&self.command);
        command
            .args(self.rendered_args(request))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null());

        match self.open_log(request) {
            Some(log) => {
                let stderr_log = log.try_clone().context("Failed to clone agent log handle")?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(stderr_log));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command.spawn().with_context(|| {
            format!(
                "Failed to spawn {} process for agent {}",
                self.command, request.agent_type
            )
        })?;
        let pid = child.id();
        tracing::info!(
            "Launched agent {} for workflow {} via {} (pid {:?})",
            request.agent_type,
            request.workflow_id,
            self.name,
            pid
        );

        Ok(Box::new(ProcessHandle {
            id: format!("{}:{}", self.name, pid.unwrap_or(0)),
            pid,
            child: Arc::new(Mutex::new(child)),
        }))
    }
}

/// Handle over a spawned subprocess.
pub struct ProcessHandle {
    id: String,
    pid: Option<u32>,
    child: Arc<Mutex<Child>>,
}

#[async_trait]
impl AgentHandle for ProcessHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn terminate(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => {
                child
                    .kill()
                    .await
                    .context("Failed to kill agent subprocess")?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            workflow_id: "wf-1".into(),
            step_id: "triage".into(),
            agent_type: "triage".into(),
            subject: "42".into(),
            prompt: "classify".into(),
            working_dir: std::env::temp_dir(),
            timeout_seconds: 600,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn prompt_is_appended_when_not_templated() {
        let provider = ProcessProvider::new("echo", "echo", vec!["--agent".into()], None);
        let args = provider.rendered_args(&request());
        assert_eq!(args, vec!["--agent".to_string(), "classify".to_string()]);
    }

    #[test]
    fn templated_prompt_is_not_duplicated() {
        let provider = ProcessProvider::new("echo", "echo", vec!["{prompt}".into()], None);
        let args = provider.rendered_args(&request());
        assert_eq!(args, vec!["classify".to_string()]);
    }

    #[tokio::test]
    async fn spawns_and_observes_exit() {
        let provider = ProcessProvider::new("sh", "sh", vec!["-c".into(), "exit 0".into()], None);
        // The prompt arg is appended but ignored by `sh -c 'exit 0'`.
        let handle = provider.launch(&request()).await.unwrap();
        assert!(handle.pid().is_some());

        // The process exits almost immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_alive().await);
        assert!(handle.terminate().await.is_ok());
    }

    #[tokio::test]
    async fn terminate_kills_long_running_process() {
        let provider =
            ProcessProvider::new("sleeper", "sh", vec!["-c".into(), "sleep 30".into()], None);
        let handle = provider.launch(&request()).await.unwrap();
        assert!(handle.is_alive().await);
        handle.terminate().await.unwrap();
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn availability_follows_path_lookup() {
        let present = ProcessProvider::new("sh", "sh", vec![], None);
        assert!(present.check_availability().await);

        let absent = ProcessProvider::new("ghost", "definitely-not-a-real-binary", vec![], None);
        assert!(!absent.check_availability().await);
    }
}
