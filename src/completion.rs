//! Completion detection: turning out-of-band agent signals into normalized
//! [`CompletionEvent`]s.
//!
//! Agents report completion by writing `completion_summary_{subject}.json`
//! files or by POSTing the same JSON shape to an external intake that feeds
//! the queue source. Sources yield a lazy, finite batch per scan; push
//! delivery is never assumed. A bounded LRU of seen dedup keys is the fast
//! first line of defense against resubmitting unchanged sources; true
//! idempotence is still enforced by the state machine when the event is
//! applied.

use crate::model::{CompletionEvent, CompletionStatus, Workflow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// A completion signal as read from a source, keyed by subject rather than
/// workflow id.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub subject: String,
    pub agent_type: String,
    pub status: CompletionStatus,
    pub summary: String,
    pub key_findings: Vec<String>,
    pub next_agent: Option<String>,
    pub dedup_key: String,
    pub raw: Value,
    pub observed_at: DateTime<Utc>,
}

/// A completion source scanned each cycle.
#[async_trait]
pub trait CompletionSource: Send {
    fn name(&self) -> &str;

    /// Returns the completions currently visible to this source, in
    /// source-stable order. No ordering is guaranteed between sources.
    async fn scan(&mut self) -> Result<Vec<RawCompletion>>;
}

/// Parses one completion payload. Returns `None` (with a warning) when the
/// payload is missing required fields.
pub fn parse_payload(subject: &str, payload: &Value) -> Option<RawCompletion> {
    let object = payload.as_object()?;
    let status_text = object.get("status").and_then(Value::as_str).unwrap_or("");
    let status = match CompletionStatus::parse(status_text) {
        Some(status) => status,
        None => {
            tracing::warn!(
                "Ignoring completion for subject {} with unknown status '{}'",
                subject,
                status_text
            );
            return None;
        }
    };
    let agent_type = object
        .get("agent_type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if agent_type.is_empty() {
        tracing::warn!("Ignoring completion for subject {} without agent_type", subject);
        return None;
    }

    let summary = object
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let key_findings = object
        .get("key_findings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let next_agent = object
        .get("next_agent")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(RawCompletion {
        subject: subject.to_string(),
        agent_type: agent_type.clone(),
        status,
        summary,
        key_findings,
        next_agent,
        dedup_key: format!("{}:{}:{}", subject, agent_type, status.as_str()),
        raw: payload.clone(),
        observed_at: Utc::now(),
    })
}

/// Scans a directory tree for completion summary files.
pub struct FileSource {
    root: PathBuf,
    file_re: Regex,
}

impl FileSource {
    /// `pattern` is a file name pattern containing a `{subject}` placeholder,
    /// e.g. `completion_summary_{subject}.json`.
    pub fn new(root: &Path, pattern: &str) -> Result<Self> {
        let escaped = regex::escape(pattern).replace("\\{subject\\}", "([A-Za-z0-9_-]+)");
        let file_re = Regex::new(&format!("^{}$", escaped))
            .with_context(|| format!("invalid completion pattern '{}'", pattern))?;
        Ok(Self {
            root: root.to_path_buf(),
            file_re,
        })
    }

    fn collect_files(&self, dir: &Path, found: &mut Vec<(String, PathBuf, SystemTime)>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.collect_files(&path, found);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(captures) = self.file_re.captures(name) else {
                continue;
            };
            let Some(subject) = captures.get(1).map(|m| m.as_str().to_string()) else {
                continue;
            };
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((subject, path, mtime));
        }
    }
}

#[async_trait]
impl CompletionSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn scan(&mut self) -> Result<Vec<RawCompletion>> {
        let mut found = Vec::new();
        self.collect_files(&self.root.clone(), &mut found);

        // Newest file wins per subject; results are yielded in mtime order.
        let mut newest: HashMap<String, (PathBuf, SystemTime)> = HashMap::new();
        for (subject, path, mtime) in found {
            match newest.get(&subject) {
                Some((_, existing)) if *existing >= mtime => {}
                _ => {
                    newest.insert(subject, (path, mtime));
                }
            }
        }

        let mut ordered: Vec<(String, PathBuf, SystemTime)> = newest
            .into_iter()
            .map(|(subject, (path, mtime))| (subject, path, mtime))
            .collect();
        ordered.sort_by_key(|(_, _, mtime)| *mtime);

        let mut completions = Vec::new();
        for (subject, path, _) in ordered {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("Error reading completion file {}: {}", path.display(), e);
                    continue;
                }
            };
            let payload: Value = match serde_json::from_str(&content) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Invalid JSON in {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Some(completion) = parse_payload(&subject, &payload) {
                completions.push(completion);
            }
        }
        Ok(completions)
    }
}

/// Handle given to an external intake (e.g. a webhook server) for enqueueing
/// completion payloads.
#[derive(Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<Value>,
}

impl IntakeQueue {
    /// Enqueues one payload of the shape
    /// `{issue_number, agent_type, status, summary, ...}`.
    pub async fn submit(&self, payload: Value) -> Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("completion intake closed"))
    }
}

/// Queue-backed completion source fed by [`IntakeQueue`].
pub struct IntakeSource {
    rx: mpsc::Receiver<Value>,
}

/// Creates a connected intake queue and source pair.
pub fn intake_channel(capacity: usize) -> (IntakeQueue, IntakeSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (IntakeQueue { tx }, IntakeSource { rx })
}

#[async_trait]
impl CompletionSource for IntakeSource {
    fn name(&self) -> &str {
        "intake"
    }

    async fn scan(&mut self) -> Result<Vec<RawCompletion>> {
        let mut completions = Vec::new();
        while let Ok(payload) = self.rx.try_recv() {
            let subject = payload
                .get("issue_number")
                .or_else(|| payload.get("subject"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            if subject.is_empty() {
                tracing::warn!("Ignoring intake payload without issue_number/subject");
                continue;
            }
            if let Some(completion) = parse_payload(&subject, &payload) {
                completions.push(completion);
            }
        }
        Ok(completions)
    }
}

/// Bounded LRU of recently seen dedup keys.
pub struct DedupCache {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Records a key, evicting the oldest entry when full.
    pub fn insert(&mut self, key: &str) {
        if self.seen.insert(key.to_string()) {
            self.order.push_back(key.to_string());
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Maps completion subjects to workflows and their currently running steps.
/// Rebuilt by the façade each cycle from the durable store.
#[derive(Debug, Default, Clone)]
pub struct SubjectIndex {
    entries: HashMap<String, SubjectEntry>,
}

#[derive(Debug, Clone)]
pub struct SubjectEntry {
    pub workflow_id: String,
    /// `(step_id, agent_type)` pairs for running steps.
    pub running: Vec<(String, String)>,
}

impl SubjectIndex {
    pub fn from_workflows<'a>(workflows: impl IntoIterator<Item = &'a Workflow>) -> Self {
        let mut entries = HashMap::new();
        for workflow in workflows {
            if workflow.is_terminal() {
                continue;
            }
            let running = workflow
                .running_steps()
                .map(|s| (s.step_id.clone(), s.agent_type.clone()))
                .collect();
            entries.insert(
                workflow.subject.clone(),
                SubjectEntry {
                    workflow_id: workflow.id.clone(),
                    running,
                },
            );
        }
        Self { entries }
    }

    pub fn get(&self, subject: &str) -> Option<&SubjectEntry> {
        self.entries.get(subject)
    }
}

/// Normalizes raw completions from all sources into [`CompletionEvent`]s.
pub struct CompletionDetector {
    sources: Vec<Box<dyn CompletionSource>>,
    cache: DedupCache,
}

impl CompletionDetector {
    pub fn new(sources: Vec<Box<dyn CompletionSource>>, dedupe_cache_size: usize) -> Self {
        Self {
            sources,
            cache: DedupCache::new(dedupe_cache_size),
        }
    }

    /// Scans every source and yields events for subjects known to the index.
    ///
    /// An event whose agent matches a currently running step bypasses the
    /// advisory cache: a retried step legitimately re-expects the same
    /// agent, and the state machine's durable ledger is the authority on
    /// true duplicates.
    pub async fn scan(&mut self, index: &SubjectIndex) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        for source in &mut self.sources {
            let raws = match source.scan().await {
                Ok(raws) => raws,
                Err(e) => {
                    tracing::warn!("Completion source {} scan failed: {}", source.name(), e);
                    continue;
                }
            };
            for raw in raws {
                let Some(entry) = index.get(&raw.subject) else {
                    tracing::trace!("No workflow for completion subject {}", raw.subject);
                    continue;
                };
                let matched_step = entry
                    .running
                    .iter()
                    .find(|(_, agent_type)| *agent_type == raw.agent_type)
                    .map(|(step_id, _)| step_id.clone());
                let Some(step_id) = matched_step else {
                    tracing::debug!(
                        "Stale completion for subject {}: no running step for agent {}",
                        raw.subject,
                        raw.agent_type
                    );
                    self.cache.insert(&raw.dedup_key);
                    continue;
                };

                if self.cache.contains(&raw.dedup_key) {
                    // Still re-deliver: the workflow expects this agent, so
                    // the cached key may belong to an earlier attempt.
                    tracing::trace!("Re-delivering cached completion {}", raw.dedup_key);
                }
                self.cache.insert(&raw.dedup_key);

                events.push(CompletionEvent {
                    workflow_id: entry.workflow_id.clone(),
                    step_id,
                    agent_type: raw.agent_type,
                    status: raw.status,
                    summary: raw.summary,
                    key_findings: raw.key_findings,
                    next_agent: raw.next_agent,
                    dedup_key: raw.dedup_key,
                    raw_payload: raw.raw,
                    observed_at: raw.observed_at,
                });
            }
        }
        events
    }

    /// Number of dedup keys currently cached.
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_completion(dir: &Path, subject: &str, payload: &Value) {
        let path = dir.join(format!("completion_summary_{}.json", subject));
        std::fs::write(path, serde_json::to_string_pretty(payload).unwrap()).unwrap();
    }

    fn index_for(subject: &str, workflow_id: &str, step: &str, agent: &str) -> SubjectIndex {
        let mut entries = HashMap::new();
        entries.insert(
            subject.to_string(),
            SubjectEntry {
                workflow_id: workflow_id.to_string(),
                running: vec![(step.to_string(), agent.to_string())],
            },
        );
        SubjectIndex { entries }
    }

    #[tokio::test]
    async fn file_source_parses_and_normalizes() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("tasks").join("completions");
        std::fs::create_dir_all(&nested).unwrap();
        write_completion(
            &nested,
            "42",
            &json!({
                "status": "complete",
                "agent_type": "triage",
                "summary": "classified as bug",
                "key_findings": ["severity high"],
                "next_agent": "design"
            }),
        );

        let source = FileSource::new(dir.path(), "completion_summary_{subject}.json").unwrap();
        let mut detector = CompletionDetector::new(vec![Box::new(source)], 16);
        let index = index_for("42", "wf-1", "triage", "triage");

        let events = detector.scan(&index).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.workflow_id, "wf-1");
        assert_eq!(event.step_id, "triage");
        assert_eq!(event.status, CompletionStatus::Complete);
        assert_eq!(event.summary, "classified as bug");
        assert_eq!(event.key_findings, vec!["severity high".to_string()]);
        assert_eq!(event.next_agent.as_deref(), Some("design"));
        assert_eq!(event.dedup_key, "42:triage:complete");
    }

    #[tokio::test]
    async fn unknown_subject_is_skipped_and_retried() {
        let dir = tempdir().unwrap();
        write_completion(
            dir.path(),
            "7",
            &json!({"status": "complete", "agent_type": "triage"}),
        );

        let source = FileSource::new(dir.path(), "completion_summary_{subject}.json").unwrap();
        let mut detector = CompletionDetector::new(vec![Box::new(source)], 16);

        let events = detector.scan(&SubjectIndex::default()).await;
        assert!(events.is_empty());

        // Once the workflow appears, the same file is picked up.
        let index = index_for("7", "wf-7", "triage", "triage");
        let events = detector.scan(&index).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn stale_agent_completion_is_dropped() {
        let dir = tempdir().unwrap();
        write_completion(
            dir.path(),
            "7",
            &json!({"status": "complete", "agent_type": "summarizer"}),
        );

        let source = FileSource::new(dir.path(), "completion_summary_{subject}.json").unwrap();
        let mut detector = CompletionDetector::new(vec![Box::new(source)], 16);
        let index = index_for("7", "wf-7", "triage", "triage");

        let events = detector.scan(&index).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn intake_source_drains_queue() {
        let (queue, source) = intake_channel(8);
        queue
            .submit(json!({
                "issue_number": "9",
                "agent_type": "developer",
                "status": "blocked",
                "summary": "cannot reach registry"
            }))
            .await
            .unwrap();

        let mut detector = CompletionDetector::new(vec![Box::new(source)], 16);
        let index = index_for("9", "wf-9", "implement", "developer");
        let events = detector.scan(&index).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, CompletionStatus::Blocked);
        assert_eq!(events[0].dedup_key, "9:developer:blocked");

        // Queue is drained; nothing on the second scan.
        let events = detector.scan(&index).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn malformed_payloads_are_ignored() {
        let dir = tempdir().unwrap();
        write_completion(dir.path(), "1", &json!({"status": "nonsense"}));
        write_completion(dir.path(), "2", &json!({"status": "complete"}));
        std::fs::write(
            dir.path().join("completion_summary_3.json"),
            "not valid json",
        )
        .unwrap();

        let source = FileSource::new(dir.path(), "completion_summary_{subject}.json").unwrap();
        let mut detector = CompletionDetector::new(vec![Box::new(source)], 16);
        let index = index_for("1", "wf-1", "triage", "triage");
        let events = detector.scan(&index).await;
        assert!(events.is_empty());
    }

    #[test]
    fn dedup_cache_is_bounded() {
        let mut cache = DedupCache::new(3);
        for i in 0..5 {
            cache.insert(&format!("key-{}", i));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("key-0"));
        assert!(!cache.contains("key-1"));
        assert!(cache.contains("key-4"));
    }
}
