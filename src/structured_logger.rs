//! Structured JSONL audit logger.
//!
//! Audit events are appended as machine-parseable JSON lines with a
//! monotonic sequence number for ordering and an ISO 8601 timestamp with
//! microsecond precision. The log is append-only; terminal workflows keep
//! their full trail for later inspection.

use crate::model::AuditEvent;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A single log entry in JSONL format.
#[derive(Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number (unique within one process run).
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds.
    pub ts: String,
    /// The audit event payload.
    pub event: AuditEvent,
}

/// Append-only JSONL writer for audit events.
pub struct StructuredLogger {
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

impl StructuredLogger {
    /// Opens (or creates) the log file in append mode.
    pub fn open(log_path: &Path) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log dir: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open audit log: {}", log_path.display()))?;

        Ok(Self {
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path: log_path.to_path_buf(),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Appends one audit event as a single line. Thread-safe.
    pub fn append(&self, event: &AuditEvent) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            event: event.clone(),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Reads all audit events for one workflow, skipping unparseable lines.
pub fn read_events(log_path: &Path, workflow_id: &str) -> Result<Vec<AuditEvent>> {
    let file = match File::open(log_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read audit log: {}", log_path.display()));
        }
    };

    let reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut skipped = 0usize;
    for line in reader.lines().map_while(Result::ok) {
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) if entry.event.workflow_id == workflow_id => events.push(entry.event),
            Ok(_) => {}
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(
            "Skipped {} unparseable lines in audit log {}",
            skipped,
            log_path.display()
        );
    }
    Ok(events)
}
