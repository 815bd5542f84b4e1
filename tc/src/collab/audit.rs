//! Audit records and sinks
//!
//! Recording is fire-and-forget: a sink never blocks the caller and never
//! reports failure back into the kernel. `JsonlAuditSink` hands records to a
//! background writer task that appends one JSON object per line.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::domain::{Budget, CellId, ConflictReport};

/// Why one subtask slot ended without an accepted result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlotFailure {
    pub subtask: String,
    pub category: String,
    pub reason: String,
}

/// Summary of one delegation episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EpisodeRecord {
    pub cell_id: CellId,
    pub task_id: String,
    pub rounds: u32,
    pub accepted: Vec<String>,
    pub failed: Vec<SlotFailure>,
    pub conflicts: usize,
    pub degraded: bool,
    pub confidence: Option<f64>,
    pub finished_at: DateTime<Utc>,
}

/// Summary of one `submit` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionRecord {
    pub root: CellId,
    pub task_id: String,
    pub budget: Budget,
    pub spent: Budget,
    pub surplus: Budget,
    pub outcome: String,
    pub degraded: bool,
    pub finished_at: DateTime<Utc>,
}

/// Everything the kernel hands to an audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
pub enum AuditRecord {
    Episode(EpisodeRecord),
    Conflict(ConflictReport),
    Submission(SubmissionRecord),
}

impl AuditRecord {
    pub fn record_type(&self) -> &'static str {
        match self {
            Self::Episode(_) => "episode",
            Self::Conflict(_) => "conflict",
            Self::Submission(_) => "submission",
        }
    }
}

/// Durable destination for audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, record: AuditRecord) {
        debug!(record_type = record.record_type(), "NullAuditSink::record: dropped");
    }
}

/// Keeps records in memory for inspection
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/// Appends records as JSON lines from a background task
pub struct JsonlAuditSink {
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<AuditRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlAuditSink {
    /// Open (or create) `path` and start the writer task; must be called inside a runtime
    pub fn spawn(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "JsonlAuditSink::spawn: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context(format!("Failed to create audit directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open audit log {}", path.display()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let log_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            while let Some(record) = rx.recv().await {
                let line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "JsonlAuditSink: failed to serialize record");
                        continue;
                    }
                };
                if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
                    error!(path = %log_path.display(), error = %e, "JsonlAuditSink: failed to write record");
                }
            }
            let _ = out.flush();
            debug!("JsonlAuditSink: writer finished");
        });

        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting records and wait for everything queued to hit disk
    pub async fn close(&self) {
        debug!("JsonlAuditSink::close: called");
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            warn!(error = %e, "JsonlAuditSink: writer task ended abnormally");
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: AuditRecord) {
        debug!(record_type = record.record_type(), "JsonlAuditSink::record: called");
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(record).is_err() {
                    warn!("JsonlAuditSink: writer gone, record dropped");
                }
            }
            None => warn!("JsonlAuditSink: closed, record dropped"),
        }
    }
}

/// Read every record from an audit log
pub fn read_audit_log(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
    let path = path.as_ref();
    debug!(?path, "read_audit_log: called");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context(format!("Failed to read audit log {}", path.display()))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(n, line)| serde_json::from_str(line).context(format!("Bad audit record on line {}", n + 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn submission(task: &str) -> AuditRecord {
        AuditRecord::Submission(SubmissionRecord {
            root: CellId::from_string("abc123-cell-root"),
            task_id: task.to_string(),
            budget: Budget::from_units(100.0),
            spent: Budget::from_units(40.0),
            surplus: Budget::from_units(60.0),
            outcome: "result".to_string(),
            degraded: false,
            finished_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_jsonl_sink_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit").join("audit.jsonl");
        let sink = JsonlAuditSink::spawn(&path).unwrap();

        sink.record(submission("first"));
        sink.record(submission("second"));
        sink.close().await;

        let records = read_audit_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        match &records[1] {
            AuditRecord::Submission(s) => assert_eq!(s.task_id, "second"),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_record_after_close_is_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.jsonl");
        let sink = JsonlAuditSink::spawn(&path).unwrap();
        sink.close().await;
        sink.record(submission("late"));
        assert!(read_audit_log(&path).unwrap().is_empty());
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_audit_log(temp.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryAuditSink::new();
        sink.record(submission("x"));
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].record_type(), "submission");
    }

    #[test]
    fn test_record_tagging() {
        let json = serde_json::to_value(submission("x")).unwrap();
        assert_eq!(json["record"], "submission");
        assert_eq!(json["task-id"], "x");
    }
}
