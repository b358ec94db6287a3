//! Audit trail for runner activity.
//!
//! Sinks receive one event per row lifecycle step and per store anomaly. The
//! in-memory sink is meant for tests and short runs; the JSON lines sink
//! appends to a file that survives restarts.

use std::collections::VecDeque;
use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::SchedulerError;
use crate::util::clock::now_ms;

/// Step recorded by an [`AuditEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Row scheduled for execution.
    Submit,
    /// Experiment started for the row.
    Start,
    /// Experiment finished, successfully or not.
    Finish,
    /// Metrics reported by the row.
    Report,
    /// A cell write was abandoned after lock contention.
    WriteDropped,
    /// A failed cell write was rolled back from its backup.
    WriteRestored,
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Row the event belongs to.
    pub row_id: String,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<Value>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// Bounded in-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a sink keeping at most `max_events`, dropping the oldest first.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events recorded with `action`.
    pub fn with_action(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Append-only JSON lines audit log.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlAuditSink {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every event stored at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, SchedulerError> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        BufReader::new(file)
            .lines()
            .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
            .map(|line| {
                let line = line?;
                serde_json::from_str(&line).map_err(SchedulerError::store)
            })
            .collect()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit event not serializable: {e}");
                return;
            }
        };
        if let Err(e) = writeln!(self.file.lock(), "{line}") {
            tracing::warn!("audit log {} write failed: {e}", self.path.display());
        }
    }
}

/// Helper to build an audit event stamped with the current time.
pub fn build_audit_event(
    row_id: impl Into<String>,
    action: AuditAction,
    payload: Option<Value>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        row_id: row_id.into(),
        action,
        created_at_ms: now_ms(),
        payload,
    }
}
