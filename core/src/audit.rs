use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Ingest,
    Embed,
    Assign,
    Reassign,
    Score,
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Dropped,
    DeadLettered,
    Failed,
}

/// One drop, dead letter, reassignment or batch outcome. `sequence` is
/// stamped by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            sequence: 0,
            operation,
            outcome,
            recorded_at: Utc::now(),
            entity_id: None,
            error_kind: None,
            details: BTreeMap::new(),
        }
    }

    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink lock poisoned")]
    LockPoisoned,
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record {line} of {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for drop records, dead letters and reassignment history.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Keeps the most recent `retain` events in memory.
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    retain: usize,
    sequence: AtomicU64,
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::with_retention(100_000)
    }
}

impl InMemoryAuditSink {
    pub fn with_retention(retain: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            retain: retain.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        Ok(events.iter().cloned().collect())
    }

    pub fn count(&self, operation: AuditOperation, outcome: AuditOutcome) -> usize {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.operation == operation && e.outcome == outcome)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Retained events about one post, account or narrative, oldest first.
    pub fn history(&self, entity_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.entity_id.as_deref() == Some(entity_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        if events.len() == self.retain {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// Append-only JSON-lines file; doubles as the dead-letter log. Reopening
/// an existing file continues its sequence numbering.
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sequence: AtomicU64,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let last = if path.exists() {
            read_events(&path)?.last().map(|e| e.sequence).unwrap_or(0)
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sequence: AtomicU64::new(last),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every event recorded so far, in file order.
    pub fn replay(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let _guard = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
        read_events(&self.path)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        serde_json::to_writer(&mut *writer, &event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

fn read_events(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|source| AuditError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}
