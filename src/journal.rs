//! Append-only journal of tool invocations.
//!
//! One JSON object per line in `events.jsonl`. Records are never mutated or
//! deleted from within the core; the policy engine derives rate-limit
//! counts from window queries over this journal so limits survive restarts
//! and stay exact.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::timestamp::UnixTimestamp;

/// Terminal status of a journaled invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Denied,
    Error,
}

/// One tool invocation, request and response reduced to redacted digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub occurred_at: UnixTimestamp,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: EventStatus,
    pub request_digest: String,
    pub response_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

struct Inner {
    events: Vec<EventRecord>,
    writer: Option<BufWriter<fs::File>>,
}

/// The journal store. Appends go to memory and, when opened on disk, to the
/// backing JSONL file with an immediate flush.
pub struct EventJournal {
    inner: Mutex<Inner>,
}

impl EventJournal {
    /// Opens (or creates) the journal at `path`, loading existing records.
    ///
    /// A torn trailing line from a crash mid-append is skipped with a
    /// warning; everything before it is intact because records are
    /// framed per line.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut events = Vec::new();
        let mut torn_tail = false;
        match fs::read_to_string(path) {
            Ok(content) => {
                torn_tail = !content.is_empty() && !content.ends_with('\n');
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<EventRecord>(line) {
                        Ok(record) => events.push(record),
                        Err(e) => {
                            tracing::warn!(
                                path = %path.display(),
                                line = line_no + 1,
                                error = %e,
                                "skipping unreadable journal line"
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if torn_tail {
            // Close the torn line so the next append starts framed.
            writeln!(writer)?;
            writer.flush()?;
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                events,
                writer: Some(writer),
            }),
        })
    }

    /// A journal with no backing file, for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: Vec::new(),
                writer: None,
            }),
        }
    }

    /// Appends one record. The in-memory view and the file stay in step;
    /// file I/O failure is returned so the caller can log it, but the
    /// record is already visible to window queries.
    pub fn append(&self, record: EventRecord) -> std::io::Result<()> {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        let line = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        inner.events.push(record);
        if let Some(writer) = inner.writer.as_mut() {
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Counts records for `(tool, agent_id)` with
    /// `from <= occurred_at < until`.
    pub fn count_window(
        &self,
        tool: &str,
        agent_id: Option<&str>,
        from: UnixTimestamp,
        until: UnixTimestamp,
    ) -> usize {
        let inner = self.inner.lock().expect("journal lock poisoned");
        inner
            .events
            .iter()
            .filter(|e| {
                e.tool_name == tool
                    && e.agent_id.as_deref() == agent_id
                    && e.occurred_at >= from
                    && e.occurred_at < until
            })
            .count()
    }

    /// Most recent records first, optionally filtered, capped at `limit`.
    pub fn list_recent(
        &self,
        tool: Option<&str>,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Vec<EventRecord> {
        let inner = self.inner.lock().expect("journal lock poisoned");
        inner
            .events
            .iter()
            .rev()
            .filter(|e| tool.is_none_or(|t| e.tool_name == t))
            .filter(|e| agent_id.is_none_or(|a| e.agent_id.as_deref() == Some(a)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("journal lock poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
