use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::limits::{MAX_REASON_LEN, MAX_RECENT_OVERRIDES};
use crate::model::{Ms, now_ms};

use super::conflict::ConflictSet;
use super::error::BookingError;

/// Who is pushing a write through despite conflicts, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub actor: String,
    pub reason: String,
}

impl Override {
    pub fn new(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub id: Ulid,
    pub actor: String,
    pub at: Ms,
    pub reason: String,
    pub operation: String,
    pub overridden: Vec<Ulid>,
}

/// Append-only record of conflict overrides, optionally mirrored to a
/// JSON-lines file. Only the most recent overrides stay in memory.
pub struct AuditLog {
    recent: Mutex<VecDeque<OverrideRecord>>,
    retain: usize,
    sink: Option<Mutex<File>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            retain: MAX_RECENT_OVERRIDES,
            sink: None,
        }
    }

    #[cfg(test)]
    fn retaining(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Load existing records from `path` and append new ones to it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut recent = VecDeque::new();
        match File::open(path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<OverrideRecord>(&line) {
                        Ok(record) => push_bounded(&mut recent, record, MAX_RECENT_OVERRIDES),
                        Err(e) => warn!("skipping unreadable audit line in {}: {e}", path.display()),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let sink = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            recent: Mutex::new(recent),
            retain: MAX_RECENT_OVERRIDES,
            sink: Some(Mutex::new(sink)),
        })
    }

    pub fn record(
        &self,
        operation: &str,
        by: &Override,
        conflicts: &ConflictSet,
    ) -> Result<OverrideRecord, BookingError> {
        if by.actor.trim().is_empty() {
            return Err(BookingError::validation("override needs an actor"));
        }
        if by.reason.trim().is_empty() {
            return Err(BookingError::validation("override needs a reason"));
        }
        if by.reason.len() > MAX_REASON_LEN {
            return Err(BookingError::LimitExceeded("override reason too long"));
        }

        let record = OverrideRecord {
            id: Ulid::new(),
            actor: by.actor.clone(),
            at: now_ms(),
            reason: by.reason.clone(),
            operation: operation.to_string(),
            overridden: conflicts.record_ids(),
        };
        let line = serde_json::to_string(&record).map_err(|e| BookingError::validation(e.to_string()))?;
        warn!("conflict override: {line}");
        metrics::counter!(crate::observability::OVERRIDES_TOTAL, "operation" => operation.to_string()).increment(1);

        if let Some(sink) = &self.sink {
            let mut file = sink.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                warn!("failed to persist override {}: {e}", record.id);
            }
        }
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut recent, record.clone(), self.retain);
        Ok(record)
    }

    /// Most recent overrides, oldest first.
    pub fn list(&self) -> Vec<OverrideRecord> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }
}

fn push_bounded(recent: &mut VecDeque<OverrideRecord>, record: OverrideRecord, retain: usize) {
    recent.push_back(record);
    while recent.len() > retain {
        recent.pop_front();
    }
}
