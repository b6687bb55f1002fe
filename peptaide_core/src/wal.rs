//! Append-only administration event log.
//!
//! Events are appended to a JSONL (JSON Lines) file with file locking
//! to ensure safe concurrent access. Events are never rewritten: soft
//! delete and restore append marker lines that readers fold into
//! `deleted_at`. Lock acquisition gives up after the log's timeout with
//! [`Error::StorageTimeout`].

use crate::repository::EventStore;
use crate::state::{lock_with_timeout, DEFAULT_LOCK_TIMEOUT};
use crate::{AdministrationEvent, Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// One line of the event log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Recorded { event: Box<AdministrationEvent> },
    Deleted { event_id: Uuid, at: DateTime<Utc> },
    Restored { event_id: Uuid, at: DateTime<Utc> },
}

/// JSONL-backed event store with file locking
pub struct JsonlEventLog {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonlEventLog {
    /// Create a new event log for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override how long reads and appends wait for the file lock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("event log {:?}", self.path)
    }

    /// Read every entry under a shared lock
    pub fn read_entries(&self) -> Result<Vec<LogEntry>> {
        read_entries(&self.path, self.lock_timeout)
    }

    /// Read all events with delete/restore markers applied
    pub fn read_events(&self) -> Result<Vec<AdministrationEvent>> {
        read_events(&self.path, self.lock_timeout)
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        lock_with_timeout(&file, true, self.lock_timeout, &self.describe())?;

        let mut writer = std::io::BufWriter::new(&file);
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);
        file.sync_data()?;

        FileExt::unlock(&file)?;
        Ok(())
    }
}

impl EventStore for JsonlEventLog {
    fn append_event(&self, event: &AdministrationEvent) -> Result<()> {
        self.append_entries(&[LogEntry::Recorded {
            event: Box::new(event.clone()),
        }])?;
        tracing::debug!("Appended event {} to log", event.id);
        Ok(())
    }

    fn append_events(&self, events: &[AdministrationEvent]) -> Result<()> {
        let entries: Vec<LogEntry> = events
            .iter()
            .map(|e| LogEntry::Recorded {
                event: Box::new(e.clone()),
            })
            .collect();
        self.append_entries(&entries)?;
        tracing::debug!("Appended {} events to log", events.len());
        Ok(())
    }

    fn list_events(&self) -> Result<Vec<AdministrationEvent>> {
        self.read_events()
    }

    fn set_deleted(
        &self,
        event_id: Uuid,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Result<AdministrationEvent> {
        let mut event = self
            .read_events()?
            .into_iter()
            .find(|e| e.id == event_id)
            .ok_or_else(|| Error::NotFound(format!("event {}", event_id)))?;

        let entry = match deleted_at {
            Some(at) => LogEntry::Deleted { event_id, at },
            None => LogEntry::Restored {
                event_id,
                at: Utc::now(),
            },
        };
        self.append_entries(&[entry])?;

        event.deleted_at = deleted_at;
        tracing::info!(
            "Event {} {}",
            event_id,
            if deleted_at.is_some() { "deleted" } else { "restored" }
        );
        Ok(event)
    }
}

/// Read every log entry, skipping lines that fail to parse
pub fn read_entries(path: &Path, lock_timeout: Duration) -> Result<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    // Acquire shared lock for reading
    let what = format!("event log {:?}", path);
    lock_with_timeout(&file, false, lock_timeout, &what)?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Failed to parse log entry at line {}: {}", line_num + 1, e);
            }
        }
    }

    FileExt::unlock(&file)?;
    tracing::debug!("Read {} entries from event log", entries.len());
    Ok(entries)
}

/// Read all events with delete/restore markers applied, in log order
pub fn read_events(path: &Path, lock_timeout: Duration) -> Result<Vec<AdministrationEvent>> {
    let mut events: Vec<AdministrationEvent> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();

    for entry in read_entries(path, lock_timeout)? {
        match entry {
            LogEntry::Recorded { event } => {
                if index.contains_key(&event.id) {
                    tracing::warn!("Ignoring duplicate record for event {}", event.id);
                    continue;
                }
                index.insert(event.id, events.len());
                events.push(*event);
            }
            LogEntry::Deleted { event_id, at } => match index.get(&event_id) {
                Some(&i) => events[i].deleted_at = Some(at),
                None => tracing::warn!("Delete marker for unknown event {}", event_id),
            },
            LogEntry::Restored { event_id, .. } => match index.get(&event_id) {
                Some(&i) => events[i].deleted_at = None,
                None => tracing::warn!("Restore marker for unknown event {}", event_id),
            },
        }
    }

    Ok(events)
}
