use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::clock;
use crate::document_store::DocumentStore;
use crate::layout::ProjectLayout;

/// One line of `events.log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub details: Value,
}

impl EventEntry {
    pub fn new(kind: &str, details: Value) -> Self {
        Self {
            timestamp: clock::now_rfc3339(),
            kind: kind.to_string(),
            details,
        }
    }

    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode event")
    }
}

/// Append an event to the project's stream. Returns the entry and its line.
pub fn log_event(
    store: &DocumentStore,
    layout: &ProjectLayout,
    kind: &str,
    details: Value,
) -> Result<(EventEntry, String)> {
    let entry = EventEntry::new(kind, details);
    let line = entry.to_line()?;
    store.append_line(&layout.events_log(), &line)?;
    Ok((entry, line))
}

/// Every parseable event, oldest first. Malformed lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<EventEntry>> {
    Ok(read_lines(path)?
        .iter()
        .filter_map(|line| parse_line(line))
        .collect())
}

/// The newest `n` events, newest first.
pub fn recent_events(path: &Path, n: usize) -> Result<Vec<EventEntry>> {
    let mut events = read_events(path)?;
    events.reverse();
    events.truncate(n);
    Ok(events)
}

pub(crate) fn parse_line(line: &str) -> Option<EventEntry> {
    match serde_json::from_str::<EventEntry>(line) {
        Ok(entry) => Some(entry),
        Err(err) => {
            tracing::debug!(error = %err, "skipping malformed event line");
            None
        }
    }
}

/// Non-empty lines of a JSON-Lines file; a missing file has none.
pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("Failed to read {}", path.display())),
    };
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
