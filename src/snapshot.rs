use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock;
use crate::document_store::DocumentStore;
use crate::error::ReadOutcome;
use crate::layout::ProjectLayout;

pub const SNAPSHOT_VERSION: &str = "1.0";

/// `snapshot.json`: the latest known run/commit status. Last writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub version: String,
    pub project: String,
    pub last_commit: Option<String>,
    pub last_run: Option<String>,
    pub last_run_status: Option<String>,
    pub last_run_script: Option<String>,
    pub status: String,
    pub last_logs: Vec<String>,
    pub pending_changes: bool,
    pub snapshot_version: u64,
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            project: String::new(),
            last_commit: None,
            last_run: None,
            last_run_status: None,
            last_run_script: None,
            status: "unknown".to_string(),
            last_logs: Vec::new(),
            pending_changes: false,
            snapshot_version: 0,
            last_updated: None,
            extra: Map::new(),
        }
    }
}

/// Fields to overwrite; `None` leaves the current value.
#[derive(Debug, Clone, Default)]
pub struct SnapshotUpdate {
    pub last_commit: Option<String>,
    pub last_run: Option<String>,
    pub last_run_status: Option<String>,
    pub last_run_script: Option<String>,
    pub status: Option<String>,
    pub last_logs: Option<Vec<String>>,
    pub pending_changes: Option<bool>,
}

impl SnapshotUpdate {
    pub fn commit(short_id: &str) -> Self {
        Self {
            last_commit: Some(short_id.to_string()),
            pending_changes: Some(false),
            ..Self::default()
        }
    }

    /// A finished script run; `status` also becomes the project status.
    pub fn run(script: &str, status: &str) -> Self {
        Self {
            last_run: Some(clock::now_rfc3339()),
            last_run_status: Some(status.to_string()),
            last_run_script: Some(script.to_string()),
            status: Some(status.to_string()),
            ..Self::default()
        }
    }
}

impl Snapshot {
    pub fn for_project(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, update: SnapshotUpdate) {
        let SnapshotUpdate {
            last_commit,
            last_run,
            last_run_status,
            last_run_script,
            status,
            last_logs,
            pending_changes,
        } = update;
        if last_commit.is_some() {
            self.last_commit = last_commit;
        }
        if last_run.is_some() {
            self.last_run = last_run;
        }
        if last_run_status.is_some() {
            self.last_run_status = last_run_status;
        }
        if last_run_script.is_some() {
            self.last_run_script = last_run_script;
        }
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(logs) = last_logs {
            self.last_logs = logs;
        }
        if let Some(pending) = pending_changes {
            self.pending_changes = pending;
        }
        self.snapshot_version += 1;
        self.last_updated = Some(clock::now_rfc3339());
    }
}

pub fn load(store: &DocumentStore, layout: &ProjectLayout) -> ReadOutcome<Snapshot> {
    store.read(&layout.snapshot(), || Snapshot::for_project(layout.name()))
}

/// Merge `update` into the stored snapshot (backed up first) and return it.
pub fn update(store: &DocumentStore, layout: &ProjectLayout, update: SnapshotUpdate) -> Result<Snapshot> {
    store.update(
        &layout.snapshot(),
        true,
        || Snapshot::for_project(layout.name()),
        |snapshot: &mut Snapshot, _| {
            if snapshot.project.is_empty() {
                snapshot.project = layout.name().to_string();
            }
            snapshot.apply(update);
            Ok(snapshot.clone())
        },
    )
}
