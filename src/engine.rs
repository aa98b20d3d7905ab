//! The service object producers talk to. Built once from an [`EngineConfig`]
//! and shared; every component hangs off it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock;
use crate::config::{EngineConfig, ProjectConfig, UserMemory, DEFAULT_MAX_COMMITS, DEFAULT_README_CHARS};
use crate::context::{ContextGenerator, UnifiedContext};
use crate::document_store::{DocumentStore, StoreOptions};
use crate::error::{LayoutError, ReadOutcome};
use crate::events::{self, EventEntry};
use crate::history::{CommitHistory, CommitRecord, HistoryStore};
use crate::indexer::{Indexer, SyncReport};
use crate::layout::{ProjectLayout, Workspace};
use crate::maintenance::{Maintenance, MaintenanceReport};
use crate::memory::{self, ActionKind, ProjectMemory, SemanticContext};
use crate::snapshot::{self, Snapshot, SnapshotUpdate};
use crate::vcs::{CommitLogSource, GitCli};

/// One finished script run as written to `logs/run_<stamp>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRecord {
    pub script_path: String,
    pub status: String,
    pub returncode: i64,
    pub runtime: f64,
    pub summary: String,
    pub error_keywords: Vec<String>,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub git_commit: Option<String>,
    pub task_context: Option<String>,
    pub timestamp: String,
    pub project: String,
}

pub struct Engine {
    config: EngineConfig,
    workspace: Workspace,
    store: Arc<DocumentStore>,
    history: Arc<HistoryStore>,
    indexer: Arc<Indexer>,
    generator: ContextGenerator,
    maintenance: Maintenance,
}

impl Engine {
    /// Engine reading commits through the `git` binary.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_commit_source(config, Arc::new(GitCli))
    }

    pub fn with_commit_source(config: EngineConfig, vcs: Arc<dyn CommitLogSource>) -> Result<Self> {
        fs::create_dir_all(&config.projects_root).with_context(|| {
            format!("Failed to create projects root {}", config.projects_root.display())
        })?;
        let workspace = Workspace::new(config.projects_root.clone(), config.state_dir.clone());
        let store = Arc::new(DocumentStore::new(
            workspace.root(),
            StoreOptions {
                durability: config.durability,
                backups_keep: config.backups_keep,
                restore_from_backup: config.restore_from_backup,
            },
        ));
        let history = Arc::new(HistoryStore::new(store.clone(), vcs));
        let indexer = Arc::new(Indexer::new(config.index.clone()));
        let generator = ContextGenerator::new(store.clone(), history.clone(), indexer.clone());
        let maintenance = Maintenance::new(
            workspace.clone(),
            store.clone(),
            history.clone(),
            indexer.clone(),
            config.limits.clone(),
        );
        tracing::debug!(root = %workspace.root().display(), "engine ready");
        Ok(Self {
            config,
            workspace,
            store,
            history,
            indexer,
            generator,
            maintenance,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub fn layout(&self, project: &str) -> Result<ProjectLayout> {
        Ok(self.workspace.existing_project(project)?)
    }

    // ── Projects ─────────────────────────────────────────────────────────────

    /// Create the project directory (if needed) and its initial state
    /// documents. Fails when the project already has a state directory.
    pub fn create_project(&self, name: &str, description: &str) -> Result<ProjectLayout> {
        let layout = self.workspace.project(name)?;
        if layout.state_dir().exists() {
            return Err(LayoutError::ProjectExists(name.to_string()).into());
        }
        fs::create_dir_all(layout.state_dir())
            .with_context(|| format!("Failed to create {}", layout.state_dir().display()))?;

        memory::save(&self.store, &layout, &ProjectMemory::new(name, description))?;
        self.store
            .write(&layout.snapshot(), &Snapshot::for_project(name), false)?;
        let config = json!({
            "readme_chars": DEFAULT_README_CHARS,
            "commit_history": { "max_commits": DEFAULT_MAX_COMMITS },
            "memory": {
                "max_entries": self.config.limits.memory_max_entries,
                "max_size_mb": self.config.limits.memory_max_size_mb,
            },
        });
        self.store.write(&layout.config(), &config, false)?;

        if self.indexer.enabled() {
            if let Err(err) = self.indexer.init(&layout) {
                tracing::warn!(project = name, error = %err, "index init failed");
            }
        }
        tracing::info!(project = name, "project created");
        Ok(layout)
    }

    /// Move the project to `<root>/.archive/<name>_<stamp>/`. Nothing is deleted.
    pub fn archive_project(&self, name: &str) -> Result<PathBuf> {
        let layout = self.layout(name)?;
        let archive_root = self.workspace.archive_root();
        let target = archive_root.join(format!("{name}_{}", clock::file_stamp()));
        self.store.exclusive(|_| {
            fs::create_dir_all(&archive_root)
                .with_context(|| format!("Failed to create {}", archive_root.display()))?;
            fs::rename(layout.dir(), &target)
                .with_context(|| format!("Failed to archive {} to {}", name, target.display()))
        })?;
        tracing::info!(project = name, target = %target.display(), "project archived");
        Ok(target)
    }

    pub fn list_projects(&self) -> Result<Vec<String>> {
        self.workspace.list_projects()
    }

    pub fn project_config(&self, project: &str) -> Result<ProjectConfig> {
        let layout = self.layout(project)?;
        Ok(self.store.read(&layout.config(), ProjectConfig::default).into_value())
    }

    pub fn set_config_value(&self, project: &str, key: &str, value: Value) -> Result<()> {
        let layout = self.layout(project)?;
        self.store.update(
            &layout.config(),
            true,
            ProjectConfig::default,
            |config: &mut ProjectConfig, _| {
                config.set(key, value);
                Ok(())
            },
        )
    }

    /// Replace the user's notes, lifted into the unified context as `user_memory`.
    pub fn set_user_memory(&self, project: &str, notes: &str) -> Result<UserMemory> {
        let layout = self.layout(project)?;
        self.store.update(
            &layout.config(),
            true,
            ProjectConfig::default,
            |config: &mut ProjectConfig, _| {
                let memory = UserMemory {
                    notes: notes.to_string(),
                    last_updated: Some(clock::now_rfc3339()),
                };
                config.set_user_memory(&memory)?;
                Ok(memory)
            },
        )
    }

    // ── Memory ───────────────────────────────────────────────────────────────

    pub fn memory(&self, project: &str) -> Result<ReadOutcome<ProjectMemory>> {
        let layout = self.layout(project)?;
        Ok(memory::load(&self.store, &layout))
    }

    /// Append to the action log. An oversized memory file is trimmed right after.
    pub fn record_action(
        &self,
        project: &str,
        kind: &ActionKind,
        description: &str,
        extra: Option<Value>,
    ) -> Result<ProjectMemory> {
        let layout = self.layout(project)?;
        let memory = memory::record_action(
            &self.store,
            &layout,
            kind,
            description,
            extra,
            self.config.limits.action_log_cap,
        )?;
        match self.maintenance.after_memory_write(&layout) {
            Ok(0) => Ok(memory),
            Ok(_) => Ok(memory::load(&self.store, &layout).into_value()),
            Err(err) => {
                tracing::warn!(project, error = %err, "memory trim failed");
                Ok(memory)
            }
        }
    }

    pub fn set_semantic_context(&self, project: &str, context: SemanticContext) -> Result<()> {
        let layout = self.layout(project)?;
        memory::set_semantic_context(&self.store, &layout, context)
    }

    // ── Commits ──────────────────────────────────────────────────────────────

    /// Append a commit as the new history head, then mark the snapshot clean,
    /// log a `commit` event and count the action.
    pub fn append_commit(&self, project: &str, record: CommitRecord) -> Result<CommitRecord> {
        let layout = self.layout(project)?;
        let record = self.history.append_commit(&layout, record)?;

        if let Err(err) = snapshot::update(&self.store, &layout, SnapshotUpdate::commit(&record.commit_id)) {
            tracing::warn!(project, error = %err, "snapshot update after commit failed");
        }
        let details = json!({
            "commit_id": record.commit_id,
            "summary": record.summary,
            "files_changed": record.files_changed,
        });
        if let Err(err) = self.log_event(project, "commit", details) {
            tracing::warn!(project, error = %err, "commit event not logged");
        }
        let extra = json!({ "commit_id": record.commit_id, "major": record.is_major() });
        if let Err(err) = self.record_action(project, &ActionKind::Commit, &record.summary, Some(extra)) {
            tracing::warn!(project, error = %err, "commit action not recorded");
        }
        Ok(record)
    }

    /// Capture the repository head (with file previews) and append it.
    /// `Ok(None)` when the project has no commits.
    pub fn capture_head_commit(&self, project: &str) -> Result<Option<CommitRecord>> {
        let layout = self.layout(project)?;
        let head = self
            .history
            .commit_source()
            .recent(layout.dir(), 1)?
            .into_iter()
            .next();
        match head {
            Some(commit) => {
                let record = CommitRecord::capture(&layout, &commit);
                self.append_commit(project, record).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn commit_history(&self, project: &str) -> Result<CommitHistory> {
        let layout = self.layout(project)?;
        Ok(self.history.load(&layout))
    }

    pub fn sync_history(&self, project: &str) -> Result<bool> {
        let layout = self.layout(project)?;
        self.history.sync_from_external_log(&layout)
    }

    pub fn migrate_legacy_history(&self, project: &str) -> Result<Option<CommitHistory>> {
        let layout = self.layout(project)?;
        self.history.migrate_legacy(&layout)
    }

    // ── Snapshot, events, runs ───────────────────────────────────────────────

    pub fn snapshot(&self, project: &str) -> Result<Snapshot> {
        let layout = self.layout(project)?;
        Ok(snapshot::load(&self.store, &layout).into_value())
    }

    pub fn update_snapshot(&self, project: &str, update: SnapshotUpdate) -> Result<Snapshot> {
        let layout = self.layout(project)?;
        snapshot::update(&self.store, &layout, update)
    }

    /// Append to `events.log`, mirror the line and rotate the log if it outgrew its limit.
    pub fn log_event(&self, project: &str, kind: &str, details: Value) -> Result<EventEntry> {
        let layout = self.layout(project)?;
        let (entry, line) = events::log_event(&self.store, &layout, kind, details)?;
        if self.indexer.enabled() {
            if let Err(err) = self.indexer.index_event_line(&layout, &line) {
                tracing::warn!(project, error = %err, "event not indexed");
            }
        }
        if let Err(err) = self.maintenance.after_event_append(&layout) {
            tracing::warn!(project, error = %err, "events.log rotation failed");
        }
        Ok(entry)
    }

    pub fn recent_events(&self, project: &str, n: usize) -> Result<Vec<EventEntry>> {
        let layout = self.layout(project)?;
        events::recent_events(&layout.events_log(), n)
    }

    /// Persist a run log, mirror its metadata, and fold it into the snapshot,
    /// the event stream and the action log.
    pub fn record_run(&self, project: &str, mut run: RunRecord) -> Result<PathBuf> {
        let layout = self.layout(project)?;
        if run.timestamp.is_empty() {
            run.timestamp = clock::now_rfc3339();
        }
        if run.project.is_empty() {
            run.project = project.to_string();
        }
        if run.status.is_empty() {
            run.status = if run.returncode == 0 { "success" } else { "failed" }.to_string();
        }
        let path = layout.logs_dir().join(format!("run_{}.json", clock::file_stamp()));
        self.store.write(&path, &run, false)?;

        if self.indexer.enabled() {
            if let Err(err) = self.indexer.index_run(&layout, &path) {
                tracing::warn!(project, error = %err, "run not indexed");
            }
        }
        let log_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let update = SnapshotUpdate {
            last_logs: Some(vec![log_name.clone()]),
            ..SnapshotUpdate::run(&run.script_path, &run.status)
        };
        if let Err(err) = snapshot::update(&self.store, &layout, update) {
            tracing::warn!(project, error = %err, "snapshot update after run failed");
        }
        let details = json!({
            "script": run.script_path,
            "status": run.status,
            "returncode": run.returncode,
            "log": log_name,
        });
        if let Err(err) = self.log_event(project, "run", details) {
            tracing::warn!(project, error = %err, "run event not logged");
        }
        let description = if run.summary.is_empty() {
            format!("run {}", run.script_path)
        } else {
            run.summary.clone()
        };
        let extra = json!({ "status": run.status, "script": run.script_path });
        if let Err(err) = self.record_action(project, &ActionKind::Execute, &description, Some(extra)) {
            tracing::warn!(project, error = %err, "run action not recorded");
        }
        Ok(path)
    }

    // ── Context, index, maintenance ──────────────────────────────────────────

    /// Always returns a document; see [`UnifiedContext::error`].
    pub fn generate_context(&self, project: &str) -> UnifiedContext {
        match self.workspace.project(project) {
            Ok(layout) => self.generator.generate(&layout),
            Err(err) => UnifiedContext::failed(project, &anyhow::Error::from(err)),
        }
    }

    pub fn sync_index(&self, project: &str, force: bool) -> Result<SyncReport> {
        let layout = self.layout(project)?;
        self.indexer.sync(&layout, force)
    }

    /// Rotate an arbitrary line log under the store lock. Rotating a
    /// project's `events.log` marks it for a full index resync.
    pub fn maintain(&self, path: &Path, max_size_mb: f64, max_entries: usize) -> Result<usize> {
        self.maintenance.maintain(path, max_size_mb, max_entries)
    }

    pub fn trim_memory(&self, project: &str) -> Result<usize> {
        let layout = self.layout(project)?;
        self.maintenance.trim_memory(&layout)
    }

    pub fn maintain_project(&self, project: &str) -> Result<MaintenanceReport> {
        let layout = self.layout(project)?;
        self.maintenance.maintain_project(&layout)
    }
}

// ── Async facade ─────────────────────────────────────────────────────────────

/// Cloneable handle running engine calls on tokio's blocking pool.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Engine>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .context("Blocking engine task panicked")?
    }

    pub async fn record_action(
        &self,
        project: String,
        kind: ActionKind,
        description: String,
        extra: Option<Value>,
    ) -> Result<ProjectMemory> {
        self.run_blocking(move |e| e.record_action(&project, &kind, &description, extra))
            .await
    }

    pub async fn append_commit(&self, project: String, record: CommitRecord) -> Result<CommitRecord> {
        self.run_blocking(move |e| e.append_commit(&project, record)).await
    }

    pub async fn commit_history(&self, project: String) -> Result<CommitHistory> {
        self.run_blocking(move |e| e.commit_history(&project)).await
    }

    pub async fn update_snapshot(&self, project: String, update: SnapshotUpdate) -> Result<Snapshot> {
        self.run_blocking(move |e| e.update_snapshot(&project, update)).await
    }

    pub async fn log_event(&self, project: String, kind: String, details: Value) -> Result<EventEntry> {
        self.run_blocking(move |e| e.log_event(&project, &kind, details)).await
    }

    pub async fn record_run(&self, project: String, run: RunRecord) -> Result<PathBuf> {
        self.run_blocking(move |e| e.record_run(&project, run)).await
    }

    /// Errs only when the blocking task itself failed.
    pub async fn generate_context(&self, project: String) -> Result<UnifiedContext> {
        self.run_blocking(move |e| Ok(e.generate_context(&project))).await
    }

    pub async fn sync_index(&self, project: String, force: bool) -> Result<SyncReport> {
        self.run_blocking(move |e| e.sync_index(&project, force)).await
    }

    pub async fn maintain_project(&self, project: String) -> Result<MaintenanceReport> {
        self.run_blocking(move |e| e.maintain_project(&project)).await
    }
}
