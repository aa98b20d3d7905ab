//! SQLite mirror of a project's JSON state (`context.db`).
//!
//! The JSON documents stay authoritative. Rows here can always be rebuilt
//! from them, and the `sync_metadata` ledger records when a rebuild is owed.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

use crate::clock;
use crate::config::IndexConfig;
use crate::context::UnifiedContext;
use crate::events;
use crate::history::CommitRecord;
use crate::layout::{ProjectLayout, CONTEXT_FULL_FILE, EVENTS_LOG_FILE, RUN_LOGS_SOURCE};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Commits,
    Snapshots,
    Events,
    Runs,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Commits => "commits",
            Table::Snapshots => "snapshots",
            Table::Events => "events",
            Table::Runs => "runs",
        }
    }
}

/// A mirrored JSON source and the tables derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirroredSource {
    ContextFull,
    EventsLog,
    RunLogs,
}

impl MirroredSource {
    pub const ALL: [MirroredSource; 3] = [
        MirroredSource::ContextFull,
        MirroredSource::EventsLog,
        MirroredSource::RunLogs,
    ];

    /// Ledger key.
    pub fn file_name(self) -> &'static str {
        match self {
            MirroredSource::ContextFull => CONTEXT_FULL_FILE,
            MirroredSource::EventsLog => EVENTS_LOG_FILE,
            MirroredSource::RunLogs => RUN_LOGS_SOURCE,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.file_name() == name)
    }

    fn tables(self) -> &'static [Table] {
        match self {
            MirroredSource::ContextFull => &[Table::Commits, Table::Snapshots],
            MirroredSource::EventsLog => &[Table::Events],
            MirroredSource::RunLogs => &[Table::Runs],
        }
    }

    fn exists(self, layout: &ProjectLayout) -> bool {
        match self {
            MirroredSource::ContextFull => layout.context_full().is_file(),
            MirroredSource::EventsLog => layout.events_log().is_file(),
            MirroredSource::RunLogs => !layout.run_logs().is_empty(),
        }
    }

    /// Latest modification time of the source, RFC 3339.
    fn modified(self, layout: &ProjectLayout) -> Option<String> {
        let paths = match self {
            MirroredSource::ContextFull => vec![layout.context_full()],
            MirroredSource::EventsLog => vec![layout.events_log()],
            MirroredSource::RunLogs => layout.run_logs(),
        };
        paths
            .iter()
            .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
            .max()
            .map(|t| clock::format_rfc3339(DateTime::<Utc>::from(t)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Project rows deleted and rebuilt from the source.
    Full,
    /// Source re-ingested over existing rows; natural keys dedupe.
    Incremental,
    /// Nothing to ingest.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSync {
    pub file_name: String,
    pub mode: SyncMode,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub sources: Vec<SourceSync>,
}

impl SyncReport {
    pub fn mode_for(&self, file_name: &str) -> Option<SyncMode> {
        self.sources
            .iter()
            .find(|s| s.file_name == file_name)
            .map(|s| s.mode)
    }

    pub fn has_errors(&self) -> bool {
        self.sources.iter().any(|s| s.error.is_some())
    }
}

/// One row of the `sync_metadata` ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetadata {
    pub file_name: String,
    pub last_json_modified: Option<String>,
    pub last_synced_at: Option<String>,
    pub last_trimmed_at: Option<String>,
    pub row_count_before_trim: Option<i64>,
    pub row_count_after_trim: Option<i64>,
    pub sync_status: String,
    pub error_message: Option<String>,
}

impl SyncMetadata {
    /// A trim newer than the last sync (or a pending mark) owes a full rebuild.
    pub fn needs_full_resync(&self) -> bool {
        if self.sync_status == "pending" {
            return true;
        }
        match (&self.last_trimmed_at, &self.last_synced_at) {
            (Some(_), None) => true,
            (Some(trimmed), Some(synced)) => {
                match (clock::parse_timestamp(trimmed), clock::parse_timestamp(synced)) {
                    (Some(t), Some(s)) => t > s,
                    _ => trimmed > synced,
                }
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub commits: usize,
    pub snapshots: usize,
}

// ── Indexer ──────────────────────────────────────────────────────────────────

/// Opens a connection per call; nothing is cached between calls.
pub struct Indexer {
    config: IndexConfig,
}

impl Indexer {
    pub fn new(config: IndexConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Create or verify the schema. Fails with `IndexError::SchemaMismatch`
    /// when the database was written by another schema version.
    pub fn init(&self, layout: &ProjectLayout) -> Result<()> {
        with_retry(self.config.max_retries, || self.open(layout).map(|_| ()))
    }

    /// Mirror a generated context: the head commit replaces its row, older
    /// commits are inserted only if absent, the snapshot replaces by project.
    pub fn index(&self, layout: &ProjectLayout, context: &UnifiedContext) -> Result<IndexStats> {
        if !self.enabled() {
            return Ok(IndexStats::default());
        }
        with_retry(self.config.max_retries, || {
            let mut conn = self.open(layout)?;
            let tx = conn.transaction().context("Failed to begin index transaction")?;
            let stats = index_context(&tx, layout.name(), context)?;
            tx.commit().context("Failed to commit index transaction")?;
            Ok(stats)
        })
    }

    /// Mirror one `events.log` line. Returns false for duplicates and malformed lines.
    pub fn index_event_line(&self, layout: &ProjectLayout, line: &str) -> Result<bool> {
        if !self.enabled() {
            return Ok(false);
        }
        with_retry(self.config.max_retries, || {
            let conn = self.open(layout)?;
            insert_event(&conn, layout.name(), line)
        })
    }

    /// Mirror one run log's metadata. Output streams are never stored.
    pub fn index_run(&self, layout: &ProjectLayout, path: &Path) -> Result<bool> {
        if !self.enabled() {
            return Ok(false);
        }
        with_retry(self.config.max_retries, || {
            let conn = self.open(layout)?;
            insert_run(&conn, layout.name(), path)
        })
    }

    /// Bring every mirrored source up to date. Sources whose ledger owes a
    /// rebuild (or all of them when `force`) are rebuilt from scratch.
    pub fn sync(&self, layout: &ProjectLayout, force: bool) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !self.enabled() {
            report.sources = MirroredSource::ALL
                .iter()
                .map(|s| SourceSync {
                    file_name: s.file_name().to_string(),
                    mode: SyncMode::Skipped,
                    rows: 0,
                    error: None,
                })
                .collect();
            return Ok(report);
        }
        self.init(layout)?;

        for source in MirroredSource::ALL {
            let outcome = with_retry(self.config.max_retries, || self.sync_source(layout, source, force));
            match outcome {
                Ok(synced) => {
                    tracing::debug!(project = layout.name(), source = source.file_name(), mode = ?synced.mode, rows = synced.rows, "source synced");
                    report.sources.push(synced);
                }
                Err(err) => {
                    tracing::warn!(project = layout.name(), source = source.file_name(), error = %err, "source sync failed");
                    if let Err(mark_err) = self.mark_error(layout, source.file_name(), &err.to_string()) {
                        tracing::debug!(error = %mark_err, "failed to record sync error");
                    }
                    report.sources.push(SourceSync {
                        file_name: source.file_name().to_string(),
                        mode: SyncMode::Skipped,
                        rows: 0,
                        error: Some(format!("{err:#}")),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Note that `file_name` was trimmed, so the next sync rebuilds it.
    pub fn record_trim(&self, layout: &ProjectLayout, file_name: &str, before: i64, after: i64) -> Result<()> {
        with_retry(self.config.max_retries, || {
            let conn = self.open(layout)?;
            conn.execute(
                "INSERT INTO sync_metadata
                    (file_name, last_trimmed_at, row_count_before_trim, row_count_after_trim, sync_status)
                 VALUES (?1, ?2, ?3, ?4, 'pending')
                 ON CONFLICT(file_name) DO UPDATE SET
                    last_trimmed_at = excluded.last_trimmed_at,
                    row_count_before_trim = excluded.row_count_before_trim,
                    row_count_after_trim = excluded.row_count_after_trim,
                    sync_status = 'pending'",
                params![file_name, clock::now_rfc3339(), before, after],
            )
            .context("Failed to record trim in sync ledger")?;
            Ok(())
        })?;
        tracing::info!(project = layout.name(), file = file_name, before, after, "trim recorded, full resync pending");
        Ok(())
    }

    pub fn sync_state(&self, layout: &ProjectLayout, file_name: &str) -> Result<Option<SyncMetadata>> {
        with_retry(self.config.max_retries, || {
            let conn = self.open(layout)?;
            read_ledger(&conn, file_name)
        })
    }

    pub fn row_count(&self, layout: &ProjectLayout, table: Table) -> Result<i64> {
        with_retry(self.config.max_retries, || {
            let conn = self.open(layout)?;
            let sql = format!("SELECT COUNT(*) FROM {} WHERE project = ?1", table.as_str());
            conn.query_row(&sql, params![layout.name()], |row| row.get(0))
                .with_context(|| format!("Failed to count {}", table.as_str()))
        })
    }

    fn open(&self, layout: &ProjectLayout) -> Result<Connection> {
        let path = layout.index_db();
        fs::create_dir_all(layout.state_dir()).with_context(|| {
            format!("Failed to create state directory {}", layout.state_dir().display())
        })?;
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open context.db at {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))
            .context("Failed to set context.db busy timeout")?;
        schema::check_version(&conn, &path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )
        .context("Failed to configure context.db connection")?;
        schema::ensure_schema(&conn, &path)?;
        Ok(conn)
    }

    fn sync_source(&self, layout: &ProjectLayout, source: MirroredSource, force: bool) -> Result<SourceSync> {
        let mut conn = self.open(layout)?;
        let ledger = read_ledger(&conn, source.file_name())?;
        let full = force || ledger.as_ref().is_some_and(SyncMetadata::needs_full_resync);

        if !full && !source.exists(layout) {
            return Ok(SourceSync {
                file_name: source.file_name().to_string(),
                mode: SyncMode::Skipped,
                rows: 0,
                error: None,
            });
        }

        let tx = conn.transaction().context("Failed to begin sync transaction")?;
        if full {
            for table in source.tables() {
                tx.execute(
                    &format!("DELETE FROM {} WHERE project = ?1", table.as_str()),
                    params![layout.name()],
                )
                .with_context(|| format!("Failed to clear {}", table.as_str()))?;
            }
        }
        let rows = ingest(&tx, layout, source)?;
        tx.execute(
            "INSERT INTO sync_metadata (file_name, last_json_modified, last_synced_at, sync_status, error_message)
             VALUES (?1, ?2, ?3, 'synced', NULL)
             ON CONFLICT(file_name) DO UPDATE SET
                last_json_modified = excluded.last_json_modified,
                last_synced_at = excluded.last_synced_at,
                sync_status = 'synced',
                error_message = NULL",
            params![source.file_name(), source.modified(layout), clock::now_rfc3339()],
        )
        .context("Failed to update sync ledger")?;
        tx.commit().context("Failed to commit sync transaction")?;

        Ok(SourceSync {
            file_name: source.file_name().to_string(),
            mode: if full { SyncMode::Full } else { SyncMode::Incremental },
            rows,
            error: None,
        })
    }

    fn mark_error(&self, layout: &ProjectLayout, file_name: &str, message: &str) -> Result<()> {
        let conn = self.open(layout)?;
        conn.execute(
            "INSERT INTO sync_metadata (file_name, sync_status, error_message) VALUES (?1, 'error', ?2)
             ON CONFLICT(file_name) DO UPDATE SET sync_status = 'error', error_message = excluded.error_message",
            params![file_name, message],
        )
        .context("Failed to record sync error")?;
        Ok(())
    }
}

// ── SQLite helpers ───────────────────────────────────────────────────────────

/// Retry `op` while SQLite reports the database as locked (100, 200, 400ms ...).
pub(crate) fn with_retry<T, F: Fn() -> Result<T>>(max_retries: u32, op: F) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(val) => return Ok(val),
            Err(e) => {
                let is_busy = e
                    .chain()
                    .any(|cause| cause.to_string().contains("database is locked"));
                if !is_busy || attempt >= max_retries {
                    return Err(e);
                }
                attempt += 1;
                let backoff_ms = 100 * (1u64 << (attempt - 1));
                tracing::debug!(attempt, backoff_ms, "context.db busy, retrying");
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
        }
    }
}

fn read_ledger(conn: &Connection, file_name: &str) -> Result<Option<SyncMetadata>> {
    conn.query_row(
        "SELECT file_name, last_json_modified, last_synced_at, last_trimmed_at,
                row_count_before_trim, row_count_after_trim, sync_status, error_message
         FROM sync_metadata WHERE file_name = ?1",
        params![file_name],
        |row| {
            Ok(SyncMetadata {
                file_name: row.get(0)?,
                last_json_modified: row.get(1)?,
                last_synced_at: row.get(2)?,
                last_trimmed_at: row.get(3)?,
                row_count_before_trim: row.get(4)?,
                row_count_after_trim: row.get(5)?,
                sync_status: row.get(6)?,
                error_message: row.get(7)?,
            })
        },
    )
    .optional()
    .context("Failed to read sync ledger")
}

fn ingest(tx: &Transaction<'_>, layout: &ProjectLayout, source: MirroredSource) -> Result<usize> {
    match source {
        MirroredSource::ContextFull => {
            let path = layout.context_full();
            if !path.is_file() {
                return Ok(0);
            }
            let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let context: UnifiedContext = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            let stats = index_context(tx, layout.name(), &context)?;
            Ok(stats.commits + stats.snapshots)
        }
        MirroredSource::EventsLog => {
            let mut rows = 0;
            for line in events::read_lines(&layout.events_log())? {
                if insert_event(tx, layout.name(), &line)? {
                    rows += 1;
                }
            }
            Ok(rows)
        }
        MirroredSource::RunLogs => {
            let mut rows = 0;
            for path in layout.run_logs() {
                match insert_run(tx, layout.name(), &path) {
                    Ok(true) => rows += 1,
                    Ok(false) => {}
                    Err(err) => tracing::warn!(file = %path.display(), error = %err, "skipping run log"),
                }
            }
            Ok(rows)
        }
    }
}

fn index_context(conn: &Connection, project: &str, context: &UnifiedContext) -> Result<IndexStats> {
    let mut stats = IndexStats::default();
    if let Some(commits) = &context.commits {
        let head_hash = commits.last_commit.as_ref().map(commit_hash);
        if let Some(head) = &commits.last_commit {
            stats.commits += upsert_commit(conn, project, head, true)?;
        }
        for commit in &commits.recent {
            if Some(commit_hash(commit)) == head_hash {
                continue;
            }
            stats.commits += upsert_commit(conn, project, commit, false)?;
        }
    }
    if let Some(snapshot) = &context.snapshot {
        let metadata = json!({
            "generated_at": context.generated_at,
            "last_run_status": snapshot.last_run_status,
        });
        stats.snapshots += conn
            .execute(
                "INSERT OR REPLACE INTO snapshots
                    (project, timestamp, status, last_commit, last_run, pending_changes, snapshot_version, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    project,
                    context.generated_at,
                    snapshot.status,
                    snapshot.last_commit,
                    snapshot.last_run,
                    snapshot.pending_changes,
                    snapshot.snapshot_version as i64,
                    metadata.to_string(),
                ],
            )
            .context("Failed to index snapshot")?;
    }
    Ok(stats)
}

fn commit_hash(commit: &CommitRecord) -> String {
    if commit.commit_id_full.is_empty() {
        commit.commit_id.clone()
    } else {
        commit.commit_id_full.clone()
    }
}

fn upsert_commit(conn: &Connection, project: &str, commit: &CommitRecord, replace: bool) -> Result<usize> {
    let hash = commit_hash(commit);
    if hash.is_empty() {
        return Ok(0);
    }
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
    let metadata = json!({ "file_contexts": commit.file_contexts });
    conn.execute(
        &format!(
            "{verb} INTO commits
                (project, commit_hash, commit_id, summary, files_changed, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            project,
            hash,
            commit.commit_id,
            commit.summary,
            serde_json::to_string(&commit.files_changed)?,
            commit.timestamp,
            metadata.to_string(),
        ],
    )
    .with_context(|| format!("Failed to index commit {}", commit.commit_id))
}

fn insert_event(conn: &Connection, project: &str, line: &str) -> Result<bool> {
    let Some(entry) = events::parse_line(line) else {
        return Ok(false);
    };
    let hash = format!("{:016x}", xxh3_64(line.trim().as_bytes()));
    let changed = conn
        .execute(
            "INSERT OR IGNORE INTO events (project, event_type, timestamp, details, line_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project, entry.kind, entry.timestamp, entry.details.to_string(), hash],
        )
        .context("Failed to index event")?;
    Ok(changed > 0)
}

fn insert_run(conn: &Connection, project: &str, path: &Path) -> Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let run: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if !run.is_object() {
        return Ok(false);
    }
    let source_file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let text = |key: &str| run.get(key).and_then(Value::as_str).map(str::to_string);

    let script_path = text("script_path").or_else(|| text("script")).unwrap_or_default();
    let status = text("status").unwrap_or_else(|| "unknown".to_string());
    let returncode = run.get("returncode").and_then(Value::as_i64).unwrap_or(0);
    let runtime = run.get("runtime").and_then(Value::as_f64).unwrap_or(0.0);
    let error_keywords = run.get("error_keywords").cloned().unwrap_or_else(|| json!([]));
    let timestamp = text("timestamp").unwrap_or_else(clock::now_rfc3339);
    let metadata = json!({
        "args": run.get("args").cloned().unwrap_or_else(|| json!([])),
        "project": text("project").unwrap_or_else(|| project.to_string()),
    });

    let changed = conn
        .execute(
            "INSERT OR REPLACE INTO runs
                (project, source_file, script_path, status, returncode, runtime, summary,
                 error_keywords, timestamp, git_commit, task_context, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                project,
                source_file,
                script_path,
                status,
                returncode,
                runtime,
                text("summary").unwrap_or_default(),
                error_keywords.to_string(),
                timestamp,
                text("git_commit"),
                text("task_context"),
                metadata.to_string(),
            ],
        )
        .context("Failed to index run log")?;
    Ok(changed > 0)
}
