use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::clock;
use crate::error::IndexError;

pub const SCHEMA_VERSION: &str = "1.0";
const SCHEMA_DESCRIPTION: &str = "commits, snapshots, events, runs, embeddings, sync ledger";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version     TEXT PRIMARY KEY,
    applied_at  TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS snapshots (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    project          TEXT    NOT NULL UNIQUE,
    timestamp        TEXT    NOT NULL,
    status           TEXT,
    last_commit      TEXT,
    last_run         TEXT,
    pending_changes  INTEGER NOT NULL DEFAULT 0,
    snapshot_version INTEGER NOT NULL DEFAULT 0,
    metadata         TEXT
);
CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    project    TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp  TEXT NOT NULL,
    details    TEXT,
    line_hash  TEXT NOT NULL,
    UNIQUE(project, line_hash)
);
CREATE TABLE IF NOT EXISTS commits (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    project       TEXT NOT NULL,
    commit_hash   TEXT NOT NULL,
    commit_id     TEXT NOT NULL,
    summary       TEXT,
    files_changed TEXT,
    timestamp     TEXT,
    metadata      TEXT,
    UNIQUE(project, commit_hash)
);
CREATE TABLE IF NOT EXISTS runs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    project        TEXT NOT NULL,
    source_file    TEXT NOT NULL,
    script_path    TEXT,
    status         TEXT,
    returncode     INTEGER,
    runtime        REAL,
    summary        TEXT,
    error_keywords TEXT,
    timestamp      TEXT,
    git_commit     TEXT,
    task_context   TEXT,
    metadata       TEXT,
    UNIQUE(project, source_file)
);
CREATE TABLE IF NOT EXISTS embeddings (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project_name    TEXT NOT NULL,
    source_type     TEXT NOT NULL,
    source_id       TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    content_preview TEXT,
    embedding       BLOB,
    embedding_model TEXT,
    metadata        TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE(project_name, source_type, source_id)
);
CREATE TABLE IF NOT EXISTS sync_metadata (
    file_name             TEXT PRIMARY KEY,
    last_json_modified    TEXT,
    last_synced_at        TEXT,
    last_trimmed_at       TEXT,
    row_count_before_trim INTEGER,
    row_count_after_trim  INTEGER,
    sync_status           TEXT NOT NULL DEFAULT 'synced',
    error_message         TEXT
);
CREATE INDEX IF NOT EXISTS idx_commits_project   ON commits(project, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_project    ON events(project, event_type);
CREATE INDEX IF NOT EXISTS idx_runs_project      ON runs(project, status);
CREATE INDEX IF NOT EXISTS idx_snapshots_status  ON snapshots(status);
CREATE INDEX IF NOT EXISTS idx_embeddings_source ON embeddings(project_name, source_type);
";

/// Version recorded in the database, if the version table exists and has a row.
pub(super) fn recorded_version(conn: &Connection) -> Result<Option<String>> {
    let has_table: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
            [],
            |row| row.get(0),
        )
        .context("Failed to inspect schema")?;
    if !has_table {
        return Ok(None);
    }
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY applied_at DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to read schema version")
}

/// Refuse a database recorded at another version before anything writes to it.
pub(super) fn check_version(conn: &Connection, db: &Path) -> Result<()> {
    match recorded_version(conn)? {
        Some(found) if found != SCHEMA_VERSION => migrate(db, &found, SCHEMA_VERSION),
        _ => Ok(()),
    }
}

/// Create every table at [`SCHEMA_VERSION`]. A database recorded at another
/// version is handed to [`migrate`] and otherwise left alone.
pub(super) fn ensure_schema(conn: &Connection, db: &Path) -> Result<()> {
    check_version(conn, db)?;
    conn.execute_batch(SCHEMA_SQL)
        .context("Failed to initialise context.db schema")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        params![SCHEMA_VERSION, clock::now_rfc3339(), SCHEMA_DESCRIPTION],
    )
    .context("Failed to record schema version")?;
    Ok(())
}

/// Only one schema version exists, so every migration path is refused.
fn migrate(db: &Path, from: &str, to: &str) -> Result<()> {
    tracing::error!(db = %db.display(), from, to, "no migration path for index schema");
    Err(IndexError::SchemaMismatch {
        db: db.to_path_buf(),
        found: from.to_string(),
        expected: to.to_string(),
    }
    .into())
}
