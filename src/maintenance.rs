//! FIFO retention for project state: line logs, the action log and the other
//! state JSON documents. Every trim of a mirrored source is reported to the
//! index ledger so the next sync rebuilds it.

use anyhow::{Context, Result};
use memchr::memchr_iter;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::clock;
use crate::config::{LimitsConfig, ProjectConfig};
use crate::document_store::DocumentStore;
use crate::history::HistoryStore;
use crate::indexer::{Indexer, MirroredSource};
use crate::layout::{
    ProjectLayout, Workspace, COMMIT_HISTORY_FILE, CONFIG_FILE, CONTEXT_FULL_FILE, EVENTS_LOG_FILE, MEMORY_FILE,
};
use crate::memory::{ProjectMemory, MEMORY_VERSION};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn mb_to_bytes(mb: f64) -> u64 {
    (mb.max(0.0) * BYTES_PER_MB) as u64
}

/// Item counts around one trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Trimmed {
    pub before: usize,
    pub after: usize,
}

impl Trimmed {
    pub fn dropped(&self) -> usize {
        self.before - self.after
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    /// Some state JSON exceeded its limit, so all of them were trimmed.
    pub unified_trim: bool,
    pub json_trimmed: Vec<String>,
    pub history_dropped: usize,
    pub events_dropped: usize,
    pub logs_trimmed: BTreeMap<String, usize>,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    pub fn files_trimmed(&self) -> usize {
        self.json_trimmed.len()
            + usize::from(self.history_dropped > 0)
            + usize::from(self.events_dropped > 0)
            + self.logs_trimmed.len()
    }
}

pub struct Maintenance {
    workspace: Workspace,
    store: Arc<DocumentStore>,
    history: Arc<HistoryStore>,
    indexer: Arc<Indexer>,
    limits: LimitsConfig,
}

impl Maintenance {
    pub fn new(
        workspace: Workspace,
        store: Arc<DocumentStore>,
        history: Arc<HistoryStore>,
        indexer: Arc<Indexer>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            workspace,
            store,
            history,
            indexer,
            limits,
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Rotate a line log. Past `max_size_mb` or `max_entries` lines, only
    /// the newest `max_entries / 2` lines (at least one) are kept; if those
    /// still exceed the size limit, older ones go until half of it remains.
    /// Returns the number of lines dropped. A trimmed file that a project's
    /// index mirrors is marked for a full resync.
    pub fn maintain(&self, path: &Path, max_size_mb: f64, max_entries: usize) -> Result<usize> {
        let Some(trimmed) = self.rotate(path, max_size_mb, max_entries)? else {
            return Ok(0);
        };
        let mirrored = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(MirroredSource::from_file_name);
        if let (Some(source), Some(layout)) = (mirrored, self.workspace.owning_project(path)) {
            self.note_trim(&layout, source.file_name(), trimmed);
        }
        Ok(trimmed.dropped())
    }

    fn rotate(&self, path: &Path, max_size_mb: f64, max_entries: usize) -> Result<Option<Trimmed>> {
        self.store.exclusive(|writer| {
            let bytes = match fs::read(path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to read {}", path.display()))
                }
            };
            let limit = mb_to_bytes(max_size_mb);
            let lines = line_spans(&bytes);
            if bytes.len() as u64 <= limit && lines.len() <= max_entries {
                return Ok(None);
            }

            let keep = (max_entries / 2).max(1);
            let mut start = lines.len().saturating_sub(keep);
            let mut kept_bytes: u64 = lines[start..].iter().map(|l| l.len() as u64 + 1).sum();
            if kept_bytes > limit {
                let target = limit / 2;
                while kept_bytes > target && start + 1 < lines.len() {
                    kept_bytes -= lines[start].len() as u64 + 1;
                    start += 1;
                }
            }
            if start == 0 && kept_bytes == bytes.len() as u64 {
                return Ok(None);
            }

            let kept = &lines[start..];
            writer.write_with(path, |out| {
                for span in kept {
                    out.write_all(&bytes[span.clone()])?;
                    out.write_all(b"\n")?;
                }
                Ok(kept_bytes)
            })?;
            let trimmed = Trimmed {
                before: lines.len(),
                after: kept.len(),
            };
            tracing::info!(path = %path.display(), before = trimmed.before, after = trimmed.after, "log rotated");
            Ok(Some(trimmed))
        })
    }

    /// Rotate `events.log` with the configured limits and mark it for resync.
    pub fn rotate_events(&self, layout: &ProjectLayout) -> Result<usize> {
        let trimmed = self.rotate(
            &layout.events_log(),
            self.limits.events_max_size_mb,
            self.limits.events_max_entries,
        )?;
        Ok(match trimmed {
            Some(t) => {
                self.note_trim(layout, EVENTS_LOG_FILE, t);
                t.dropped()
            }
            None => 0,
        })
    }

    /// Called after an event append: rotate only when the log outgrew its size limit.
    pub fn after_event_append(&self, layout: &ProjectLayout) -> Result<usize> {
        if file_len(&layout.events_log()) <= mb_to_bytes(self.limits.events_max_size_mb) {
            return Ok(0);
        }
        self.rotate_events(layout)
    }

    /// Called after a memory write: trim only when the file outgrew its size limit.
    pub fn after_memory_write(&self, layout: &ProjectLayout) -> Result<usize> {
        let (_, max_size_mb) = self.memory_limits(layout);
        if file_len(&layout.memory()) <= mb_to_bytes(max_size_mb) {
            return Ok(0);
        }
        self.trim_memory(layout)
    }

    /// FIFO-trim the action log using the project's limits (`config.json`
    /// `memory.*`, else the engine's). Stats and semantic context are kept.
    /// Returns the number of actions dropped.
    pub fn trim_memory(&self, layout: &ProjectLayout) -> Result<usize> {
        let (max_entries, max_size_mb) = self.memory_limits(layout);
        self.trim_memory_to(layout, max_entries, max_size_mb)
    }

    fn memory_limits(&self, layout: &ProjectLayout) -> (usize, f64) {
        let config = self
            .store
            .read(&layout.config(), ProjectConfig::default)
            .into_value();
        (
            config
                .memory_max_entries()
                .unwrap_or(self.limits.memory_max_entries)
                .max(1),
            config
                .memory_max_size_mb()
                .unwrap_or(self.limits.memory_max_size_mb),
        )
    }

    fn trim_memory_to(&self, layout: &ProjectLayout, max_entries: usize, max_size_mb: f64) -> Result<usize> {
        let path = layout.memory();
        if !path.exists() {
            return Ok(0);
        }
        let over_size = file_len(&path) > mb_to_bytes(max_size_mb);
        let target = mb_to_bytes(max_size_mb) / 2;

        let dropped = self.store.update(
            &path,
            false,
            ProjectMemory::default,
            |memory: &mut ProjectMemory, _| {
                if memory.version.is_empty() {
                    memory.version = MEMORY_VERSION.to_string();
                }
                if memory.project_name.is_empty() {
                    memory.project_name = layout.name().to_string();
                }
                let before = memory.actions.len();
                if memory.actions.len() > max_entries {
                    let excess = memory.actions.len() - max_entries;
                    memory.actions.drain(..excess);
                }
                if over_size {
                    let total = serde_json::to_vec(&*memory)?.len() as u64;
                    let sizes = memory
                        .actions
                        .iter()
                        .map(|a| serde_json::to_vec(a).map(|v| v.len() as u64 + 1))
                        .collect::<serde_json::Result<Vec<_>>>()?;
                    let drop = fifo_cut(total, &sizes, target);
                    memory.actions.drain(..drop);
                }
                memory.last_cleanup = Some(clock::now_rfc3339());
                Ok(before - memory.actions.len())
            },
        )?;
        if dropped > 0 {
            tracing::info!(project = layout.name(), dropped, "memory actions trimmed");
        }
        Ok(dropped)
    }

    /// FIFO-trim the arrays of a JSON document (the root array, or each
    /// top-level array field in turn) down to half of `max_size_mb`.
    /// `None` when the document is within its limit or has nothing to trim.
    pub fn trim_json_document(&self, path: &Path, max_size_mb: f64) -> Result<Option<Trimmed>> {
        let limit = mb_to_bytes(max_size_mb);
        if file_len(path) <= limit {
            return Ok(None);
        }
        let outcome = self.store.read(path, || Value::Null);
        if !outcome.is_parsed() {
            return Ok(None);
        }
        let mut document = outcome.into_value();
        let before = array_items(&document);
        trim_arrays(&mut document, limit / 2)?;
        let after = array_items(&document);
        if after == before {
            tracing::warn!(path = %path.display(), "document over limit but has no array to trim");
            return Ok(None);
        }
        self.store.write(path, &document, false)?;
        tracing::info!(path = %path.display(), before, after, "document trimmed");
        Ok(Some(Trimmed { before, after }))
    }

    /// Whole-project pass. The state JSON documents (all but `config.json`)
    /// are one unit: when any exceeds the limit, all of them are trimmed.
    /// Then `events.log` and every `.log`/`.jsonl` under `logs/` are rotated.
    pub fn maintain_project(&self, layout: &ProjectLayout) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if !layout.state_dir().is_dir() {
            return Ok(report);
        }

        let limit = mb_to_bytes(self.limits.json_max_size_mb);
        let documents = state_documents(layout.state_dir())?;
        report.unified_trim = documents.iter().any(|p| file_len(p) > limit);
        if report.unified_trim {
            tracing::info!(project = layout.name(), files = documents.len(), "unified trim triggered");
            for path in &documents {
                if let Err(err) = self.trim_document(layout, path, &mut report) {
                    tracing::warn!(path = %path.display(), error = %err, "trim failed");
                    report.errors.push(format!("{}: {err:#}", path.display()));
                }
            }
        }

        match self.rotate_events(layout) {
            Ok(dropped) => report.events_dropped = dropped,
            Err(err) => report.errors.push(format!("{EVENTS_LOG_FILE}: {err:#}")),
        }

        for path in log_files(&layout.logs_dir()) {
            match self.maintain(&path, self.limits.log_max_size_mb, self.limits.log_max_entries) {
                Ok(0) => {}
                Ok(dropped) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    report.logs_trimmed.insert(name, dropped);
                }
                Err(err) => report.errors.push(format!("{}: {err:#}", path.display())),
            }
        }
        Ok(report)
    }

    fn trim_document(&self, layout: &ProjectLayout, path: &Path, report: &mut MaintenanceReport) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.as_str() {
            MEMORY_FILE => {
                let (max_entries, _) = self.memory_limits(layout);
                if self.trim_memory_to(layout, max_entries, self.limits.json_max_size_mb)? > 0 {
                    report.json_trimmed.push(name);
                }
            }
            COMMIT_HISTORY_FILE => {
                report.history_dropped = self.history.enforce_bound(layout)?;
            }
            _ => {
                if let Some(trimmed) = self.trim_json_document(path, self.limits.json_max_size_mb)? {
                    if name == CONTEXT_FULL_FILE {
                        self.note_trim(layout, CONTEXT_FULL_FILE, trimmed);
                    }
                    report.json_trimmed.push(name);
                }
            }
        }
        Ok(())
    }

    fn note_trim(&self, layout: &ProjectLayout, file_name: &str, trimmed: Trimmed) {
        if !self.indexer.enabled() {
            return;
        }
        if let Err(err) = self
            .indexer
            .record_trim(layout, file_name, trimmed.before as i64, trimmed.after as i64)
        {
            tracing::warn!(project = layout.name(), file = file_name, error = %err, "failed to record trim");
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Byte ranges of the non-empty lines, without terminators.
fn line_spans(bytes: &[u8]) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for end in memchr_iter(b'\n', bytes) {
        if end > start {
            spans.push(start..end);
        }
        start = end + 1;
    }
    if start < bytes.len() {
        spans.push(start..bytes.len());
    }
    spans
}

/// How many leading items to drop so `total` falls to `target`, keeping at least one.
fn fifo_cut(total: u64, sizes: &[u64], target: u64) -> usize {
    let mut remaining = total;
    let mut drop = 0;
    while remaining > target && drop + 1 < sizes.len() {
        remaining = remaining.saturating_sub(sizes[drop]);
        drop += 1;
    }
    drop
}

fn trim_arrays(document: &mut Value, target: u64) -> Result<()> {
    let mut total = serde_json::to_vec(document)?.len() as u64;
    match document {
        Value::Array(items) => {
            let sizes = item_sizes(items)?;
            let drop = fifo_cut(total, &sizes, target);
            items.drain(..drop);
        }
        Value::Object(map) => {
            for value in map.values_mut() {
                if total <= target {
                    break;
                }
                let Value::Array(items) = value else {
                    continue;
                };
                let sizes = item_sizes(items)?;
                let drop = fifo_cut(total, &sizes, target);
                total = total.saturating_sub(sizes[..drop].iter().sum());
                items.drain(..drop);
            }
        }
        _ => {}
    }
    Ok(())
}

fn item_sizes(items: &[Value]) -> Result<Vec<u64>> {
    items
        .iter()
        .map(|item| Ok(serde_json::to_vec(item)?.len() as u64 + 1))
        .collect()
}

fn array_items(document: &Value) -> usize {
    match document {
        Value::Array(items) => items.len(),
        Value::Object(map) => map
            .values()
            .filter_map(Value::as_array)
            .map(Vec::len)
            .sum(),
        _ => 0,
    }
}

/// `*.json` files directly in the state directory, except `config.json`.
fn state_documents(state_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut documents = Vec::new();
    for entry in WalkDir::new(state_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", state_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let is_json = path.extension().is_some_and(|e| e == "json");
        let is_config = path.file_name().is_some_and(|n| n == CONFIG_FILE);
        if is_json && !is_config {
            documents.push(path);
        }
    }
    documents.sort();
    Ok(documents)
}

fn log_files(logs_dir: &Path) -> Vec<PathBuf> {
    if !logs_dir.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(logs_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|e| e == "log" || e == "jsonl"))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::document_store::StoreOptions;
    use crate::layout::Workspace;
    use crate::memory::{self, ActionKind};
    use crate::vcs::{CommitLogSource, ExternalCommit};
    use crate::write_core::DurabilityMode;
    use serde_json::json;
    use tempfile::TempDir;

    struct NoRepository;

    impl CommitLogSource for NoRepository {
        fn head(&self, _repo: &Path) -> Result<Option<String>> {
            Ok(None)
        }
        fn recent(&self, _repo: &Path, _limit: usize) -> Result<Vec<ExternalCommit>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        layout: ProjectLayout,
        store: Arc<DocumentStore>,
        indexer: Arc<Indexer>,
        maintenance: Maintenance,
    }

    fn fixture(limits: LimitsConfig) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::new(
            tmp.path(),
            StoreOptions {
                durability: DurabilityMode::Fast,
                ..StoreOptions::default()
            },
        ));
        let history = Arc::new(HistoryStore::new(store.clone(), Arc::new(NoRepository)));
        let indexer = Arc::new(Indexer::new(IndexConfig::default()));
        let layout = Workspace::new(tmp.path(), ".projctx").project("demo").unwrap();
        fs::create_dir_all(layout.state_dir()).unwrap();
        let maintenance = Maintenance::new(
            Workspace::new(tmp.path(), ".projctx"),
            store.clone(),
            history,
            indexer.clone(),
            limits,
        );
        Fixture {
            _tmp: tmp,
            layout,
            store,
            indexer,
            maintenance,
        }
    }

    fn write_lines(path: &Path, n: usize, width: usize) {
        let body: String = (0..n).map(|i| format!("{i:0width$}\n")).collect();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn rotation_keeps_newest_half_of_entry_limit() {
        let f = fixture(LimitsConfig::default());
        let path = f.layout.logs_dir().join("agent.log");
        fs::create_dir_all(f.layout.logs_dir()).unwrap();
        write_lines(&path, 100, 8);

        let dropped = f.maintenance.maintain(&path, 10.0, 20).unwrap();

        assert_eq!(dropped, 90);
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "00000090");
        assert_eq!(lines[9], "00000099");
    }

    #[test]
    fn rotation_below_limits_leaves_file_alone() {
        let f = fixture(LimitsConfig::default());
        let path = f.layout.state_dir().join("small.log");
        write_lines(&path, 5, 4);
        let before = fs::read(&path).unwrap();
        assert_eq!(f.maintenance.maintain(&path, 1.0, 100).unwrap(), 0);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(f.maintenance.maintain(&f.layout.state_dir().join("absent.log"), 1.0, 1).unwrap(), 0);
    }

    #[test]
    fn size_triggered_rotation_cuts_to_half_the_limit() {
        let f = fixture(LimitsConfig::default());
        let path = f.layout.state_dir().join("big.log");
        write_lines(&path, 200, 49);
        let limit_mb = 1000.0 / BYTES_PER_MB;

        f.maintenance.maintain(&path, limit_mb, 10_000).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.len() <= 500);
        assert!(content.ends_with(&format!("{:049}\n", 199)));
    }

    #[test]
    fn single_oversized_line_is_kept() {
        let f = fixture(LimitsConfig::default());
        let path = f.layout.state_dir().join("one.log");
        fs::write(&path, format!("{}\n", "x".repeat(4096))).unwrap();
        assert_eq!(f.maintenance.maintain(&path, 0.001, 10).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap().len(), 4097);
    }

    #[test]
    fn memory_trim_by_count_preserves_stats() {
        let f = fixture(LimitsConfig::default());
        f.store
            .write(&f.layout.config(), &json!({"memory": {"max_entries": 10}}), false)
            .unwrap();
        for i in 0..30 {
            memory::record_action(&f.store, &f.layout, &ActionKind::Commit, &format!("c{i}"), None, 100).unwrap();
        }

        assert_eq!(f.maintenance.trim_memory(&f.layout).unwrap(), 20);

        let memory = memory::load(&f.store, &f.layout).into_value();
        assert_eq!(memory.actions.len(), 10);
        assert_eq!(memory.actions[0].description, "c20");
        assert_eq!(memory.stats.commits, 30);
        assert!(memory.last_cleanup.is_some());
    }

    #[test]
    fn memory_trim_by_size_goes_to_half() {
        let f = fixture(LimitsConfig {
            memory_max_size_mb: 0.01,
            ..LimitsConfig::default()
        });
        let filler = "y".repeat(200);
        for i in 0..100 {
            memory::record_action(&f.store, &f.layout, &ActionKind::Execute, &format!("{i} {filler}"), None, 1000)
                .unwrap();
        }
        assert!(file_len(&f.layout.memory()) > mb_to_bytes(0.01));

        let dropped = f.maintenance.after_memory_write(&f.layout).unwrap();

        assert!(dropped > 0);
        let memory = memory::load(&f.store, &f.layout).into_value();
        assert!(serde_json::to_vec(&memory).unwrap().len() as u64 <= mb_to_bytes(0.01) / 2 + 300);
        assert!(memory.actions.last().unwrap().description.starts_with("99 "));
        assert_eq!(memory.stats.executions, 100);
    }

    #[test]
    fn json_document_trims_root_array_oldest_first() {
        let f = fixture(LimitsConfig::default());
        let path = f.layout.state_dir().join("items.json");
        let items: Vec<Value> = (0..500).map(|i| json!({"n": i, "pad": "z".repeat(40)})).collect();
        f.store.write(&path, &items, false).unwrap();

        let trimmed = f.maintenance.trim_json_document(&path, 0.01).unwrap().unwrap();

        assert_eq!(trimmed.before, 500);
        assert!(trimmed.after < 500 && trimmed.after > 0);
        let back: Vec<Value> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back.last().unwrap()["n"], 499);
    }

    #[test]
    fn unified_pass_trims_all_documents_and_marks_resync() {
        let f = fixture(LimitsConfig {
            json_max_size_mb: 0.01,
            events_max_entries: 10,
            ..LimitsConfig::default()
        });
        let keywords: Vec<String> = (0..2000).map(|i| format!("keyword-{i}")).collect();
        f.store
            .write(&f.layout.context_full(), &json!({"project_name": "demo", "keywords": keywords}), false)
            .unwrap();
        for i in 0..60 {
            memory::record_action(&f.store, &f.layout, &ActionKind::Execute, &format!("run {i} {}", "p".repeat(150)), None, 1000)
                .unwrap();
        }
        f.store
            .write(&f.layout.config(), &json!({"padding": "c".repeat(20_000)}), false)
            .unwrap();
        write_lines(&f.layout.events_log(), 30, 10);

        let report = f.maintenance.maintain_project(&f.layout).unwrap();

        assert!(report.unified_trim);
        assert!(report.json_trimmed.contains(&CONTEXT_FULL_FILE.to_string()));
        assert!(report.json_trimmed.contains(&MEMORY_FILE.to_string()));
        assert_eq!(report.events_dropped, 25);
        assert!(report.errors.is_empty());
        // config.json is never trimmed
        assert!(file_len(&f.layout.config()) > 20_000);

        let ctx_state = f.indexer.sync_state(&f.layout, CONTEXT_FULL_FILE).unwrap().unwrap();
        assert_eq!(ctx_state.sync_status, "pending");
        assert_eq!(ctx_state.row_count_before_trim, Some(2000));
        let events_state = f.indexer.sync_state(&f.layout, EVENTS_LOG_FILE).unwrap().unwrap();
        assert_eq!(events_state.row_count_after_trim, Some(5));
    }

    #[test]
    fn fifo_cut_keeps_one_item() {
        assert_eq!(fifo_cut(1000, &[400, 400, 200], 0), 2);
        assert_eq!(fifo_cut(1000, &[400, 400, 200], 700), 1);
        assert_eq!(fifo_cut(100, &[50], 10), 0);
    }
}
