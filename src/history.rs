use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::clock;
use crate::config::ProjectConfig;
use crate::document_store::DocumentStore;
use crate::encoding::decode_text;
use crate::error::ReadStatus;
use crate::layout::ProjectLayout;
use crate::vcs::{CommitLogSource, ExternalCommit};

pub const HISTORY_VERSION: &str = "1.0";

const CONTEXT_FILES: usize = 5;
const CONTEXT_LINES: usize = 3;
const CONTEXT_CHARS: usize = 100;
const CONTEXT_READ_BYTES: u64 = 4096;
const MAJOR_MARKERS: [&str; 5] = ["feat:", "refactor:", "major:", "breaking", "version"];

/// One commit. Immutable once appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitRecord {
    pub commit_id: String,
    pub commit_id_full: String,
    pub files_changed: Vec<String>,
    pub file_contexts: BTreeMap<String, String>,
    pub summary: String,
    pub timestamp: String,
    pub project: String,
}

impl CommitRecord {
    /// Record from an external log entry, without file previews.
    pub fn from_external(project: &str, commit: &ExternalCommit) -> Self {
        Self {
            commit_id: short_id(&commit.id),
            commit_id_full: commit.id.clone(),
            files_changed: commit.files.clone(),
            file_contexts: BTreeMap::new(),
            summary: commit.message.clone(),
            timestamp: commit
                .committed_at
                .as_deref()
                .and_then(clock::parse_timestamp)
                .map(clock::format_rfc3339)
                .unwrap_or_else(clock::now_rfc3339),
            project: project.to_string(),
        }
    }

    /// Record for a fresh commit, with short previews of the first changed
    /// files. Files under the state directory are skipped.
    pub fn capture(layout: &ProjectLayout, commit: &ExternalCommit) -> Self {
        let mut record = Self::from_external(layout.name(), commit);
        record.timestamp = clock::now_rfc3339();
        let state_prefix = format!("{}/", layout.state_dir_name());
        for file in commit
            .files
            .iter()
            .filter(|f| !f.starts_with(&state_prefix))
            .take(CONTEXT_FILES)
        {
            if let Some(preview) = file_preview(&layout.dir().join(file)) {
                record.file_contexts.insert(file.clone(), preview);
            }
        }
        record
    }

    /// Summary carries a marker of a significant change (feature, refactor, breaking).
    pub fn is_major(&self) -> bool {
        let summary = self.summary.to_lowercase();
        MAJOR_MARKERS.iter().any(|m| summary.contains(m))
    }

    fn matches_id(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        self.commit_id_full == id
            || (!self.commit_id_full.is_empty() && id.starts_with(&self.commit_id_full))
            || (!self.commit_id.is_empty() && id.starts_with(&self.commit_id))
    }
}

/// `commit_history.json`. `history` is newest first, never longer than
/// `max_commits`, and `last_commit` mirrors `history[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitHistory {
    pub version: String,
    pub last_commit: Option<CommitRecord>,
    pub history: Vec<CommitRecord>,
    pub max_commits: usize,
    pub last_updated: Option<String>,
}

impl Default for CommitHistory {
    fn default() -> Self {
        Self::empty(crate::config::DEFAULT_MAX_COMMITS)
    }
}

impl CommitHistory {
    pub fn empty(max_commits: usize) -> Self {
        Self {
            version: HISTORY_VERSION.to_string(),
            last_commit: None,
            history: Vec::new(),
            max_commits: max_commits.max(1),
            last_updated: None,
        }
    }

    /// Dedup by full id, prepend, truncate.
    pub fn insert(&mut self, record: CommitRecord, max_commits: usize) {
        self.history
            .retain(|c| c.commit_id_full != record.commit_id_full);
        self.history.insert(0, record);
        self.enforce(max_commits);
        self.last_updated = Some(clock::now_rfc3339());
    }

    /// Re-apply the bound and the head invariant. Returns dropped entries.
    pub fn enforce(&mut self, max_commits: usize) -> usize {
        let max = max_commits.max(1);
        let before = self.history.len();
        self.history.truncate(max);
        self.max_commits = max;
        self.last_commit = self.history.first().cloned();
        before - self.history.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.history.iter().any(|c| c.matches_id(id))
    }

    fn is_consistent(&self) -> bool {
        self.history.len() <= self.max_commits.max(1)
            && self.last_commit.as_ref() == self.history.first()
    }
}

/// Where a history can come from, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Unified,
    LegacyMigration,
    ExternalLog,
    Empty,
}

pub const LOAD_ORDER: [HistorySource; 4] = [
    HistorySource::Unified,
    HistorySource::LegacyMigration,
    HistorySource::ExternalLog,
    HistorySource::Empty,
];

/// Bounded, deduplicated commit history per project.
pub struct HistoryStore {
    store: Arc<DocumentStore>,
    vcs: Arc<dyn CommitLogSource>,
}

impl HistoryStore {
    pub fn new(store: Arc<DocumentStore>, vcs: Arc<dyn CommitLogSource>) -> Self {
        Self { store, vcs }
    }

    pub fn commit_source(&self) -> &Arc<dyn CommitLogSource> {
        &self.vcs
    }

    /// `commit_history.max_commits` from the project's config.json.
    pub fn max_commits(&self, layout: &ProjectLayout) -> usize {
        self.store
            .read(&layout.config(), ProjectConfig::default)
            .value
            .max_commits()
    }

    /// Insert `record` as the new head. The whole read-dedup-prepend-truncate
    /// runs under one store lock.
    pub fn append_commit(&self, layout: &ProjectLayout, mut record: CommitRecord) -> Result<CommitRecord> {
        if !layout.commit_history().exists() {
            if let Err(err) = self.migrate_legacy(layout) {
                tracing::warn!(project = layout.name(), error = %err, "legacy history migration failed");
            }
        }
        if record.commit_id_full.is_empty() {
            record.commit_id_full = record.commit_id.clone();
        }
        anyhow::ensure!(!record.commit_id_full.is_empty(), "commit record has no id");
        if record.commit_id.is_empty() || record.commit_id.len() > 7 {
            record.commit_id = short_id(&record.commit_id_full);
        }
        if record.timestamp.is_empty() {
            record.timestamp = clock::now_rfc3339();
        }
        if record.project.is_empty() {
            record.project = layout.name().to_string();
        }

        let max = self.max_commits(layout);
        self.store.update(
            &layout.commit_history(),
            false,
            || CommitHistory::empty(max),
            |history: &mut CommitHistory, _| {
                history.insert(record.clone(), max);
                Ok(())
            },
        )?;
        tracing::debug!(project = layout.name(), commit = %record.commit_id, "commit appended");
        Ok(record)
    }

    /// Resolve the history through [`LOAD_ORDER`]. Never fails; the last
    /// strategy is an empty history.
    pub fn load(&self, layout: &ProjectLayout) -> CommitHistory {
        let max = self.max_commits(layout);
        for source in LOAD_ORDER {
            match self.load_from(source, layout, max) {
                Ok(Some(history)) => {
                    tracing::trace!(project = layout.name(), ?source, "history resolved");
                    return history;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(project = layout.name(), ?source, error = %err, "history source failed")
                }
            }
        }
        CommitHistory::empty(max)
    }

    fn load_from(&self, source: HistorySource, layout: &ProjectLayout, max: usize) -> Result<Option<CommitHistory>> {
        match source {
            HistorySource::Unified => {
                let outcome = self.store.read(&layout.commit_history(), || CommitHistory::empty(max));
                if !outcome.is_parsed() || outcome.value.history.is_empty() {
                    return Ok(None);
                }
                let history = outcome.value;
                if self.is_stale(layout, &history) && self.sync_from_external_log(layout)? {
                    return Ok(Some(self.read_unified(layout, max)));
                }
                Ok(Some(history))
            }
            HistorySource::LegacyMigration => {
                Ok(self.migrate_legacy(layout)?.filter(|h| !h.history.is_empty()))
            }
            HistorySource::ExternalLog => {
                if self.sync_from_external_log(layout)? {
                    Ok(Some(self.read_unified(layout, max)))
                } else {
                    Ok(None)
                }
            }
            HistorySource::Empty => Ok(Some(CommitHistory::empty(max))),
        }
    }

    fn read_unified(&self, layout: &ProjectLayout, max: usize) -> CommitHistory {
        self.store
            .read(&layout.commit_history(), || CommitHistory::empty(max))
            .into_value()
    }

    fn is_stale(&self, layout: &ProjectLayout, history: &CommitHistory) -> bool {
        match self.vcs.head(layout.dir()) {
            Ok(Some(head)) => !history.contains(&head),
            Ok(None) => false,
            Err(err) => {
                tracing::debug!(project = layout.name(), error = %err, "head lookup failed");
                false
            }
        }
    }

    /// Rebuild the history from the external log's newest `max_commits`
    /// entries. Returns false when the log has nothing to offer.
    pub fn sync_from_external_log(&self, layout: &ProjectLayout) -> Result<bool> {
        let max = self.max_commits(layout);
        let commits = self
            .vcs
            .recent(layout.dir(), max)
            .with_context(|| format!("Failed to read commit log for {}", layout.name()))?;
        if commits.is_empty() {
            return Ok(false);
        }

        let mut history = CommitHistory::empty(max);
        history.history = commits
            .iter()
            .map(|c| CommitRecord::from_external(layout.name(), c))
            .collect();
        history.enforce(max);
        history.last_updated = Some(clock::now_rfc3339());
        self.store.write(&layout.commit_history(), &history, false)?;
        tracing::info!(project = layout.name(), commits = history.history.len(), "history synced from commit log");
        Ok(true)
    }

    /// One-time rebuild from `commit_report.json` + `commit_history.jsonl`.
    /// `Ok(None)` when there is nothing to migrate or the unified document
    /// already exists.
    pub fn migrate_legacy(&self, layout: &ProjectLayout) -> Result<Option<CommitHistory>> {
        let report_path = layout.legacy_commit_report();
        let log_path = layout.legacy_commit_log();
        if layout.commit_history().exists() || (!report_path.exists() && !log_path.exists()) {
            return Ok(None);
        }

        let max = self.max_commits(layout);
        let last_commit = self
            .store
            .read(&report_path, || None::<CommitRecord>)
            .into_value()
            .filter(|c| !c.commit_id.is_empty() || !c.commit_id_full.is_empty());

        let mut records = read_legacy_log(&log_path);
        records.reverse();
        if let Some(last) = last_commit {
            let id = if last.commit_id.is_empty() { &last.commit_id_full } else { &last.commit_id };
            if !records.iter().any(|c| c.matches_id(id) || last.matches_id(&c.commit_id_full)) {
                records.insert(0, last);
            }
        }

        let mut history = CommitHistory::empty(max);
        history.history = records;
        history.enforce(max);
        history.last_updated = Some(clock::now_rfc3339());

        self.store.update(
            &layout.commit_history(),
            false,
            || history.clone(),
            |existing: &mut CommitHistory, status| {
                // a concurrent caller may have migrated first
                if status == ReadStatus::Ok {
                    return Ok(());
                }
                *existing = history.clone();
                Ok(())
            },
        )?;
        tracing::info!(project = layout.name(), commits = history.history.len(), "migrated legacy commit history");
        Ok(Some(self.read_unified(layout, max)))
    }

    /// Re-apply the structural bound. Returns how many entries were dropped.
    pub fn enforce_bound(&self, layout: &ProjectLayout) -> Result<usize> {
        if !layout.commit_history().exists() {
            return Ok(0);
        }
        let max = self.max_commits(layout);
        let current = self.store.read(&layout.commit_history(), || CommitHistory::empty(max));
        if !current.is_parsed() || (current.value.max_commits == max && current.value.is_consistent()) {
            return Ok(0);
        }
        self.store.update(
            &layout.commit_history(),
            false,
            || CommitHistory::empty(max),
            |history: &mut CommitHistory, _| Ok(history.enforce(max)),
        )
    }
}

fn read_legacy_log(path: &Path) -> Vec<CommitRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "legacy commit log unreadable");
            }
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| serde_json::from_str::<CommitRecord>(line).ok())
        .collect()
}

fn short_id(id: &str) -> String {
    id.chars().take(7).collect()
}

/// First lines of a text file, capped for use as a commit preview.
fn file_preview(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut bytes = Vec::new();
    file.take(CONTEXT_READ_BYTES).read_to_end(&mut bytes).ok()?;
    let (text, _) = decode_text(&bytes)?;
    let preview: String = text
        .lines()
        .take(CONTEXT_LINES)
        .collect::<Vec<_>>()
        .join("\n")
        .chars()
        .take(CONTEXT_CHARS)
        .collect();
    (!preview.trim().is_empty()).then_some(preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::StoreOptions;
    use crate::layout::Workspace;
    use crate::write_core::DurabilityMode;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// In-memory commit log, newest first.
    #[derive(Default)]
    struct FakeLog {
        commits: Mutex<Vec<ExternalCommit>>,
    }

    impl FakeLog {
        fn push(&self, id: &str, message: &str) {
            self.commits.lock().insert(
                0,
                ExternalCommit {
                    id: id.to_string(),
                    message: message.to_string(),
                    files: vec!["src/main.rs".into()],
                    committed_at: Some("2024-01-01T00:00:00Z".into()),
                },
            );
        }
    }

    impl CommitLogSource for FakeLog {
        fn head(&self, _repo: &Path) -> Result<Option<String>> {
            Ok(self.commits.lock().first().map(|c| c.id.clone()))
        }
        fn recent(&self, _repo: &Path, limit: usize) -> Result<Vec<ExternalCommit>> {
            Ok(self.commits.lock().iter().take(limit).cloned().collect())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        layout: ProjectLayout,
        store: Arc<DocumentStore>,
        log: Arc<FakeLog>,
        history: HistoryStore,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::new(
            tmp.path(),
            StoreOptions {
                durability: DurabilityMode::Fast,
                ..StoreOptions::default()
            },
        ));
        let layout = Workspace::new(tmp.path(), ".projctx").project("demo").unwrap();
        fs::create_dir_all(layout.state_dir()).unwrap();
        let log = Arc::new(FakeLog::default());
        let history = HistoryStore::new(Arc::clone(&store), log.clone());
        Fixture {
            _tmp: tmp,
            layout,
            store,
            log,
            history,
        }
    }

    fn record(full: &str, summary: &str) -> CommitRecord {
        CommitRecord {
            commit_id_full: full.to_string(),
            summary: summary.to_string(),
            ..CommitRecord::default()
        }
    }

    #[test]
    fn appends_keep_newest_three_by_default() {
        let f = fixture();
        for i in 1..=5 {
            f.history
                .append_commit(&f.layout, record(&format!("{i:040}"), &format!("c{i}")))
                .unwrap();
        }
        let h = f.history.load(&f.layout);
        let summaries: Vec<_> = h.history.iter().map(|c| c.summary.as_str()).collect();
        assert_eq!(summaries, vec!["c5", "c4", "c3"]);
        assert_eq!(h.last_commit.as_ref().unwrap().summary, "c5");
        assert_eq!(h.max_commits, 3);
    }

    #[test]
    fn duplicate_full_id_replaces_instead_of_growing() {
        let f = fixture();
        f.history.append_commit(&f.layout, record("a".repeat(40).as_str(), "first")).unwrap();
        f.history.append_commit(&f.layout, record("b".repeat(40).as_str(), "second")).unwrap();
        f.history.append_commit(&f.layout, record("a".repeat(40).as_str(), "amended")).unwrap();

        let h = f.history.load(&f.layout);
        assert_eq!(h.history.len(), 2);
        assert_eq!(h.history[0].summary, "amended");
        assert_eq!(h.history[0].commit_id, "aaaaaaa");
        assert_eq!(h.history[1].summary, "second");
    }

    #[test]
    fn max_commits_comes_from_project_config() {
        let f = fixture();
        fs::write(f.layout.config(), r#"{"commit_history": {"max_commits": 1}}"#).unwrap();
        f.history.append_commit(&f.layout, record("1".repeat(40).as_str(), "one")).unwrap();
        f.history.append_commit(&f.layout, record("2".repeat(40).as_str(), "two")).unwrap();
        let h = f.history.load(&f.layout);
        assert_eq!(h.history.len(), 1);
        assert_eq!(h.history[0].summary, "two");
    }

    #[test]
    fn empty_history_syncs_from_external_log() {
        let f = fixture();
        f.log.push(&"1".repeat(40), "init");
        f.log.push(&"2".repeat(40), "feat: parser");

        let h = f.history.load(&f.layout);
        assert_eq!(h.history.len(), 2);
        assert_eq!(h.history[0].summary, "feat: parser");
        assert_eq!(h.history[0].timestamp, "2024-01-01T00:00:00.000000Z");
        assert!(f.layout.commit_history().exists());
    }

    #[test]
    fn stale_history_resyncs_when_head_is_unknown() {
        let f = fixture();
        f.log.push(&"1".repeat(40), "init");
        f.history
            .append_commit(&f.layout, CommitRecord::from_external("demo", &f.log.recent(Path::new("."), 1).unwrap()[0]))
            .unwrap();
        f.log.push(&"2".repeat(40), "made outside the engine");

        let h = f.history.load(&f.layout);
        assert_eq!(h.history[0].summary, "made outside the engine");
        assert_eq!(h.history.len(), 2);
    }

    #[test]
    fn no_sources_yield_empty_history() {
        let f = fixture();
        let h = f.history.load(&f.layout);
        assert!(h.history.is_empty());
        assert!(h.last_commit.is_none());
    }

    #[test]
    fn legacy_migration_is_idempotent() {
        let f = fixture();
        let lines: Vec<String> = (1..=4)
            .map(|i| {
                serde_json::to_string(&CommitRecord {
                    commit_id: format!("{i:07}"),
                    commit_id_full: format!("{i:040}"),
                    summary: format!("legacy {i}"),
                    ..CommitRecord::default()
                })
                .unwrap()
            })
            .collect();
        fs::write(f.layout.legacy_commit_log(), lines.join("\n") + "\nnot json\n").unwrap();
        fs::write(
            f.layout.legacy_commit_report(),
            serde_json::to_string(&CommitRecord {
                commit_id: "fffffff".into(),
                commit_id_full: "f".repeat(40),
                summary: "report head".into(),
                ..CommitRecord::default()
            })
            .unwrap(),
        )
        .unwrap();

        let first = f.history.migrate_legacy(&f.layout).unwrap().unwrap();
        let bytes_after_first = fs::read(f.layout.commit_history()).unwrap();
        let summaries: Vec<_> = first.history.iter().map(|c| c.summary.as_str()).collect();
        assert_eq!(summaries, vec!["report head", "legacy 4", "legacy 3"]);
        assert_eq!(first.last_commit.as_ref().unwrap().summary, "report head");

        assert!(f.history.migrate_legacy(&f.layout).unwrap().is_none());
        assert_eq!(fs::read(f.layout.commit_history()).unwrap(), bytes_after_first);
        assert_eq!(f.history.load(&f.layout), first);
    }

    #[test]
    fn enforce_bound_truncates_oversized_document() {
        let f = fixture();
        let mut oversized = CommitHistory::empty(10);
        for i in 0..6 {
            oversized.history.push(record(&format!("{i:040}"), &format!("c{i}")));
        }
        f.store.write(&f.layout.commit_history(), &oversized, false).unwrap();

        assert_eq!(f.history.enforce_bound(&f.layout).unwrap(), 3);
        let h = f.history.load(&f.layout);
        assert_eq!(h.history.len(), 3);
        assert_eq!(h.last_commit.as_ref().unwrap().summary, "c0");
        assert_eq!(f.history.enforce_bound(&f.layout).unwrap(), 0);
    }

    #[test]
    fn capture_previews_first_lines_and_skips_state_dir() {
        let f = fixture();
        fs::create_dir_all(f.layout.dir().join("src")).unwrap();
        fs::write(f.layout.dir().join("src/lib.rs"), "line one\nline two\nline three\nline four\n").unwrap();
        let commit = ExternalCommit {
            id: "9".repeat(40),
            message: "refactor: split lib".into(),
            files: vec![
                ".projctx/memory.json".into(),
                "src/lib.rs".into(),
                "deleted.rs".into(),
            ],
            committed_at: None,
        };
        let rec = CommitRecord::capture(&f.layout, &commit);
        assert_eq!(rec.commit_id, "9999999");
        assert_eq!(rec.file_contexts.len(), 1);
        assert_eq!(rec.file_contexts["src/lib.rs"], "line one\nline two\nline three");
        assert!(rec.is_major());
        assert_eq!(rec.files_changed.len(), 3);
    }
}
