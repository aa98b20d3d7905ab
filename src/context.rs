//! Unified context: one merged view over every raw project document,
//! regenerated on each call and written to `context_full.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::sync::Arc;

use crate::clock;
use crate::config::{ProjectConfig, UserMemory};
use crate::document_store::DocumentStore;
use crate::history::{CommitRecord, HistoryStore};
use crate::indexer::Indexer;
use crate::layout::ProjectLayout;
use crate::memory::{self, MemoryStats, ProjectMemory};
use crate::readme;
use crate::snapshot;

pub const CONTEXT_VERSION: &str = "1.0";
const RECENT_COMMITS: usize = 3;
const RECENT_ACTIONS: usize = 5;

// ── Document ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadmeSection {
    pub preview: Option<String>,
    pub last_updated: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitsSection {
    pub last_commit: Option<CommitRecord>,
    pub recent: Vec<CommitRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentAction {
    pub time: String,
    pub action: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySection {
    pub total_actions: u64,
    pub recent_focus: Option<String>,
    pub common_operations: Vec<String>,
    pub error_patterns: Vec<String>,
    pub recent_actions: Vec<RecentAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub last_run: Option<String>,
    pub last_run_status: Option<String>,
    pub status: String,
    pub pending_changes: bool,
    pub last_commit: Option<String>,
    pub snapshot_version: u64,
}

/// `context_full.json`. A section that could not be produced is omitted;
/// `error` is set only when nothing could be produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiedContext {
    pub version: String,
    pub generated_at: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub description: Option<String>,
    pub tech_stack: Vec<String>,
    pub recent_focus: Option<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<ReadmeSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits: Option<CommitsSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivitySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotSection>,

    pub config: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MemoryStats>,
    pub user_memory: Option<UserMemory>,
}

impl UnifiedContext {
    fn started(project: &str) -> Self {
        Self {
            version: CONTEXT_VERSION.to_string(),
            generated_at: clock::now_rfc3339(),
            project_name: project.to_string(),
            ..Self::default()
        }
    }

    /// The minimal document returned when generation could not run at all.
    pub fn failed(project: &str, error: &anyhow::Error) -> Self {
        Self {
            error: Some(format!("{error:#}")),
            ..Self::started(project)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Generator ────────────────────────────────────────────────────────────────

pub struct ContextGenerator {
    store: Arc<DocumentStore>,
    history: Arc<HistoryStore>,
    indexer: Arc<Indexer>,
}

impl ContextGenerator {
    pub fn new(store: Arc<DocumentStore>, history: Arc<HistoryStore>, indexer: Arc<Indexer>) -> Self {
        Self {
            store,
            history,
            indexer,
        }
    }

    /// Merge every source, persist the result and mirror it into the index.
    /// Never fails: persistence and indexing errors are logged.
    pub fn generate(&self, layout: &ProjectLayout) -> UnifiedContext {
        let context = match self.assemble(layout) {
            Ok(context) => context,
            Err(err) => {
                tracing::error!(project = layout.name(), error = %err, "context generation failed");
                return UnifiedContext::failed(layout.name(), &err);
            }
        };

        if let Err(err) = self.store.write(&layout.context_full(), &context, false) {
            tracing::warn!(project = layout.name(), error = %err, "failed to persist context_full.json");
        }
        if self.indexer.enabled() {
            let indexed = self
                .indexer
                .init(layout)
                .and_then(|_| self.indexer.index(layout, &context));
            if let Err(err) = indexed {
                tracing::warn!(project = layout.name(), error = %err, "failed to index unified context");
            }
        }
        tracing::debug!(project = layout.name(), "unified context generated");
        context
    }

    fn assemble(&self, layout: &ProjectLayout) -> Result<UnifiedContext> {
        fs::read_dir(layout.dir())
            .with_context(|| format!("Failed to list project directory {}", layout.dir().display()))?;

        let mut context = UnifiedContext::started(layout.name());
        let config = self
            .store
            .read(&layout.config(), ProjectConfig::default)
            .into_value();
        let memory = memory::load(&self.store, layout).into_value();

        apply_semantics(&mut context, &memory);
        context.readme = self.readme_section(layout, &config);
        context.commits = Some(self.commits_section(layout));
        context.activity = Some(activity_section(&memory));
        context.snapshot = Some(self.snapshot_section(layout));
        context.config = config.without_user_memory();
        context.stats = Some(memory.stats.clone());
        context.user_memory = config.user_memory();
        Ok(context)
    }

    fn readme_section(&self, layout: &ProjectLayout, config: &ProjectConfig) -> Option<ReadmeSection> {
        match readme::refresh_cache(&self.store, layout) {
            Ok(Some(cache)) => Some(ReadmeSection {
                preview: Some(readme::summarize(&cache.content, config.readme_chars()))
                    .filter(|p| !p.is_empty()),
                last_updated: cache.last_updated,
                checksum: Some(cache.checksum),
            }),
            Ok(None) => Some(ReadmeSection::default()),
            Err(err) => {
                tracing::warn!(project = layout.name(), error = %err, "readme section unavailable");
                None
            }
        }
    }

    fn commits_section(&self, layout: &ProjectLayout) -> CommitsSection {
        let history = self.history.load(layout);
        CommitsSection {
            last_commit: history.last_commit,
            recent: history.history.into_iter().take(RECENT_COMMITS).collect(),
        }
    }

    fn snapshot_section(&self, layout: &ProjectLayout) -> SnapshotSection {
        let snapshot = snapshot::load(&self.store, layout).into_value();
        SnapshotSection {
            last_run: snapshot.last_run,
            last_run_status: snapshot.last_run_status,
            status: snapshot.status,
            pending_changes: snapshot.pending_changes,
            last_commit: snapshot.last_commit,
            snapshot_version: snapshot.snapshot_version,
        }
    }
}

fn apply_semantics(context: &mut UnifiedContext, memory: &ProjectMemory) {
    match &memory.semantic_context {
        Some(semantic) => {
            context.description = Some(semantic.description.clone())
                .filter(|d| !d.is_empty())
                .or_else(|| non_empty(&memory.description));
            context.tech_stack = semantic.tech_stack.clone();
            context.keywords = semantic.keywords.clone();
            context.confidence = semantic.confidence_score;
            context.recent_focus = non_empty(&semantic.activity_summary.recent_focus);
        }
        None => context.description = non_empty(&memory.description),
    }
}

fn activity_section(memory: &ProjectMemory) -> ActivitySection {
    let recent_actions = memory
        .recent_actions(RECENT_ACTIONS)
        .map(|a| RecentAction {
            time: a.timestamp.clone(),
            action: a.description.clone(),
            status: a.status(),
        })
        .collect();
    match &memory.semantic_context {
        Some(semantic) => {
            let summary = &semantic.activity_summary;
            ActivitySection {
                total_actions: summary.total_actions,
                recent_focus: non_empty(&summary.recent_focus),
                common_operations: summary.common_operations.clone(),
                error_patterns: summary.error_patterns.clone(),
                recent_actions,
            }
        }
        None => ActivitySection {
            total_actions: memory.stats.total_actions,
            recent_actions,
            ..ActivitySection::default()
        },
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}
