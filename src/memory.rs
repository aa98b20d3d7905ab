use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::clock;
use crate::document_store::DocumentStore;
use crate::error::ReadOutcome;
use crate::layout::ProjectLayout;

pub const MEMORY_VERSION: &str = "1.0";

/// Kind of project action, driving the per-kind counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Commit,
    Execute,
    Analyze,
    Other(String),
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Commit => write!(f, "commit"),
            ActionKind::Execute => write!(f, "execute"),
            ActionKind::Analyze => write!(f, "analyze"),
            ActionKind::Other(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for ActionKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "commit" => ActionKind::Commit,
            "execute" | "run" => ActionKind::Execute,
            "analyze" | "analysis" => ActionKind::Analyze,
            other => ActionKind::Other(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl ActionEntry {
    /// `extra.status` when the producer recorded one, else "ok".
    pub fn status(&self) -> String {
        self.extra
            .as_ref()
            .and_then(|e| e.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("ok")
            .to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub executions: u64,
    pub commits: u64,
    pub analyses: u64,
    pub total_actions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySummary {
    pub total_actions: u64,
    pub recent_focus: String,
    pub common_operations: Vec<String>,
    pub error_patterns: Vec<String>,
}

/// Analysis results attached to a project by an external analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticContext {
    pub description: String,
    pub tech_stack: Vec<String>,
    pub keywords: Vec<String>,
    pub activity_summary: ActivitySummary,
    pub confidence_score: f64,
    pub analyzed_actions_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_analyzed: Option<String>,
}

/// `memory.json`: project metadata, the action log and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectMemory {
    pub project_name: String,
    pub description: String,
    pub created_at: Option<String>,
    pub last_updated: Option<String>,
    pub version: String,
    pub actions: Vec<ActionEntry>,
    pub stats: MemoryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_context: Option<SemanticContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_readme_update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ProjectMemory {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            description: String::new(),
            created_at: None,
            last_updated: None,
            version: MEMORY_VERSION.to_string(),
            actions: Vec::new(),
            stats: MemoryStats::default(),
            semantic_context: None,
            last_readme_update: None,
            last_cleanup: None,
            extra: Map::new(),
        }
    }
}

impl ProjectMemory {
    pub fn new(project_name: &str, description: &str) -> Self {
        let now = clock::now_rfc3339();
        Self {
            project_name: project_name.to_string(),
            description: description.to_string(),
            created_at: Some(now.clone()),
            last_updated: Some(now),
            ..Self::default()
        }
    }

    /// Append an action, bump its counter, and keep only the newest `keep_last`.
    pub fn record(&mut self, kind: &ActionKind, description: &str, extra: Option<Value>, keep_last: usize) {
        let now = clock::now_rfc3339();
        match kind {
            ActionKind::Commit => self.stats.commits += 1,
            ActionKind::Execute => self.stats.executions += 1,
            ActionKind::Analyze => self.stats.analyses += 1,
            ActionKind::Other(_) => {}
        }
        self.stats.total_actions += 1;
        self.actions.push(ActionEntry {
            timestamp: now.clone(),
            kind: kind.to_string(),
            description: description.to_string(),
            extra,
        });
        let keep = keep_last.max(1);
        if self.actions.len() > keep {
            let excess = self.actions.len() - keep;
            self.actions.drain(..excess);
        }
        self.last_updated = Some(now);
    }

    /// The last `n` actions, newest first.
    pub fn recent_actions(&self, n: usize) -> impl Iterator<Item = &ActionEntry> {
        self.actions.iter().rev().take(n)
    }
}

/// Load `memory.json`, defaulting to an empty memory named after the project.
pub fn load(store: &DocumentStore, layout: &ProjectLayout) -> ReadOutcome<ProjectMemory> {
    store
        .read(&layout.memory(), || default_for(layout))
        .map(|mut memory| {
            if memory.project_name.is_empty() {
                memory.project_name = layout.name().to_string();
            }
            memory
        })
}

pub fn save(store: &DocumentStore, layout: &ProjectLayout, memory: &ProjectMemory) -> Result<()> {
    store.write(&layout.memory(), memory, true)?;
    Ok(())
}

/// Record one action as a locked read-modify-write. Returns the memory as written.
pub fn record_action(
    store: &DocumentStore,
    layout: &ProjectLayout,
    kind: &ActionKind,
    description: &str,
    extra: Option<Value>,
    keep_last: usize,
) -> Result<ProjectMemory> {
    store.update(
        &layout.memory(),
        false,
        || default_for(layout),
        |memory: &mut ProjectMemory, _| {
            if memory.project_name.is_empty() {
                memory.project_name = layout.name().to_string();
            }
            memory.record(kind, description, extra, keep_last);
            Ok(memory.clone())
        },
    )
}

pub fn set_semantic_context(
    store: &DocumentStore,
    layout: &ProjectLayout,
    mut context: SemanticContext,
) -> Result<()> {
    store.update(
        &layout.memory(),
        true,
        || default_for(layout),
        |memory: &mut ProjectMemory, _| {
            if context.last_analyzed.is_none() {
                context.last_analyzed = Some(clock::now_rfc3339());
            }
            context.analyzed_actions_count = memory.stats.total_actions;
            if memory.description.is_empty() && !context.description.is_empty() {
                memory.description = context.description.clone();
            }
            memory.semantic_context = Some(context);
            memory.last_updated = Some(clock::now_rfc3339());
            Ok(())
        },
    )
}

fn default_for(layout: &ProjectLayout) -> ProjectMemory {
    ProjectMemory {
        project_name: layout.name().to_string(),
        ..ProjectMemory::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::StoreOptions;
    use crate::error::ReadStatus;
    use crate::layout::Workspace;
    use crate::write_core::DurabilityMode;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DocumentStore, ProjectLayout) {
        let tmp = TempDir::new().unwrap();
        let store = DocumentStore::new(
            tmp.path(),
            StoreOptions {
                durability: DurabilityMode::Fast,
                ..StoreOptions::default()
            },
        );
        let layout = Workspace::new(tmp.path(), ".projctx").project("demo").unwrap();
        (tmp, store, layout)
    }

    #[test]
    fn action_kind_parses_aliases() {
        assert_eq!("RUN".parse::<ActionKind>().unwrap(), ActionKind::Execute);
        assert_eq!("commit".parse::<ActionKind>().unwrap(), ActionKind::Commit);
        assert_eq!(
            "deploy".parse::<ActionKind>().unwrap(),
            ActionKind::Other("deploy".into())
        );
        assert_eq!(ActionKind::Analyze.to_string(), "analyze");
    }

    #[test]
    fn record_counts_and_caps_actions() {
        let mut memory = ProjectMemory::new("demo", "");
        for i in 0..5 {
            memory.record(&ActionKind::Execute, &format!("run {i}"), None, 3);
        }
        memory.record(&ActionKind::Commit, "commit", None, 3);

        assert_eq!(memory.stats.executions, 5);
        assert_eq!(memory.stats.commits, 1);
        assert_eq!(memory.stats.total_actions, 6);
        assert_eq!(memory.actions.len(), 3);
        assert_eq!(memory.actions[0].description, "run 3");
        let newest: Vec<_> = memory.recent_actions(2).map(|a| a.description.as_str()).collect();
        assert_eq!(newest, vec!["commit", "run 4"]);
    }

    #[test]
    fn status_defaults_to_ok() {
        let mut entry = ActionEntry::default();
        assert_eq!(entry.status(), "ok");
        entry.extra = Some(json!({"status": "failed"}));
        assert_eq!(entry.status(), "failed");
    }

    #[test]
    fn corrupt_memory_loads_default_with_project_name() {
        let (_tmp, store, layout) = setup();
        std::fs::create_dir_all(layout.state_dir()).unwrap();
        std::fs::write(layout.memory(), "{\"actions\": [").unwrap();

        let out = load(&store, &layout);
        assert_eq!(out.status, ReadStatus::Corrupt);
        assert_eq!(out.value.project_name, "demo");
        assert!(out.value.actions.is_empty());
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let (_tmp, store, layout) = setup();
        std::fs::create_dir_all(layout.state_dir()).unwrap();
        std::fs::write(
            layout.memory(),
            r#"{"project_name":"demo","documentation":{"readme":"x"},"actions":[]}"#,
        )
        .unwrap();

        record_action(&store, &layout, &ActionKind::Analyze, "scan", None, 100).unwrap();
        let memory = load(&store, &layout).into_value();
        assert_eq!(memory.extra.get("documentation"), Some(&json!({"readme": "x"})));
        assert_eq!(memory.stats.analyses, 1);
    }

    #[test]
    fn semantic_context_records_action_count() {
        let (_tmp, store, layout) = setup();
        record_action(&store, &layout, &ActionKind::Execute, "a", None, 100).unwrap();
        record_action(&store, &layout, &ActionKind::Execute, "b", None, 100).unwrap();
        set_semantic_context(
            &store,
            &layout,
            SemanticContext {
                description: "A CLI tool".into(),
                tech_stack: vec!["rust".into()],
                ..SemanticContext::default()
            },
        )
        .unwrap();

        let memory = load(&store, &layout).into_value();
        let ctx = memory.semantic_context.unwrap();
        assert_eq!(ctx.analyzed_actions_count, 2);
        assert!(ctx.last_analyzed.is_some());
        assert_eq!(memory.description, "A CLI tool");
    }
}
