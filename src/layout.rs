use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LayoutError;

pub const MEMORY_FILE: &str = "memory.json";
pub const COMMIT_HISTORY_FILE: &str = "commit_history.json";
pub const LEGACY_COMMIT_REPORT_FILE: &str = "commit_report.json";
pub const LEGACY_COMMIT_LOG_FILE: &str = "commit_history.jsonl";
pub const CONTEXT_FULL_FILE: &str = "context_full.json";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const CONFIG_FILE: &str = "config.json";
pub const EVENTS_LOG_FILE: &str = "events.log";
pub const INDEX_DB_FILE: &str = "context.db";
pub const README_CACHE_FILE: &str = "readme_cache.json";
pub const LOGS_DIR: &str = "logs";
/// Ledger key for the run-log directory as a whole.
pub const RUN_LOGS_SOURCE: &str = "logs/run_*.json";

const ARCHIVE_DIR: &str = ".archive";
const MAX_PROJECT_NAME_LEN: usize = 128;

/// Root directory containing every project.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    state_dir: String,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, state_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir_name(&self) -> &str {
        &self.state_dir
    }

    pub fn archive_root(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    /// Layout for `name`, validated but not required to exist.
    pub fn project(&self, name: &str) -> Result<ProjectLayout, LayoutError> {
        validate_project_name(name)?;
        let dir = self.root.join(name);
        let state = dir.join(&self.state_dir);
        Ok(ProjectLayout {
            name: name.to_string(),
            dir,
            state,
            state_dir_name: self.state_dir.clone(),
        })
    }

    /// Layout for `name`, failing when the project directory is absent.
    pub fn existing_project(&self, name: &str) -> Result<ProjectLayout, LayoutError> {
        let layout = self.project(name)?;
        if !layout.dir.is_dir() {
            return Err(LayoutError::ProjectNotFound(name.to_string()));
        }
        Ok(layout)
    }

    /// Layout of the project whose state directory directly holds `path`.
    pub fn owning_project(&self, path: &Path) -> Option<ProjectLayout> {
        let state = path.parent()?;
        if state.file_name()? != self.state_dir.as_str() {
            return None;
        }
        let dir = state.parent()?;
        if dir.parent()? != self.root {
            return None;
        }
        self.project(dir.file_name()?.to_str()?).ok()
    }

    /// Names of live projects, sorted. Hidden directories are skipped.
    pub fn list_projects(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", self.root.display()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_project_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Paths of one project's directory and state files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    name: String,
    dir: PathBuf,
    state: PathBuf,
    state_dir_name: String,
}

impl ProjectLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The project directory (README, `.git`).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The state directory inside the project.
    pub fn state_dir(&self) -> &Path {
        &self.state
    }

    pub fn state_dir_name(&self) -> &str {
        &self.state_dir_name
    }

    pub fn state_file(&self, file_name: &str) -> PathBuf {
        self.state.join(file_name)
    }

    pub fn memory(&self) -> PathBuf {
        self.state_file(MEMORY_FILE)
    }
    pub fn commit_history(&self) -> PathBuf {
        self.state_file(COMMIT_HISTORY_FILE)
    }
    pub fn legacy_commit_report(&self) -> PathBuf {
        self.state_file(LEGACY_COMMIT_REPORT_FILE)
    }
    pub fn legacy_commit_log(&self) -> PathBuf {
        self.state_file(LEGACY_COMMIT_LOG_FILE)
    }
    pub fn context_full(&self) -> PathBuf {
        self.state_file(CONTEXT_FULL_FILE)
    }
    pub fn snapshot(&self) -> PathBuf {
        self.state_file(SNAPSHOT_FILE)
    }
    pub fn config(&self) -> PathBuf {
        self.state_file(CONFIG_FILE)
    }
    pub fn events_log(&self) -> PathBuf {
        self.state_file(EVENTS_LOG_FILE)
    }
    pub fn index_db(&self) -> PathBuf {
        self.state_file(INDEX_DB_FILE)
    }
    pub fn readme_cache(&self) -> PathBuf {
        self.state_file(README_CACHE_FILE)
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.state_file(LOGS_DIR)
    }

    pub fn has_git(&self) -> bool {
        self.dir.join(".git").exists()
    }

    /// The project README, matched case-insensitively among common names.
    pub fn readme(&self) -> Option<PathBuf> {
        ["README.md", "readme.md", "Readme.md", "README.markdown", "README"]
            .iter()
            .map(|name| self.dir.join(name))
            .find(|path| path.is_file())
    }

    /// `logs/run_*.json`, sorted by name (oldest first for timestamped names).
    pub fn run_logs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.logs_dir()) else {
            return Vec::new();
        };
        let mut logs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("run_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        logs.sort();
        logs
    }
}

/// Project names become directory names: no separators, no leading dot.
pub fn validate_project_name(name: &str) -> Result<(), LayoutError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_PROJECT_NAME_LEN
        && !name.starts_with('.')
        && name.trim() == name
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));
    if valid {
        Ok(())
    } else {
        Err(LayoutError::InvalidProjectName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_traversal_and_hidden_names() {
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", ".hidden", " padded", "x\0y"] {
            assert!(validate_project_name(bad).is_err(), "{bad:?} accepted");
        }
        for good in ["demo", "my-app_2", "v1.2", "Two Words"] {
            assert!(validate_project_name(good).is_ok(), "{good:?} rejected");
        }
    }

    #[test]
    fn state_files_live_under_state_dir() {
        let ws = Workspace::new("/srv/projects", ".projctx");
        let layout = ws.project("demo").unwrap();
        assert_eq!(layout.dir(), Path::new("/srv/projects/demo"));
        assert_eq!(
            layout.memory(),
            PathBuf::from("/srv/projects/demo/.projctx/memory.json")
        );
        assert_eq!(
            layout.index_db(),
            PathBuf::from("/srv/projects/demo/.projctx/context.db")
        );
        assert_eq!(ws.archive_root(), PathBuf::from("/srv/projects/.archive"));
    }

    #[test]
    fn list_skips_archive_and_files() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path(), ".projctx");
        fs::create_dir_all(tmp.path().join("beta")).unwrap();
        fs::create_dir_all(tmp.path().join("alpha")).unwrap();
        fs::create_dir_all(ws.archive_root()).unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        assert_eq!(ws.list_projects().unwrap(), vec!["alpha", "beta"]);
        assert!(ws.existing_project("gamma").is_err());
        assert!(ws.existing_project("alpha").is_ok());
    }

    #[test]
    fn run_logs_are_filtered_and_sorted() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path(), ".projctx");
        let layout = ws.project("demo").unwrap();
        fs::create_dir_all(layout.logs_dir()).unwrap();
        fs::write(layout.logs_dir().join("run_2.json"), "{}").unwrap();
        fs::write(layout.logs_dir().join("run_1.json"), "{}").unwrap();
        fs::write(layout.logs_dir().join("other.log"), "").unwrap();

        let names: Vec<String> = layout
            .run_logs()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["run_1.json", "run_2.json"]);
    }
}
