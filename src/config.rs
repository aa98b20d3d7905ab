use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::write_core::DurabilityMode;

/// Engine-wide settings, read from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one sub-directory per project.
    #[serde(default = "EngineConfig::default_projects_root")]
    pub projects_root: PathBuf,
    /// Name of the per-project state directory.
    #[serde(default = "EngineConfig::default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub durability: DurabilityMode,
    /// Backups kept per document when a write asks for one.
    #[serde(default = "EngineConfig::default_backups_keep")]
    pub backups_keep: usize,
    /// Restore a corrupt document from its newest parseable backup.
    #[serde(default = "bool_true")]
    pub restore_from_backup: bool,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

fn bool_true() -> bool {
    true
}

impl EngineConfig {
    fn default_projects_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("projctx")
            .join("projects")
    }
    fn default_state_dir() -> String {
        ".projctx".into()
    }
    fn default_backups_keep() -> usize {
        5
    }

    /// Defaults rooted at `projects_root`.
    pub fn with_root(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
            ..Self::default()
        }
    }

    /// Load from the default location, then apply `PROJCTX_*` overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&get_config_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from an environment lookup. Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PROJCTX_PROJECTS_ROOT") {
            self.projects_root = PathBuf::from(root);
        }
        if let Some(mode) = lookup("PROJCTX_DURABILITY") {
            match mode.to_ascii_lowercase().as_str() {
                "durable" => self.durability = DurabilityMode::Durable,
                "fast" => self.durability = DurabilityMode::Fast,
                _ => {}
            }
        }
        if let Some(v) = parse_env(&lookup, "PROJCTX_MEMORY_MAX_ENTRIES") {
            self.limits.memory_max_entries = v;
        }
        if let Some(v) = parse_env(&lookup, "PROJCTX_MEMORY_MAX_SIZE_MB") {
            self.limits.memory_max_size_mb = v;
        }
        if let Some(v) = parse_env(&lookup, "PROJCTX_JSON_MAX_SIZE_MB") {
            self.limits.json_max_size_mb = v;
        }
        if let Some(v) = parse_env(&lookup, "PROJCTX_LOG_MAX_SIZE_MB") {
            self.limits.log_max_size_mb = v;
        }
        if let Some(v) = parse_env(&lookup, "PROJCTX_EVENTS_MAX_ENTRIES") {
            self.limits.events_max_entries = v;
        }
        if lookup("PROJCTX_TEST_MODE").is_some_and(|v| v == "1" || v == "true") {
            self.limits = LimitsConfig::test_mode();
        }
    }
}

fn parse_env<T: std::str::FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            projects_root: Self::default_projects_root(),
            state_dir: Self::default_state_dir(),
            durability: DurabilityMode::default(),
            backups_keep: Self::default_backups_keep(),
            restore_from_backup: true,
            limits: LimitsConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

/// FIFO retention thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "LimitsConfig::default_memory_max_entries")]
    pub memory_max_entries: usize,
    #[serde(default = "LimitsConfig::default_memory_max_size_mb")]
    pub memory_max_size_mb: f64,
    /// Threshold for the other state JSON documents (trimmed together).
    #[serde(default = "LimitsConfig::default_json_max_size_mb")]
    pub json_max_size_mb: f64,
    #[serde(default = "LimitsConfig::default_log_max_size_mb")]
    pub log_max_size_mb: f64,
    #[serde(default = "LimitsConfig::default_log_max_entries")]
    pub log_max_entries: usize,
    #[serde(default = "LimitsConfig::default_events_max_size_mb")]
    pub events_max_size_mb: f64,
    #[serde(default = "LimitsConfig::default_events_max_entries")]
    pub events_max_entries: usize,
    /// Actions kept by every memory write, independent of maintenance.
    #[serde(default = "LimitsConfig::default_action_log_cap")]
    pub action_log_cap: usize,
}

impl LimitsConfig {
    fn default_memory_max_entries() -> usize {
        300
    }
    fn default_memory_max_size_mb() -> f64 {
        5.0
    }
    fn default_json_max_size_mb() -> f64 {
        3.0
    }
    fn default_log_max_size_mb() -> f64 {
        3.0
    }
    fn default_log_max_entries() -> usize {
        10_000
    }
    fn default_events_max_size_mb() -> f64 {
        10.0
    }
    fn default_events_max_entries() -> usize {
        1000
    }
    fn default_action_log_cap() -> usize {
        100
    }

    /// Small limits so rotation can be exercised quickly.
    pub fn test_mode() -> Self {
        Self {
            memory_max_size_mb: 0.2,
            json_max_size_mb: 0.2,
            log_max_size_mb: 0.2,
            events_max_size_mb: 0.2,
            ..Self::default()
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: Self::default_memory_max_entries(),
            memory_max_size_mb: Self::default_memory_max_size_mb(),
            json_max_size_mb: Self::default_json_max_size_mb(),
            log_max_size_mb: Self::default_log_max_size_mb(),
            log_max_entries: Self::default_log_max_entries(),
            events_max_size_mb: Self::default_events_max_size_mb(),
            events_max_entries: Self::default_events_max_entries(),
            action_log_cap: Self::default_action_log_cap(),
        }
    }
}

/// Relational index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Mirror generated context into SQLite.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "IndexConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "IndexConfig::default_max_retries")]
    pub max_retries: u32,
}

impl IndexConfig {
    fn default_busy_timeout_ms() -> u64 {
        2500
    }
    fn default_max_retries() -> u32 {
        3
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            busy_timeout_ms: Self::default_busy_timeout_ms(),
            max_retries: Self::default_max_retries(),
        }
    }
}

fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("projctx").join("config.toml")
}

// ── Per-project config.json ─────────────────────────────────────────────────

pub const DEFAULT_README_CHARS: usize = 1400;
pub const MIN_README_CHARS: usize = 500;
pub const MAX_README_CHARS: usize = 5000;
pub const DEFAULT_MAX_COMMITS: usize = 3;

/// Free-form notes a user attaches to a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMemory {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// View over a project's `config.json`. Keys are kept verbatim so unknown
/// settings survive a round-trip; typed accessors fall back to defaults on
/// absent or ill-typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectConfig {
    raw: Map<String, Value>,
}

impl ProjectConfig {
    pub fn from_map(raw: Map<String, Value>) -> Self {
        Self { raw }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// README preview budget, clamped to [500, 5000].
    pub fn readme_chars(&self) -> usize {
        self.raw
            .get("readme_chars")
            .and_then(as_usize)
            .unwrap_or(DEFAULT_README_CHARS)
            .clamp(MIN_README_CHARS, MAX_README_CHARS)
    }

    /// Commit history bound, at least 1.
    pub fn max_commits(&self) -> usize {
        self.raw
            .get("commit_history")
            .and_then(|v| v.get("max_commits"))
            .and_then(as_usize)
            .unwrap_or(DEFAULT_MAX_COMMITS)
            .max(1)
    }

    pub fn memory_max_entries(&self) -> Option<usize> {
        self.raw
            .get("memory")
            .and_then(|v| v.get("max_entries"))
            .and_then(as_usize)
    }

    pub fn memory_max_size_mb(&self) -> Option<f64> {
        self.raw
            .get("memory")
            .and_then(|v| v.get("max_size_mb"))
            .and_then(Value::as_f64)
            .filter(|v| *v > 0.0)
    }

    pub fn user_memory(&self) -> Option<UserMemory> {
        self.raw
            .get("user_memory")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_user_memory(&mut self, memory: &UserMemory) -> Result<()> {
        let value = serde_json::to_value(memory).context("Failed to encode user_memory")?;
        self.raw.insert("user_memory".into(), value);
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.raw.insert(key.to_string(), value);
    }

    /// Config as exposed in the unified context: everything but `user_memory`.
    pub fn without_user_memory(&self) -> Map<String, Value> {
        let mut map = self.raw.clone();
        map.remove("user_memory");
        map
    }
}

fn as_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64))
            .map(|v| v as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
