#![allow(dead_code)]

use anyhow::Result;
use parking_lot::Mutex;
use projctx::{CommitLogSource, DurabilityMode, Engine, EngineConfig, ExternalCommit};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// In-memory commit log, newest first.
#[derive(Default)]
pub struct FakeLog {
    commits: Mutex<Vec<ExternalCommit>>,
}

impl FakeLog {
    pub fn push(&self, id: &str, message: &str, files: &[&str]) {
        self.commits.lock().insert(
            0,
            ExternalCommit {
                id: id.to_string(),
                message: message.to_string(),
                files: files.iter().map(|f| f.to_string()).collect(),
                committed_at: Some("2024-03-01T12:00:00+01:00".into()),
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

pub struct TestEngine {
    pub tmp: TempDir,
    pub log: Arc<FakeLog>,
    pub engine: Engine,
}

pub fn engine() -> TestEngine {
    engine_with(|_| {})
}

pub fn engine_with(tweak: impl FnOnce(&mut EngineConfig)) -> TestEngine {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = EngineConfig::with_root(tmp.path().join("projects"));
    config.durability = DurabilityMode::Fast;
    tweak(&mut config);
    let log = Arc::new(FakeLog::default());
    let engine = Engine::with_commit_source(config, log.clone()).expect("engine");
    TestEngine { tmp, log, engine }
}

pub fn full_id(n: u32) -> String {
    format!("{n:040x}")
}
