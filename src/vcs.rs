use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// One commit as reported by the external version-control log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommit {
    pub id: String,
    pub message: String,
    pub files: Vec<String>,
    pub committed_at: Option<String>,
}

/// Source of commit facts for a project directory.
pub trait CommitLogSource: Send + Sync {
    /// Full id of the current head, or `None` when the directory has no repository or no commits.
    fn head(&self, repo: &Path) -> Result<Option<String>>;

    /// The most recent `limit` commits, newest first.
    fn recent(&self, repo: &Path, limit: usize) -> Result<Vec<ExternalCommit>>;
}

const RECORD_SEP: char = '\u{1e}';
const FIELD_SEP: char = '\u{1f}';

/// `git` binary on PATH.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    fn git(repo: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo);
        cmd
    }
}

impl CommitLogSource for GitCli {
    fn head(&self, repo: &Path) -> Result<Option<String>> {
        if !repo.join(".git").exists() {
            return Ok(None);
        }
        let output = Self::git(repo)
            .args(["rev-parse", "--verify", "-q", "HEAD"])
            .output()
            .context("Failed to run git rev-parse")?;
        if !output.status.success() {
            return Ok(None);
        }
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!head.is_empty()).then_some(head))
    }

    fn recent(&self, repo: &Path, limit: usize) -> Result<Vec<ExternalCommit>> {
        if !repo.join(".git").exists() || limit == 0 {
            return Ok(Vec::new());
        }
        let output = Self::git(repo)
            .arg("log")
            .arg(format!("-n{limit}"))
            .arg("--name-only")
            .arg("--pretty=format:%x1e%H%x1f%cI%x1f%s")
            .output()
            .context("Failed to run git log")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // empty repository
            if stderr.contains("does not have any commits") {
                return Ok(Vec::new());
            }
            anyhow::bail!("git log failed: {}", stderr.trim());
        }
        Ok(parse_log(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `git log --name-only --pretty=format:%x1e%H%x1f%cI%x1f%s` output.
pub fn parse_log(output: &str) -> Vec<ExternalCommit> {
    output
        .split(RECORD_SEP)
        .filter_map(|record| {
            let mut lines = record.lines();
            let header = lines.next()?;
            let mut fields = header.splitn(3, FIELD_SEP);
            let id = fields.next()?.trim().to_string();
            if id.is_empty() {
                return None;
            }
            let committed_at = fields
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let message = fields.next().unwrap_or("").trim().to_string();
            let files = lines
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            Some(ExternalCommit {
                id,
                message,
                files,
                committed_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_multiple_commits_with_files() {
        let raw = "\u{1e}aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\u{1f}2024-05-01T10:00:00+02:00\u{1f}feat: add parser\nsrc/parser.rs\nsrc/lib.rs\n\n\u{1e}bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\u{1f}2024-04-30T09:00:00+02:00\u{1f}init\nREADME.md\n";
        let commits = parse_log(raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "feat: add parser");
        assert_eq!(commits[0].files, vec!["src/parser.rs", "src/lib.rs"]);
        assert_eq!(
            commits[0].committed_at.as_deref(),
            Some("2024-05-01T10:00:00+02:00")
        );
        assert_eq!(commits[1].files, vec!["README.md"]);
    }

    #[test]
    fn subject_may_contain_pipes_and_commit_may_have_no_files() {
        let raw = "\u{1e}cccc\u{1f}\u{1f}fix: a | b | c";
        let commits = parse_log(raw);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].message, "fix: a | b | c");
        assert!(commits[0].files.is_empty());
        assert!(commits[0].committed_at.is_none());
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_log("").is_empty());
        assert!(parse_log("\n\n").is_empty());
    }

    #[test]
    fn directory_without_repository_has_no_head() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(GitCli.head(tmp.path()).unwrap(), None);
        assert!(GitCli.recent(tmp.path(), 3).unwrap().is_empty());
    }
}
