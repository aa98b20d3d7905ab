use std::path::PathBuf;
use thiserror::Error;

/// Errors callers branch on when resolving projects inside the workspace.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("invalid project name {0:?}: use letters, digits, '-', '_', '.' or spaces, not starting with '.'")]
    InvalidProjectName(String),
    #[error("project {0} does not exist")]
    ProjectNotFound(String),
    #[error("project {0} already exists")]
    ProjectExists(String),
}

/// Errors raised by the relational index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("schema version mismatch in {}: database has {found}, engine expects {expected}", db.display())]
    SchemaMismatch {
        db: PathBuf,
        found: String,
        expected: String,
    },
}

/// How a document read resolved. Reads never fail outright; the status says
/// which fallback produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Parsed from the file on disk.
    Ok,
    /// File absent, default returned.
    Missing,
    /// File was corrupt; value restored from the newest parseable backup.
    Restored,
    /// File was corrupt and no backup parsed; default returned.
    Corrupt,
    /// File exists but could not be read (permissions, transient I/O).
    Unreadable,
}

#[derive(Debug, Clone)]
pub struct ReadOutcome<T> {
    pub value: T,
    pub status: ReadStatus,
}

impl<T> ReadOutcome<T> {
    pub fn new(value: T, status: ReadStatus) -> Self {
        Self { value, status }
    }

    /// True when a file existed at the path, whatever its condition.
    pub fn found(&self) -> bool {
        self.status != ReadStatus::Missing
    }

    /// True when the value came from a parseable copy (primary or backup).
    pub fn is_parsed(&self) -> bool {
        matches!(self.status, ReadStatus::Ok | ReadStatus::Restored)
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadOutcome<U> {
        ReadOutcome {
            value: f(self.value),
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_is_not_found_but_corrupt_is() {
        let missing = ReadOutcome::new(0u8, ReadStatus::Missing);
        assert!(!missing.found());
        assert!(!missing.is_parsed());

        let corrupt = ReadOutcome::new(0u8, ReadStatus::Corrupt);
        assert!(corrupt.found());
        assert!(!corrupt.is_parsed());

        let restored = ReadOutcome::new(1u8, ReadStatus::Restored).map(|v| v + 1);
        assert!(restored.is_parsed());
        assert_eq!(restored.into_value(), 2);
    }

    #[test]
    fn schema_mismatch_message_names_both_versions() {
        let err = IndexError::SchemaMismatch {
            db: PathBuf::from("/tmp/context.db"),
            found: "0.9".into(),
            expected: "1.0".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.9"));
        assert!(msg.contains("1.0"));
    }
}
