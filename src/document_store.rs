use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::clock;
use crate::encoding::decode_text;
use crate::error::{ReadOutcome, ReadStatus};
use crate::write_core::{AtomicWriter, DurabilityMode, WriteOptions, WriteStats};
use crate::write_lock::WorkspaceLock;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub durability: DurabilityMode,
    pub backups_keep: usize,
    pub restore_from_backup: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Durable,
            backups_keep: 5,
            restore_from_backup: true,
        }
    }
}

/// Every mutation of a raw project document goes through here. One lock
/// covers the whole workspace and is held for exactly one call.
pub struct DocumentStore {
    lock: WorkspaceLock,
    writer: AtomicWriter,
    options: StoreOptions,
}

impl DocumentStore {
    pub fn new(root: &Path, options: StoreOptions) -> Self {
        Self {
            lock: WorkspaceLock::new(root),
            writer: AtomicWriter::new(WriteOptions::with_durability(options.durability)),
            options,
        }
    }

    /// Read a JSON document. Missing files, unreadable files and corrupt
    /// files all resolve to a value; the status says which path was taken.
    pub fn read<T, D>(&self, path: &Path, default: D) -> ReadOutcome<T>
    where
        T: DeserializeOwned,
        D: FnOnce() -> T,
    {
        match self.lock.lock() {
            Ok(_guard) => self.read_unlocked(path, default),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "lock unavailable, using default");
                ReadOutcome::new(default(), ReadStatus::Unreadable)
            }
        }
    }

    /// Atomically replace a document. With `backup`, the previous version is
    /// first copied to `<file>.backup_<timestamp>`.
    pub fn write<T: Serialize>(&self, path: &Path, document: &T, backup: bool) -> Result<WriteStats> {
        let _guard = self.lock.lock()?;
        self.write_unlocked(path, document, backup)
    }

    /// Read-modify-write under a single lock acquisition.
    pub fn update<T, D, F, R>(&self, path: &Path, backup: bool, default: D, mutate: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize,
        D: FnOnce() -> T,
        F: FnOnce(&mut T, ReadStatus) -> Result<R>,
    {
        let _guard = self.lock.lock()?;
        let ReadOutcome { mut value, status } = self.read_unlocked(path, default);
        let out = mutate(&mut value, status)?;
        self.write_unlocked(path, &value, backup)?;
        Ok(out)
    }

    /// Append one line to a JSON-Lines file, adding the trailing newline.
    pub fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let _guard = self.lock.lock()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {} for append", path.display()))?;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line.trim_end_matches('\n'));
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        if self.writer.durability() == DurabilityMode::Durable {
            file.sync_data()
                .with_context(|| format!("Failed to sync {}", path.display()))?;
        }
        Ok(())
    }

    /// Read a text file through the decoder chain. `None` when the file is
    /// absent, unreadable, or no decoder accepts it.
    pub fn read_text(&self, path: &Path) -> Option<String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read text file");
                return None;
            }
        };
        match decode_text(&bytes) {
            Some((text, encoding)) => {
                tracing::trace!(path = %path.display(), encoding = encoding.name(), "decoded");
                Some(text)
            }
            None => {
                tracing::warn!(path = %path.display(), "no decoder accepted file, treating as empty");
                None
            }
        }
    }

    /// Run raw file work (rotation, archival) under the store lock.
    pub fn exclusive<R>(&self, work: impl FnOnce(&AtomicWriter) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock()?;
        work(&self.writer)
    }

    /// Backups of `path`, newest first.
    pub fn backups(&self, path: &Path) -> Vec<PathBuf> {
        sidecars(path, ".backup_")
    }

    fn read_unlocked<T, D>(&self, path: &Path, default: D) -> ReadOutcome<T>
    where
        T: DeserializeOwned,
        D: FnOnce() -> T,
    {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return ReadOutcome::new(default(), ReadStatus::Missing)
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "document unreadable, using default");
                return ReadOutcome::new(default(), ReadStatus::Unreadable);
            }
        };

        let parse_err = match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => return ReadOutcome::new(value, ReadStatus::Ok),
            Err(err) => err,
        };

        tracing::warn!(path = %path.display(), error = %parse_err, "corrupt document");
        match self.quarantine(path) {
            Ok(copy) => tracing::warn!(copy = %copy.display(), "corrupt document preserved"),
            Err(err) => tracing::warn!(error = %err, "failed to preserve corrupt document"),
        }

        if self.options.restore_from_backup {
            if let Some(value) = self.restore_latest_backup::<T>(path) {
                return ReadOutcome::new(value, ReadStatus::Restored);
            }
        }
        ReadOutcome::new(default(), ReadStatus::Corrupt)
    }

    fn write_unlocked<T: Serialize>(&self, path: &Path, document: &T, backup: bool) -> Result<WriteStats> {
        let content = serde_json::to_vec_pretty(document)
            .with_context(|| format!("Failed to serialize {}", path.display()))?;

        if backup && path.exists() {
            let backup_path = sidecar_path(path, ".backup_");
            fs::copy(path, &backup_path).with_context(|| {
                format!("Failed to back up {} to {}", path.display(), backup_path.display())
            })?;
            self.prune_backups(path);
        }

        self.writer.write_bytes(path, &content)
    }

    /// Move the bad bytes aside so later reads see a missing file instead of
    /// re-quarantining the same content.
    fn quarantine(&self, path: &Path) -> Result<PathBuf> {
        let copy = sidecar_path(path, ".corrupted_");
        fs::rename(path, &copy).with_context(|| {
            format!("Failed to move {} to {}", path.display(), copy.display())
        })?;
        Ok(copy)
    }

    fn restore_latest_backup<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        for backup in self.backups(path) {
            let Ok(bytes) = fs::read(&backup) else {
                continue;
            };
            let Ok(value) = serde_json::from_slice::<T>(&bytes) else {
                tracing::debug!(backup = %backup.display(), "backup also corrupt");
                continue;
            };
            if let Err(err) = self.writer.write_bytes(path, &bytes) {
                tracing::warn!(error = %err, "restored value not written back");
            }
            tracing::info!(path = %path.display(), backup = %backup.display(), "restored from backup");
            return Some(value);
        }
        None
    }

    fn prune_backups(&self, path: &Path) {
        let keep = self.options.backups_keep.max(1);
        for stale in self.backups(path).into_iter().skip(keep) {
            if let Err(err) = fs::remove_file(&stale) {
                tracing::debug!(backup = %stale.display(), error = %err, "failed to prune backup");
            }
        }
    }
}

fn sidecar_path(path: &Path, marker: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(marker);
    name.push(clock::file_stamp());
    PathBuf::from(name)
}

/// Files named `<file><marker><stamp>` beside `path`, newest first.
fn sidecars(path: &Path, marker: &str) -> Vec<PathBuf> {
    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Vec::new();
    };
    let prefix = format!("{}{}", file_name.to_string_lossy(), marker);
    let Ok(entries) = fs::read_dir(parent) else {
        return Vec::new();
    };
    let mut found: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with(&prefix).then(|| (name, e.path()))
        })
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().map(|(_, p)| p).collect()
}
