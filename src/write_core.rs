use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, Metadata};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// fsync the temp file before rename and the directory after.
    #[default]
    Durable,
    /// Rename only. Atomic against crashes of this process, not power loss.
    Fast,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub durability: DurabilityMode,
    pub buffer_size: usize,
    pub preserve_permissions: bool,
    pub idempotent_skip: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Durable,
            buffer_size: 64 * 1024,
            preserve_permissions: true,
            idempotent_skip: true,
        }
    }
}

impl WriteOptions {
    pub fn durable() -> Self {
        Self::default()
    }

    pub fn fast() -> Self {
        Self {
            durability: DurabilityMode::Fast,
            ..Self::default()
        }
    }

    pub fn with_durability(durability: DurabilityMode) -> Self {
        Self {
            durability,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteStats {
    pub bytes_written: u64,
    pub fsync_count: u32,
    pub rename_count: u32,
    pub elapsed: Duration,
    pub skipped_unchanged: bool,
    pub durability: DurabilityMode,
}

impl WriteStats {
    fn skipped(durability: DurabilityMode, start: Instant) -> Self {
        Self {
            bytes_written: 0,
            fsync_count: 0,
            rename_count: 0,
            elapsed: start.elapsed(),
            skipped_unchanged: true,
            durability,
        }
    }
}

/// Replaces files through a temp file in the same directory followed by a
/// rename, so readers observe either the old or the new content.
#[derive(Debug, Clone)]
pub struct AtomicWriter {
    options: WriteOptions,
}

impl AtomicWriter {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    pub fn durability(&self) -> DurabilityMode {
        self.options.durability
    }

    pub fn write_str(&self, path: &Path, content: &str) -> Result<WriteStats> {
        self.write_bytes(path, content.as_bytes())
    }

    pub fn write_bytes(&self, path: &Path, content: &[u8]) -> Result<WriteStats> {
        let start = Instant::now();
        let existing_meta = stat(path)?;

        if self.options.idempotent_skip {
            if let Some(meta) = existing_meta.as_ref() {
                if meta.len() == content.len() as u64 && file_equals_bytes(path, content)? {
                    return Ok(WriteStats::skipped(self.options.durability, start));
                }
            }
        }

        self.replace(path, existing_meta.as_ref(), start, |out| {
            out.write_all(content)
                .with_context(|| format!("Failed to write {} bytes to temp file", content.len()))?;
            Ok(content.len() as u64)
        })
    }

    /// Streams new content into the temp file through `fill`, which returns the
    /// number of bytes it wrote. If `fill` fails the target is left untouched
    /// and the temp file is removed.
    pub fn write_with<F>(&self, path: &Path, fill: F) -> Result<WriteStats>
    where
        F: FnOnce(&mut dyn Write) -> Result<u64>,
    {
        let start = Instant::now();
        let existing_meta = stat(path)?;
        self.replace(path, existing_meta.as_ref(), start, fill)
    }

    fn replace<F>(
        &self,
        path: &Path,
        existing_meta: Option<&Metadata>,
        start: Instant,
        fill: F,
    ) -> Result<WriteStats>
    where
        F: FnOnce(&mut dyn Write) -> Result<u64>,
    {
        let parent = path.parent().with_context(|| {
            format!(
                "Cannot write to {}: path has no parent directory",
                path.display()
            )
        })?;
        // Relative paths like "memory.json" yield parent=""; normalize to ".".
        let parent: &Path = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };

        let mut fsync_count = 0u32;

        if existing_meta.is_none() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create parent directory for {}", path.display())
            })?;
        }

        let mut temp_file = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;

        let bytes_written = {
            let mut writer =
                BufWriter::with_capacity(self.options.buffer_size.max(1), temp_file.as_file_mut());
            let written = fill(&mut writer)?;
            writer.flush().context("Failed to flush temp file")?;
            written
        };

        if self.options.preserve_permissions {
            if let Some(meta) = existing_meta {
                fs::set_permissions(temp_file.path(), meta.permissions()).with_context(|| {
                    format!(
                        "Failed to preserve permissions while writing {}",
                        path.display()
                    )
                })?;
            }
        }

        if self.options.durability == DurabilityMode::Durable {
            temp_file
                .as_file()
                .sync_data()
                .with_context(|| format!("Failed to sync temp data for {}", path.display()))?;
            fsync_count += 1;
        }

        temp_file.persist(path).map_err(|e| {
            anyhow::Error::new(e.error)
                .context(format!("Failed to atomically replace {}", path.display()))
        })?;

        if self.options.durability == DurabilityMode::Durable {
            fsync_parent_dir(parent)
                .with_context(|| format!("Failed to sync parent dir {}", parent.display()))?;
            fsync_count += 1;
        }

        Ok(WriteStats {
            bytes_written,
            fsync_count,
            rename_count: 1,
            elapsed: start.elapsed(),
            skipped_unchanged: false,
            durability: self.options.durability,
        })
    }
}

fn stat(path: &Path) -> Result<Option<Metadata>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

fn file_equals_bytes(path: &Path, expected: &[u8]) -> Result<bool> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to read existing file {}", path.display()))?;
    let mut buf = [0u8; 8192];
    let mut offset = 0usize;

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read existing file {}", path.display()))?;
        if n == 0 {
            return Ok(offset == expected.len());
        }
        if offset + n > expected.len() {
            return Ok(false);
        }
        if expected.get(offset..offset + n) != Some(&buf[..n]) {
            return Ok(false);
        }
        offset += n;
    }
}

/// fsync a directory so a completed rename survives power loss.
#[cfg(unix)]
pub fn fsync_parent_dir(parent: &Path) -> Result<()> {
    let dir = File::open(parent)
        .with_context(|| format!("Failed to open parent dir {}", parent.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync parent dir {}", parent.display()))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn fsync_parent_dir(_parent: &Path) -> Result<()> {
    Ok(())
}
