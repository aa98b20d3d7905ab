use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Advisory lock guard on a sidecar `.lock` file.
/// Released on Drop (fs2 unlocks when the fd closes).
pub struct FileLockGuard {
    _file: File, // held open to maintain flock
    lock_path: PathBuf,
}

impl FileLockGuard {
    /// Acquire a blocking exclusive flock on `lock_path`. Callers lock a
    /// sidecar (see [`lock_path_for`]), never a document itself: an atomic
    /// rename over the document would drop the lock.
    pub fn acquire_at(lock_path: PathBuf) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create lock dir {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;

        file.lock_exclusive()
            .with_context(|| format!("Failed to acquire flock on {}", lock_path.display()))?;

        Ok(Self {
            _file: file,
            lock_path,
        })
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Sidecar lock path for a target: `<target>.lock`
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut lock = target.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// The single mutation lock of a workspace: an in-process mutex for threads
/// plus a flock on `<root>/.projctx.lock` for other processes.
pub struct WorkspaceLock {
    local: Mutex<()>,
    lock_path: PathBuf,
}

/// Holds both halves of a [`WorkspaceLock`]. The flock is released first.
pub struct WorkspaceGuard<'a> {
    _flock: FileLockGuard,
    _local: MutexGuard<'a, ()>,
}

impl WorkspaceLock {
    pub fn new(root: &Path) -> Self {
        Self {
            local: Mutex::new(()),
            lock_path: lock_path_for(&root.join(".projctx")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn lock(&self) -> Result<WorkspaceGuard<'_>> {
        let local = self.local.lock();
        let flock = FileLockGuard::acquire_at(self.lock_path.clone())?;
        Ok(WorkspaceGuard {
            _flock: flock,
            _local: local,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[test]
    fn lock_path_for_appends_suffix() {
        let p = Path::new("/tmp/memory.json");
        assert_eq!(lock_path_for(p), PathBuf::from("/tmp/memory.json.lock"));
    }

    #[test]
    fn acquire_creates_sidecar() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("snapshot.json");

        let guard = FileLockGuard::acquire_at(lock_path_for(&target)).unwrap();
        assert!(guard.lock_path().exists());
        assert!(!target.exists());
        drop(guard);
        let _again = FileLockGuard::acquire_at(lock_path_for(&target)).unwrap();
    }

    #[test]
    fn workspace_lock_serializes_threads() {
        let tmp = TempDir::new().unwrap();
        let counter = tmp.path().join("counter.txt");
        fs::write(&counter, "0").unwrap();

        let lock = Arc::new(WorkspaceLock::new(tmp.path()));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    let _guard = lock.lock().unwrap();
                    let val: u32 = fs::read_to_string(&counter)
                        .unwrap()
                        .trim()
                        .parse()
                        .unwrap();
                    fs::write(&counter, (val + 1).to_string()).unwrap();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let final_val: u32 = fs::read_to_string(&counter)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(final_val, 80, "lock must serialize every increment");
        assert!(lock.path().exists());
    }
}
