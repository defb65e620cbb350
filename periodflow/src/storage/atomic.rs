//! Crash-safe file writes.

use crate::errors::StorageError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A lock file older than this is assumed to belong to a dead writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(120);

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(format!("creating {}", parent.display()), e))?;
        }
    }
    Ok(())
}

/// Writes `bytes` to `path` via a sibling temp file and a rename.
///
/// Readers observe either the previous content or the new content, never
/// a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    ensure_parent(path)?;
    let temp_path = temp_path_for(path);

    let result = (|| {
        let file = File::create(&temp_path)
            .map_err(|e| StorageError::io(format!("creating {}", temp_path.display()), e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(bytes)
            .map_err(|e| StorageError::io(format!("writing {}", temp_path.display()), e))?;
        let file = writer
            .into_inner()
            .map_err(|e| StorageError::io(format!("flushing {}", temp_path.display()), e.into_error()))?;
        file.sync_all()
            .map_err(|e| StorageError::io(format!("syncing {}", temp_path.display()), e))?;
        fs::rename(&temp_path, path)
            .map_err(|e| StorageError::io(format!("renaming onto {}", path.display()), e))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;

    debug!(path = %path.display(), bytes = bytes.len(), "Atomic write complete");
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StorageError::serialization(format!("encoding {}", path.display()), e))?;
    write_atomic(path, &bytes)
}

/// Appends `bytes` to `path`, creating it if needed, and syncs.
pub fn append_synced(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io(format!("opening {} for append", path.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| StorageError::io(format!("appending to {}", path.display()), e))?;
    file.sync_data()
        .map_err(|e| StorageError::io(format!("syncing {}", path.display()), e))
}

/// An exclusive lock on `target`, held by the existence of a sibling
/// `.lock` file.
///
/// Creation uses `create_new`, so the lock excludes other threads and other
/// processes alike. The file is removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock on `target` is acquired or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `StorageError::Io` with kind `TimedOut` if another writer keeps the
    /// lock for longer than `timeout`.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self, StorageError> {
        ensure_parent(target)?;
        let path = lock_path_for(target);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "Removing stale lock file");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(StorageError::io(
                            format!("waiting for {}", path.display()),
                            io::Error::new(ErrorKind::TimedOut, "lock held by another writer"),
                        ));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(StorageError::io(format!("creating {}", path.display()), e));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.lock"))
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}
