//! Snapshot engine: one snapshot at a time, installed atomically

use super::format::{SnapshotError, SnapshotMeta};
use super::writer::encode_snapshot;
use crate::keyspace::Database;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info};

/// Proof that the caller holds the snapshot lock
pub struct SnapshotPermit {
    _guard: OwnedMutexGuard<()>,
}

/// Everything a snapshot needs, captured at one point in time
pub struct SnapshotJob {
    pub meta: SnapshotMeta,
    pub databases: Vec<Database>,
    /// Expiry reference time, fixed at capture
    pub now: u64,
}

/// Result of a completed snapshot
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub meta: SnapshotMeta,
    pub payload: Bytes,
}

/// Most recent payload, kept for serving full resyncs
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    pub meta: SnapshotMeta,
    pub payload: Bytes,
}

/// Bookkeeping for `INFO persistence` and `LASTSAVE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveStatus {
    /// Unix seconds of the last successful save
    pub last_save_time: i64,
    pub last_save_ok: bool,
}

/// Owns the snapshot lock and the canonical snapshot path
pub struct SnapshotEngine {
    path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
    cache: Mutex<Option<CachedSnapshot>>,
    status: Mutex<SaveStatus>,
}

impl SnapshotEngine {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            cache: Mutex::new(None),
            status: Mutex::new(SaveStatus {
                last_save_time: chrono::Utc::now().timestamp(),
                last_save_ok: true,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the snapshot lock, or fail with `Busy` if a snapshot is running
    pub fn try_begin(&self) -> Result<SnapshotPermit, SnapshotError> {
        Arc::clone(&self.lock)
            .try_lock_owned()
            .map(|guard| SnapshotPermit { _guard: guard })
            .map_err(|_| SnapshotError::Busy)
    }

    /// Wait for the snapshot lock
    pub async fn begin(&self) -> SnapshotPermit {
        SnapshotPermit {
            _guard: Arc::clone(&self.lock).lock_owned().await,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn status(&self) -> SaveStatus {
        *self.status.lock()
    }

    pub fn cached(&self) -> Option<CachedSnapshot> {
        self.cache.lock().clone()
    }

    /// Drop the cached payload, e.g. when the data set is replaced
    pub fn invalidate_cache(&self) {
        self.cache.lock().take();
    }

    /// Encode and install a snapshot. Blocking.
    ///
    /// A count mismatch while encoding or a failed rename after a complete
    /// write terminate the process. A failed write leaves `<path>.tmp` behind
    /// and the canonical file untouched.
    pub fn run(&self, job: SnapshotJob, _permit: &SnapshotPermit) -> Result<SnapshotOutcome, SnapshotError> {
        let started = Instant::now();
        let payload = match encode_snapshot(&job.databases, &job.meta, job.now) {
            Ok(payload) => payload,
            Err(e @ SnapshotError::CountMismatch { .. }) => crate::fatal("Snapshot encoding bug", &e),
            Err(e) => {
                self.record(false);
                return Err(e);
            }
        };

        let tmp = match write_temp(&self.path, &payload) {
            Ok(tmp) => tmp,
            Err(e) => {
                error!("Snapshot write to {}.tmp failed: {}", self.path.display(), e);
                self.record(false);
                return Err(e);
            }
        };
        if let Err(e) = commit(&tmp, &self.path) {
            crate::fatal("Snapshot rename failed", &e);
        }
        self.record(true);
        info!(
            "Snapshot saved to {} ({} bytes, offset {}) in {:?}",
            self.path.display(),
            payload.len(),
            job.meta.repl_offset,
            started.elapsed()
        );

        *self.cache.lock() = Some(CachedSnapshot {
            meta: job.meta.clone(),
            payload: payload.clone(),
        });

        Ok(SnapshotOutcome {
            meta: job.meta,
            payload,
        })
    }

    fn record(&self, ok: bool) {
        let mut status = self.status.lock();
        status.last_save_ok = ok;
        if ok {
            status.last_save_time = chrono::Utc::now().timestamp();
        }
    }
}

/// Path of the temporary file a snapshot is written to first
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `data` to `<path>.tmp` and fsync it
pub fn write_temp(path: &Path, data: &[u8]) -> Result<PathBuf, SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(tmp)
}

/// Atomically move a fully written temporary file into place
pub fn commit(tmp: &Path, path: &Path) -> Result<(), SnapshotError> {
    std::fs::rename(tmp, path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{now_ms, Keyspace};
    use crate::snapshot::{decode_snapshot, load_snapshot_file};
    use tempfile::TempDir;

    fn keyspace_with(key: &str) -> Keyspace {
        let keyspace = Keyspace::new(1);
        keyspace
            .apply(0, &[Bytes::from("SET"), Bytes::copy_from_slice(key.as_bytes()), Bytes::from("v")])
            .unwrap();
        keyspace
    }

    fn job(keyspace: &Keyspace) -> SnapshotJob {
        SnapshotJob {
            meta: SnapshotMeta::new("r".repeat(40), 42, 3),
            databases: keyspace.clone_view(),
            now: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_second_snapshot_is_rejected_while_one_runs() {
        let temp_dir = TempDir::new().unwrap();
        let engine = SnapshotEngine::new(temp_dir.path().join("dump.tdb"));

        let permit = engine.try_begin().unwrap();
        assert!(engine.in_progress());
        assert!(matches!(engine.try_begin(), Err(SnapshotError::Busy)));
        drop(permit);
        assert!(!engine.in_progress());
        assert!(engine.try_begin().is_ok());
    }

    #[tokio::test]
    async fn test_run_installs_file_and_caches_payload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dump.tdb");
        let engine = SnapshotEngine::new(path.clone());

        let permit = engine.begin().await;
        let outcome = engine.run(job(&keyspace_with("a")), &permit).unwrap();
        drop(permit);

        assert!(!temp_path(&path).exists());
        assert_eq!(std::fs::read(&path).unwrap(), &outcome.payload[..]);
        assert_eq!(decode_snapshot(&outcome.payload, 1, now_ms()).unwrap().keys, 1);

        let cached = engine.cached().unwrap();
        assert_eq!(cached.meta.repl_offset, 42);
        assert_eq!(cached.payload, outcome.payload);
        assert!(engine.status().last_save_ok);

        let loaded = load_snapshot_file(&path, 1, now_ms()).unwrap().unwrap();
        assert_eq!(loaded.meta.wal_segment, 3);
    }


    #[test]
    fn test_interrupted_write_never_touches_canonical_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dump.tdb");

        let first = encode_snapshot(
            &keyspace_with("first").clone_view(),
            &SnapshotMeta::new("r", 0, 0),
            now_ms(),
        )
        .unwrap();
        let tmp = write_temp(&path, &first).unwrap();
        commit(&tmp, &path).unwrap();

        // Stop after the temporary write, before the rename.
        let second = encode_snapshot(
            &keyspace_with("second").clone_view(),
            &SnapshotMeta::new("r", 9, 0),
            now_ms(),
        )
        .unwrap();
        write_temp(&path, &second[..second.len() / 2]).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), &first[..]);
        let loaded = load_snapshot_file(&path, 1, now_ms()).unwrap().unwrap();
        assert_eq!(loaded.meta.repl_offset, 0);
        assert!(temp_path(&path).exists());
    }
}
