//! Version metadata store.
//!
//! One fixed-size record per tracked path, persisted in a sidecar file
//! (`.<name>.tsmeta`) beside the tracked file. All access goes through a
//! `Lease`, which holds an exclusive OS file lock on the sidecar for the
//! duration of one operation. The lease persists its record and drops the
//! lock on every exit path, including unwinding and early `?` returns.

pub mod record;

pub use record::{
    CommitRejection, FileVersionRecord, RemoteObservation, SyncState, RECORD_SIZE,
};

use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Sidecar file suffix
pub const META_SUFFIX: &str = ".tsmeta";

/// Suffix of in-flight transfer staging files
pub const STAGING_SUFFIX: &str = ".tsstage";

/// Longest relative path accepted, in bytes
pub const MAX_PATH_LEN: usize = 4096;

const LOCK_BACKOFF_START: Duration = Duration::from_millis(1);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SyncError::InvalidPath("empty path not allowed".into()));
    }
    if relative.len() > MAX_PATH_LEN {
        return Err(SyncError::InvalidPath(format!(
            "path of {} bytes exceeds {}",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(SyncError::InvalidPath(format!(
            "absolute paths not allowed: {}",
            relative
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(SyncError::InvalidPath(format!(
                    "path traversal not allowed: {}",
                    relative
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(SyncError::InvalidPath(format!(
                    "prefix paths not allowed: {}",
                    relative
                )));
            }
            _ => {}
        }
    }

    let name = rel_path
        .file_name()
        .map(|n| n.to_string_lossy())
        .ok_or_else(|| SyncError::InvalidPath(format!("no file name: {}", relative)))?;
    if name.ends_with(META_SUFFIX) || name.ends_with(STAGING_SUFFIX) {
        return Err(SyncError::InvalidPath(format!(
            "reserved file name: {}",
            relative
        )));
    }

    Ok(root.join(rel_path))
}

/// Sidecar path holding the version record for `file`.
pub fn sidecar_path(file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file.with_file_name(format!(".{}{}", name, META_SUFFIX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Exclusive,
    Shared,
}

/// Store of version records under one tree root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
    lock_timeout: Option<Duration>,
}

impl MetadataStore {
    /// Store rooted at `root`. Lease acquisition waits indefinitely.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: None,
        }
    }

    /// Bound lease acquisition; `Duration::ZERO` means try once.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of a tracked file.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        validate_path(&self.root, rel)
    }

    /// Acquire the exclusive lease on `rel`'s record, creating the record as
    /// `{base: 0, client: 0, Synced}` if absent.
    pub fn open(&self, rel: &str) -> Result<Lease> {
        let file_path = self.resolve(rel)?;
        let meta_path = sidecar_path(&file_path);

        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::metadata_io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&meta_path)
            .map_err(|e| SyncError::metadata_io(&meta_path, e))?;

        self.acquire(&file, &meta_path, LockMode::Exclusive)?;

        // From here on the lock is held; `Lease` owns releasing it.
        let mut lease = Lease {
            path: rel.to_string(),
            file_path,
            meta_path,
            file,
            record: FileVersionRecord::default(),
            persisted: None,
            fresh: false,
            released: false,
        };

        match read_record(&mut lease.file, &lease.meta_path)? {
            Some(record) => {
                lease.record = record;
                lease.persisted = Some(record);
            }
            None => {
                debug!("creating version record for {}", rel);
                lease.fresh = true;
                lease.persist()?;
            }
        }

        Ok(lease)
    }

    /// Like `open`, but never creates directories or records. `None` when
    /// neither the tracked file nor its record exists.
    pub fn open_existing(&self, rel: &str) -> Result<Option<Lease>> {
        let file_path = self.resolve(rel)?;
        if !file_path.exists() && !sidecar_path(&file_path).exists() {
            return Ok(None);
        }
        self.open(rel).map(Some)
    }

    /// Run `f` under the lease for `rel`. The lease is released whether `f`
    /// succeeds or fails; `f`'s error wins over a release error.
    pub fn with_lease<T, F>(&self, rel: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Lease) -> Result<T>,
    {
        scoped(self.open(rel)?, f)
    }

    /// `with_lease` for paths that are already tracked; `None` otherwise.
    pub fn with_existing_lease<T, F>(&self, rel: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Lease) -> Result<T>,
    {
        match self.open_existing(rel)? {
            Some(lease) => scoped(lease, f).map(Some),
            None => Ok(None),
        }
    }

    /// Read a record under a shared lock without creating it.
    pub fn inspect(&self, rel: &str) -> Result<Option<FileVersionRecord>> {
        let meta_path = sidecar_path(&self.resolve(rel)?);
        let mut file = match File::open(&meta_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::metadata_io(&meta_path, e)),
        };

        self.acquire(&file, &meta_path, LockMode::Shared)?;
        let record = read_record(&mut file, &meta_path);
        if let Err(e) = FileExt::unlock(&file) {
            debug!("unlock of {} failed: {}", meta_path.display(), e);
        }
        record
    }

    fn acquire(&self, file: &File, meta_path: &Path, mode: LockMode) -> Result<()> {
        let Some(timeout) = self.lock_timeout else {
            let res = match mode {
                LockMode::Exclusive => file.lock_exclusive(),
                LockMode::Shared => FileExt::lock_shared(file),
            };
            return res.map_err(|e| SyncError::metadata_io(meta_path, e));
        };

        let deadline = Instant::now() + timeout;
        let mut backoff = LOCK_BACKOFF_START;
        loop {
            let res = match mode {
                LockMode::Exclusive => file.try_lock_exclusive(),
                LockMode::Shared => FileExt::try_lock_shared(file),
            };
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("lease on {} still contended after {:?}", meta_path.display(), timeout);
                        return Err(SyncError::MetadataLocked(meta_path.to_path_buf()));
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(e) => return Err(SyncError::metadata_io(meta_path, e)),
            }
        }
    }
}

fn scoped<T, F>(mut lease: Lease, f: F) -> Result<T>
where
    F: FnOnce(&mut Lease) -> Result<T>,
{
    match f(&mut lease) {
        Ok(value) => {
            lease.release()?;
            Ok(value)
        }
        Err(e) => {
            let path = lease.path().to_string();
            if let Err(release_err) = lease.release() {
                error!("failed to release lease on {}: {}", path, release_err);
            }
            Err(e)
        }
    }
}

fn read_record(file: &mut File, meta_path: &Path) -> Result<Option<FileVersionRecord>> {
    let mut raw = Vec::with_capacity(RECORD_SIZE);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut raw))
        .map_err(|e| SyncError::metadata_io(meta_path, e))?;

    if raw.is_empty() {
        return Ok(None);
    }
    FileVersionRecord::decode(&raw)
        .map(Some)
        .map_err(|msg| {
            SyncError::metadata_io(meta_path, io::Error::new(io::ErrorKind::InvalidData, msg))
        })
}

/// Exclusive, scoped access to one version record.
#[derive(Debug)]
pub struct Lease {
    path: String,
    file_path: PathBuf,
    meta_path: PathBuf,
    file: File,
    record: FileVersionRecord,
    /// Last record written to disk; `None` until first persisted
    persisted: Option<FileVersionRecord>,
    fresh: bool,
    released: bool,
}

impl Lease {
    /// Tracked path relative to the store root
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full path of the tracked file
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn record(&self) -> FileVersionRecord {
        self.record
    }

    pub fn record_mut(&mut self) -> &mut FileVersionRecord {
        &mut self.record
    }

    pub fn base_version(&self) -> u64 {
        self.record.base_version
    }

    pub fn client_version(&self) -> u64 {
        self.record.client_version
    }

    pub fn state(&self) -> SyncState {
        self.record.state
    }

    /// Whether the record was created by this lease
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Write the record if it changed since it was last persisted. The full
    /// record is encoded before the single write.
    pub fn persist(&mut self) -> Result<()> {
        if self.persisted == Some(self.record) {
            return Ok(());
        }
        let raw = self.record.encode();
        let meta_path = &self.meta_path;
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&raw))
            .and_then(|_| self.file.set_len(RECORD_SIZE as u64))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| SyncError::metadata_io(meta_path, e))?;
        self.persisted = Some(self.record);
        Ok(())
    }

    /// Persist any mutation and drop the lock.
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let persisted = self.persist();
        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the descriptor drops the lock regardless.
            debug!("unlock of {} failed: {}", self.meta_path.display(), e);
        }
        persisted
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("failed to persist version record for {}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Commit;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn store() -> (MetadataStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        (MetadataStore::new(tmp.path()), tmp)
    }

    #[test]
    fn test_open_creates_default_record() {
        let (store, tmp) = store();
        let lease = store.open("a.txt").unwrap();
        assert!(lease.is_fresh());
        assert_eq!(lease.record(), FileVersionRecord::default());
        lease.release().unwrap();

        let sidecar = tmp.path().join(".a.txt.tsmeta");
        assert_eq!(fs::metadata(&sidecar).unwrap().len(), RECORD_SIZE as u64);
    }

    #[test]
    fn test_mutation_persists_on_release() {
        let (store, _tmp) = store();
        store
            .with_lease("dir/b.txt", |lease| {
                lease.record_mut().local_edit();
                lease.record_mut().local_edit();
                Ok(())
            })
            .unwrap();

        let rec = store.inspect("dir/b.txt").unwrap().unwrap();
        assert_eq!(rec, FileVersionRecord::new(0, 2, SyncState::Dirty));

        let lease = store.open("dir/b.txt").unwrap();
        assert!(!lease.is_fresh());
    }

    #[test]
    fn test_mutation_persists_on_error_path() {
        let (store, _tmp) = store();
        let result: Result<()> = store.with_lease("c.txt", |lease| {
            lease.record_mut().local_edit();
            Err(SyncError::StaleMessage("abandoned".into()))
        });
        assert!(matches!(result, Err(SyncError::StaleMessage(_))));

        // Lock was released and the whole mutation landed.
        let lease = store.open("c.txt").unwrap();
        assert_eq!(lease.record(), FileVersionRecord::new(0, 1, SyncState::Dirty));
    }

    #[test]
    fn test_drop_releases_lock() {
        let (store, _tmp) = store();
        let store = store.with_lock_timeout(Some(Duration::ZERO));
        {
            let mut lease = store.open("d.txt").unwrap();
            lease.record_mut().local_delete();
        }
        let lease = store.open("d.txt").unwrap();
        assert_eq!(lease.state(), SyncState::Deleted);
    }

    #[test]
    fn test_contended_lease_is_locked() {
        let (store, _tmp) = store();
        let bounded = store.clone().with_lock_timeout(Some(Duration::from_millis(20)));

        let held = store.open("e.txt").unwrap();
        let err = bounded.open("e.txt").unwrap_err();
        assert!(matches!(err, SyncError::MetadataLocked(_)));
        drop(held);

        assert!(bounded.open("e.txt").is_ok());
    }

    #[test]
    fn test_stale_commit_leaves_record() {
        let (store, _tmp) = store();
        store
            .with_lease("f.txt", |lease| {
                *lease.record_mut() = FileVersionRecord::new(5, 2, SyncState::Dirty);
                Ok(())
            })
            .unwrap();

        let res = store.with_lease("f.txt", |lease| {
            let commit = Commit {
                base_version: 3,
                new_version: 4,
                client_version: 1,
            };
            lease
                .record_mut()
                .apply_commit(&commit)
                .map_err(|r| SyncError::StaleMessage(r.to_string()))
        });
        assert!(res.is_err());
        assert_eq!(
            store.inspect("f.txt").unwrap(),
            Some(FileVersionRecord::new(5, 2, SyncState::Dirty))
        );
    }

    #[test]
    fn test_corrupt_sidecar_is_io_error() {
        let (store, tmp) = store();
        fs::write(tmp.path().join(".g.txt.tsmeta"), b"garbage").unwrap();
        assert!(matches!(
            store.open("g.txt"),
            Err(SyncError::MetadataIo { .. })
        ));
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let (store, _tmp) = store();
        for bad in ["", "/etc/passwd", "../escape", "a/../../b", "x/.y.tsmeta", "z.tsstage"] {
            assert!(
                matches!(store.open(bad), Err(SyncError::InvalidPath(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_overlong_path_rejected() {
        let (store, _tmp) = store();
        let long = format!("../{}", "a".repeat(65_500));
        match store.open(&long) {
            Err(SyncError::InvalidPath(msg)) => assert!(msg.len() < 100),
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.resolve(&"b".repeat(MAX_PATH_LEN)).is_ok());
    }

    #[test]
    fn test_open_existing_creates_nothing() {
        let (store, tmp) = store();
        assert!(store.open_existing("x/y/z/nope.txt").unwrap().is_none());
        assert!(!tmp.path().join("x").exists());
        assert_eq!(
            store
                .with_existing_lease("x/y/z/nope.txt", |_| Ok(()))
                .unwrap(),
            None
        );
        assert!(!tmp.path().join("x").exists());

        fs::write(tmp.path().join("present.txt"), b"p").unwrap();
        let lease = store.open_existing("present.txt").unwrap().unwrap();
        assert!(lease.is_fresh());
        drop(lease);

        // A tombstoned record keeps the path tracked after the file is gone
        fs::remove_file(tmp.path().join("present.txt")).unwrap();
        let seen = store
            .with_existing_lease("present.txt", |lease| Ok(lease.record()))
            .unwrap();
        assert_eq!(seen, Some(FileVersionRecord::default()));
    }

    #[test]
    fn test_inspect_missing_is_none() {
        let (store, _tmp) = store();
        assert_eq!(store.inspect("nothing.txt").unwrap(), None);
    }

    #[test]
    fn test_concurrent_leases_are_exclusive() {
        let (store, _tmp) = store();
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..25 {
                        store
                            .with_lease("shared.txt", |lease| {
                                if inside.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                lease.record_mut().local_edit();
                                std::thread::yield_now();
                                inside.store(false, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        let rec = store.inspect("shared.txt").unwrap().unwrap();
        assert_eq!(rec.client_version, 100);
    }
}
