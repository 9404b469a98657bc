//! Chunk transfer engine.
//!
//! Serves byte ranges of a tracked file through a page-aligned memory map,
//! under the file's version record lease.

use crate::error::{Result, SyncError};
use crate::meta::{Lease, MetadataStore};
use bytes::Bytes;
use memmap2::MmapOptions;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

/// Fallback when the OS page size cannot be queried
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// A served range and the client version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub client_version: u64,
    pub data: Bytes,
}

/// System page size.
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no memory-safety preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if raw > 0 {
                return raw as u64;
            }
        }
        DEFAULT_PAGE_SIZE
    })
}

/// Read `[offset, offset + size)` of `rel` while holding its lease. Paths
/// that are not tracked fail without leaving a record behind.
pub fn read_chunk(store: &MetadataStore, rel: &str, offset: u64, size: u32) -> Result<Chunk> {
    store
        .with_existing_lease(rel, |lease| {
            Ok(Chunk {
                client_version: lease.client_version(),
                data: read_locked(lease, offset, size)?,
            })
        })?
        .ok_or_else(|| untracked(store, rel))
}

/// Read error for a path with neither a file nor a version record.
pub(crate) fn untracked(store: &MetadataStore, rel: &str) -> SyncError {
    SyncError::ChunkRead {
        path: store.root().join(rel),
        source: io::Error::new(io::ErrorKind::NotFound, "not tracked"),
    }
}

/// Read a range of the leased file. The caller already holds the lease.
pub fn read_locked(lease: &Lease, offset: u64, size: u32) -> Result<Bytes> {
    read_range(lease.file_path(), offset, size)
}

/// Map the page-aligned window covering the range and copy out exactly the
/// requested bytes. Ranges past end of file are clamped to it.
fn read_range(path: &Path, offset: u64, size: u32) -> Result<Bytes> {
    let chunk_err = |source| SyncError::ChunkRead {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(chunk_err)?;
    let file_len = file.metadata().map_err(chunk_err)?.len();

    if size == 0 || offset >= file_len {
        return Ok(Bytes::new());
    }
    let end = offset.saturating_add(u64::from(size)).min(file_len);

    let aligned = offset - offset % page_size();
    let map_len = (end - aligned) as usize;

    // SAFETY: the map is read-only and copied out before returning. A
    // concurrent truncation by another process could fault; local writers go
    // through the same lease we hold.
    let map = unsafe { MmapOptions::new().offset(aligned).len(map_len).map(&file) }
        .map_err(chunk_err)?;

    let start = (offset - aligned) as usize;
    let stop = (end - aligned) as usize;
    Ok(Bytes::copy_from_slice(&map[start..stop]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::SyncState;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(len: usize) -> (MetadataStore, TempDir, Vec<u8>) {
        let tmp = TempDir::new().unwrap();
        let content: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(tmp.path().join("data.bin"), &content).unwrap();
        (MetadataStore::new(tmp.path()), tmp, content)
    }

    #[test]
    fn test_unaligned_read() {
        let (store, _tmp, content) = fixture(3 * page_size() as usize + 100);
        let offset = page_size() + 17;
        let chunk = read_chunk(&store, "data.bin", offset, 5000).unwrap();
        assert_eq!(
            chunk.data.as_ref(),
            &content[offset as usize..offset as usize + 5000]
        );
    }

    #[test]
    fn test_reports_client_version() {
        let (store, _tmp, _content) = fixture(64);
        store
            .with_lease("data.bin", |lease| {
                lease.record_mut().local_edit();
                lease.record_mut().local_edit();
                Ok(())
            })
            .unwrap();

        let chunk = read_chunk(&store, "data.bin", 0, 8).unwrap();
        assert_eq!(chunk.client_version, 2);
        assert_eq!(
            store.inspect("data.bin").unwrap().unwrap().state,
            SyncState::Dirty
        );
    }

    #[test]
    fn test_clamped_to_eof() {
        let (store, _tmp, content) = fixture(100);
        let chunk = read_chunk(&store, "data.bin", 90, 50).unwrap();
        assert_eq!(chunk.data.as_ref(), &content[90..]);

        let past = read_chunk(&store, "data.bin", 500, 10).unwrap();
        assert!(past.data.is_empty());
    }

    #[test]
    fn test_missing_file_releases_lease() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(tmp.path())
            .with_lock_timeout(Some(std::time::Duration::ZERO));
        store
            .with_lease("gone.bin", |lease| {
                lease.record_mut().local_delete();
                Ok(())
            })
            .unwrap();

        let err = read_chunk(&store, "gone.bin", 0, 10).unwrap_err();
        assert!(matches!(err, SyncError::ChunkRead { .. }));

        // Lease must be free again
        assert!(store.open("gone.bin").is_ok());
    }

    #[test]
    fn test_untracked_path_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(tmp.path());

        let err = read_chunk(&store, "deep/er/missing.bin", 0, 10).unwrap_err();
        assert!(matches!(err, SyncError::ChunkRead { .. }));
        assert!(!tmp.path().join("deep").exists());
        assert_eq!(store.inspect("deep/er/missing.bin").unwrap(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chunk_matches_file_slice(offset in 0u64..20_000, size in 1u32..9_000) {
            let (store, _tmp, content) = fixture(20_000);
            let chunk = read_chunk(&store, "data.bin", offset, size).unwrap();
            let end = (offset as usize + size as usize).min(content.len());
            prop_assert_eq!(chunk.data.as_ref(), &content[offset as usize..end]);
        }
    }
}
