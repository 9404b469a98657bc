//! Local-edit relay.
//!
//! The filesystem passthrough reports edits here. Each report is one state
//! transition under one lease, followed by a `NewVersion` notice published
//! to every connection subscribed to the path.

use crate::error::Result;
use crate::meta::{FileVersionRecord, Lease, MetadataStore, SyncState};
use crate::protocol::NewVersion;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Notices buffered per receiver before a slow connection starts lagging
const HUB_CAPACITY: usize = 1024;

/// Fan-out of local version notices to connections.
#[derive(Debug, Clone)]
pub struct VersionHub {
    tx: broadcast::Sender<NewVersion>,
}

impl Default for VersionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewVersion> {
        self.tx.subscribe()
    }

    /// Publish a notice. Returns the number of connections that will see it.
    pub fn publish(&self, notice: NewVersion) -> usize {
        // No receivers is not an error: nobody is connected yet.
        self.tx.send(notice).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Whether `path` falls under the subscription prefix `prefix`.
/// The empty prefix covers the whole tree.
pub fn path_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || prefix == path {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Entry point for local filesystem edits.
#[derive(Debug, Clone)]
pub struct LocalEdits {
    store: MetadataStore,
    hub: VersionHub,
}

impl LocalEdits {
    pub fn new(store: MetadataStore, hub: VersionHub) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> &VersionHub {
        &self.hub
    }

    pub fn created(&self, path: &str) -> Result<FileVersionRecord> {
        self.transition(path, "create", |lease| {
            let fresh = lease.is_fresh();
            lease.record_mut().local_create(fresh);
        })
    }

    pub fn written(&self, path: &str) -> Result<FileVersionRecord> {
        self.transition(path, "write", |lease| {
            lease.record_mut().local_edit();
        })
    }

    pub fn truncated(&self, path: &str) -> Result<FileVersionRecord> {
        self.transition(path, "truncate", |lease| {
            lease.record_mut().local_edit();
        })
    }

    /// Tombstone the record. Deletions are not announced.
    pub fn deleted(&self, path: &str) -> Result<FileVersionRecord> {
        self.transition(path, "delete", |lease| {
            lease.record_mut().local_delete();
        })
    }

    fn transition<F>(&self, path: &str, op: &str, f: F) -> Result<FileVersionRecord>
    where
        F: FnOnce(&mut Lease),
    {
        let (record, notice) = self.store.with_lease(path, |lease| {
            f(lease);
            let record = lease.record();
            trace!("local {} of {}: {}", op, path, record);

            if record.state == SyncState::Deleted {
                return Ok((record, None));
            }
            let size = std::fs::metadata(lease.file_path())
                .map(|m| m.len())
                .unwrap_or(0);
            let notice = NewVersion {
                path: path.to_string(),
                base_version: record.base_version,
                client_version: record.client_version,
                size,
            };
            Ok((record, Some(notice)))
        })?;

        if let Some(notice) = notice {
            let receivers = self.hub.publish(notice);
            debug!("announced {} of {} to {} connection(s)", op, path, receivers);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (LocalEdits, TempDir) {
        let tmp = TempDir::new().unwrap();
        let edits = LocalEdits::new(MetadataStore::new(tmp.path()), VersionHub::new());
        (edits, tmp)
    }

    #[test]
    fn test_fresh_create_then_writes() {
        let (edits, tmp) = setup();
        fs::write(tmp.path().join("a.txt"), b"").unwrap();

        let rec = edits.created("a.txt").unwrap();
        assert_eq!(rec, FileVersionRecord::new(0, 0, SyncState::Synced));

        fs::write(tmp.path().join("a.txt"), b"hi").unwrap();
        edits.written("a.txt").unwrap();
        let rec = edits.truncated("a.txt").unwrap();
        assert_eq!(rec, FileVersionRecord::new(0, 2, SyncState::Dirty));
    }

    #[test]
    fn test_recreate_counts_as_edit() {
        let (edits, _tmp) = setup();
        edits.created("b.txt").unwrap();
        let rec = edits.created("b.txt").unwrap();
        assert_eq!(rec, FileVersionRecord::new(0, 1, SyncState::Dirty));
    }

    #[test]
    fn test_edits_are_published() {
        let (edits, tmp) = setup();
        let mut rx = edits.hub().subscribe();
        fs::write(tmp.path().join("c.txt"), b"12345").unwrap();

        edits.written("c.txt").unwrap();
        let notice = rx.try_recv().unwrap();
        assert_eq!(
            notice,
            NewVersion {
                path: "c.txt".into(),
                base_version: 0,
                client_version: 1,
                size: 5,
            }
        );

        edits.deleted("c.txt").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_writes_after_delete_are_ignored() {
        let (edits, _tmp) = setup();
        edits.written("d.txt").unwrap();
        edits.deleted("d.txt").unwrap();
        let rec = edits.written("d.txt").unwrap();
        assert_eq!(rec.state, SyncState::Deleted);
        assert_eq!(rec.client_version, 1);
    }

    #[test]
    fn test_path_matches() {
        assert!(path_matches("", "any/thing.txt"));
        assert!(path_matches("docs", "docs/a.txt"));
        assert!(path_matches("docs/", "docs/a.txt"));
        assert!(path_matches("docs/a.txt", "docs/a.txt"));
        assert!(!path_matches("docs", "docs2/a.txt"));
        assert!(!path_matches("docs/a", "docs/ab.txt"));
    }
}
