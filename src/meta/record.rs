//! Version record and its state machine.
//!
//! On-disk layout (24 bytes, little-endian):
//! magic:[u8;4] | format:u16 | state:u8 | reserved:u8 | base:u64 | client:u64

use crate::protocol::Commit;
use bytes::{Buf, BufMut};
use std::fmt;

pub const RECORD_MAGIC: &[u8; 4] = b"TSVR";
pub const RECORD_FORMAT: u16 = 1;
pub const RECORD_SIZE: usize = 24;

/// Reconciliation status of a tracked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SyncState {
    #[default]
    Synced = 0,
    /// Local edits not yet committed
    Dirty = 1,
    /// Remote has a newer base and we have nothing local to lose
    Stale = 2,
    /// Local and remote diverged; terminal until resolved externally
    Conflict = 3,
    /// Tombstone
    Deleted = 4,
}

impl SyncState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Synced),
            1 => Some(Self::Dirty),
            2 => Some(Self::Stale),
            3 => Some(Self::Conflict),
            4 => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Dirty => "dirty",
            SyncState::Stale => "stale",
            SyncState::Conflict => "conflict",
            SyncState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Conflict | SyncState::Deleted)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a commit was not applied. The record is untouched in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRejection {
    BaseMismatch { expected: u64, got: u64 },
    NotAnAdvance { base: u64, new_version: u64 },
    TooManyEdits { pending: u64, committed: u64 },
    Unapplicable(SyncState),
}

impl fmt::Display for CommitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitRejection::BaseMismatch { expected, got } => {
                write!(f, "commit base {} does not match record base {}", got, expected)
            }
            CommitRejection::NotAnAdvance { base, new_version } => {
                write!(f, "commit to version {} does not advance base {}", new_version, base)
            }
            CommitRejection::TooManyEdits { pending, committed } => write!(
                f,
                "commit covers {} edits but only {} are pending",
                committed, pending
            ),
            CommitRejection::Unapplicable(state) => {
                write!(f, "commit cannot apply to a {} record", state)
            }
        }
    }
}

/// What a remote version announcement means for the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteObservation {
    /// Announcement is older than what we already have
    Outdated,
    /// Same base: the remote has edits on top of our agreed version
    SameBase,
    /// Remote base is newer and nothing local is pending
    Stale,
    /// Remote base is newer while local edits are pending
    Conflict,
    /// Record is a tombstone or already in conflict
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileVersionRecord {
    pub base_version: u64,
    pub client_version: u64,
    pub state: SyncState,
}

impl FileVersionRecord {
    pub fn new(base_version: u64, client_version: u64, state: SyncState) -> Self {
        Self {
            base_version,
            client_version,
            state,
        }
    }

    pub fn has_pending_edits(&self) -> bool {
        self.client_version > 0 || self.state == SyncState::Dirty
    }

    /// A local write or truncate.
    pub fn local_edit(&mut self) -> bool {
        match self.state {
            SyncState::Deleted => false,
            // Edits still count while in conflict, but the state sticks.
            SyncState::Conflict => {
                self.client_version += 1;
                true
            }
            _ => {
                self.client_version += 1;
                self.state = SyncState::Dirty;
                true
            }
        }
    }

    /// A local create. A freshly created record stays `Synced` at `{0, 0}`;
    /// re-creating an existing tracked path counts as an edit.
    pub fn local_create(&mut self, fresh: bool) -> bool {
        if fresh {
            false
        } else {
            self.local_edit()
        }
    }

    pub fn local_delete(&mut self) {
        self.state = SyncState::Deleted;
    }

    /// Apply a commit. On rejection nothing is modified.
    pub fn apply_commit(&mut self, commit: &Commit) -> Result<(), CommitRejection> {
        match self.state {
            SyncState::Synced | SyncState::Dirty => {}
            other => return Err(CommitRejection::Unapplicable(other)),
        }
        if commit.base_version != self.base_version {
            return Err(CommitRejection::BaseMismatch {
                expected: self.base_version,
                got: commit.base_version,
            });
        }
        if commit.new_version <= self.base_version {
            return Err(CommitRejection::NotAnAdvance {
                base: self.base_version,
                new_version: commit.new_version,
            });
        }
        if commit.client_version > self.client_version {
            return Err(CommitRejection::TooManyEdits {
                pending: self.client_version,
                committed: commit.client_version,
            });
        }

        self.client_version -= commit.client_version;
        self.base_version = commit.new_version;
        self.state = if self.client_version == 0 {
            SyncState::Synced
        } else {
            SyncState::Dirty
        };
        Ok(())
    }

    /// Observe a remote announcement of `remote_base`. Moves to `Stale` or
    /// `Conflict` when the remote is ahead; never touches the counters.
    pub fn observe_remote(&mut self, remote_base: u64) -> RemoteObservation {
        if self.state.is_terminal() {
            return RemoteObservation::Ignored;
        }
        if remote_base < self.base_version {
            return RemoteObservation::Outdated;
        }
        if remote_base == self.base_version {
            return RemoteObservation::SameBase;
        }
        if self.has_pending_edits() {
            self.state = SyncState::Conflict;
            RemoteObservation::Conflict
        } else {
            self.state = SyncState::Stale;
            RemoteObservation::Stale
        }
    }

    /// Adopt remote content at `remote_base` after a completed catch-up transfer.
    pub fn catch_up(&mut self, remote_base: u64) {
        self.base_version = self.base_version.max(remote_base);
        self.client_version = 0;
        self.state = SyncState::Synced;
    }

    /// Accept a peer's edits made on our current base. Returns the new base.
    pub fn accept_peer_edit(&mut self) -> u64 {
        self.base_version += 1;
        self.state = SyncState::Synced;
        self.base_version
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let mut buf = &mut out[..];
        buf.put_slice(RECORD_MAGIC);
        buf.put_u16_le(RECORD_FORMAT);
        buf.put_u8(self.state as u8);
        buf.put_u8(0);
        buf.put_u64_le(self.base_version);
        buf.put_u64_le(self.client_version);
        out
    }

    pub fn decode(mut raw: &[u8]) -> Result<Self, String> {
        if raw.len() != RECORD_SIZE {
            return Err(format!(
                "record is {} bytes, expected {}",
                raw.len(),
                RECORD_SIZE
            ));
        }
        let mut magic = [0u8; 4];
        raw.copy_to_slice(&mut magic);
        if &magic != RECORD_MAGIC {
            return Err("bad record magic".to_string());
        }
        let format = raw.get_u16_le();
        if format != RECORD_FORMAT {
            return Err(format!("unsupported record format {}", format));
        }
        let state_raw = raw.get_u8();
        let state =
            SyncState::from_u8(state_raw).ok_or_else(|| format!("unknown state {}", state_raw))?;
        let _reserved = raw.get_u8();

        Ok(Self {
            base_version: raw.get_u64_le(),
            client_version: raw.get_u64_le(),
            state,
        })
    }
}

impl fmt::Display for FileVersionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "base={} client={} state={}",
            self.base_version, self.client_version, self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn commit(base_version: u64, new_version: u64, client_version: u64) -> Commit {
        Commit {
            base_version,
            new_version,
            client_version,
        }
    }

    #[test]
    fn test_fresh_file_then_write_then_commit() {
        let mut rec = FileVersionRecord::default();
        assert!(!rec.local_create(true));
        assert_eq!(rec, FileVersionRecord::new(0, 0, SyncState::Synced));

        rec.local_edit();
        rec.local_edit();
        assert_eq!(rec, FileVersionRecord::new(0, 2, SyncState::Dirty));

        rec.apply_commit(&commit(0, 1, 2)).unwrap();
        assert_eq!(rec, FileVersionRecord::new(1, 0, SyncState::Synced));
    }

    #[test]
    fn test_partial_commit_stays_dirty() {
        let mut rec = FileVersionRecord::new(1, 3, SyncState::Dirty);
        rec.apply_commit(&commit(1, 2, 2)).unwrap();
        assert_eq!(rec, FileVersionRecord::new(2, 1, SyncState::Dirty));
    }

    #[test]
    fn test_stale_commit_rejected() {
        let mut rec = FileVersionRecord::new(5, 2, SyncState::Dirty);
        let err = rec.apply_commit(&commit(3, 4, 1)).unwrap_err();
        assert_eq!(
            err,
            CommitRejection::BaseMismatch {
                expected: 5,
                got: 3
            }
        );
        assert_eq!(rec, FileVersionRecord::new(5, 2, SyncState::Dirty));
    }

    #[test]
    fn test_duplicate_commit_rejected() {
        let mut rec = FileVersionRecord::new(0, 1, SyncState::Dirty);
        rec.apply_commit(&commit(0, 1, 1)).unwrap();
        let after = rec;
        assert!(rec.apply_commit(&commit(0, 1, 1)).is_err());
        assert_eq!(rec, after);
    }

    #[test]
    fn test_commit_must_advance_and_cover_pending() {
        let mut rec = FileVersionRecord::new(4, 1, SyncState::Dirty);
        assert!(matches!(
            rec.apply_commit(&commit(4, 4, 1)),
            Err(CommitRejection::NotAnAdvance { .. })
        ));
        assert!(matches!(
            rec.apply_commit(&commit(4, 5, 2)),
            Err(CommitRejection::TooManyEdits { .. })
        ));
        assert_eq!(rec, FileVersionRecord::new(4, 1, SyncState::Dirty));
    }

    #[test]
    fn test_remote_newer_marks_stale_or_conflict() {
        let mut clean = FileVersionRecord::new(2, 0, SyncState::Synced);
        assert_eq!(clean.observe_remote(3), RemoteObservation::Stale);
        assert_eq!(clean.state, SyncState::Stale);
        assert_eq!(clean.base_version, 2);

        let mut dirty = FileVersionRecord::new(2, 1, SyncState::Dirty);
        assert_eq!(dirty.observe_remote(3), RemoteObservation::Conflict);
        assert_eq!(dirty.state, SyncState::Conflict);

        // Conflict is terminal
        assert_eq!(dirty.observe_remote(10), RemoteObservation::Ignored);
        assert!(dirty.apply_commit(&commit(2, 3, 1)).is_err());
        assert_eq!(dirty.state, SyncState::Conflict);
    }

    #[test]
    fn test_remote_same_or_older_base() {
        let mut rec = FileVersionRecord::new(3, 0, SyncState::Synced);
        assert_eq!(rec.observe_remote(3), RemoteObservation::SameBase);
        assert_eq!(rec.observe_remote(1), RemoteObservation::Outdated);
        assert_eq!(rec.state, SyncState::Synced);
    }

    #[test]
    fn test_delete_is_terminal() {
        let mut rec = FileVersionRecord::new(1, 1, SyncState::Dirty);
        rec.local_delete();
        assert_eq!(rec.state, SyncState::Deleted);
        assert!(!rec.local_edit());
        assert_eq!(rec.observe_remote(9), RemoteObservation::Ignored);
        assert!(rec.apply_commit(&commit(1, 2, 1)).is_err());
        assert_eq!(rec.state, SyncState::Deleted);
    }

    #[test]
    fn test_catch_up_never_lowers_base() {
        let mut rec = FileVersionRecord::new(5, 0, SyncState::Stale);
        rec.catch_up(3);
        assert_eq!(rec, FileVersionRecord::new(5, 0, SyncState::Synced));
        rec.catch_up(8);
        assert_eq!(rec.base_version, 8);
    }

    #[test]
    fn test_layout() {
        let rec = FileVersionRecord::new(0x0102, 7, SyncState::Conflict);
        let raw = rec.encode();
        assert_eq!(&raw[..4], b"TSVR");
        assert_eq!(raw[6], SyncState::Conflict as u8);
        assert_eq!(&raw[8..10], &[0x02, 0x01]);
        assert_eq!(FileVersionRecord::decode(&raw).unwrap(), rec);
    }

    #[test]
    fn test_corrupt_records_rejected() {
        let mut raw = FileVersionRecord::default().encode();
        raw[0] = b'X';
        assert!(FileVersionRecord::decode(&raw).is_err());

        let mut raw = FileVersionRecord::default().encode();
        raw[6] = 99;
        assert!(FileVersionRecord::decode(&raw).is_err());

        assert!(FileVersionRecord::decode(&[0u8; 10]).is_err());
    }

    proptest! {
        #[test]
        fn base_version_never_decreases(
            start_base in 0u64..100,
            edits in 0u64..10,
            commits in proptest::collection::vec((0u64..120, 0u64..130, 0u64..12), 0..40),
        ) {
            let mut rec = FileVersionRecord::new(start_base, 0, SyncState::Synced);
            for _ in 0..edits {
                rec.local_edit();
            }
            for (base, new, client) in commits {
                let before = rec;
                let c = commit(base, new, client);
                match rec.apply_commit(&c) {
                    Ok(()) => prop_assert!(rec.base_version > before.base_version),
                    Err(_) => prop_assert_eq!(rec, before),
                }
                if base != before.base_version {
                    prop_assert_eq!(rec, before);
                }
            }
        }
    }
}
