//! Inbound transfer staging.
//!
//! Chunks pulled from a peer are written into a temporary file beside the
//! target. The staged file only replaces the target once every byte has
//! arrived; an abandoned transfer removes its staging file on drop.

use crate::error::{Result, SyncError};
use crate::meta::{Lease, MetadataStore, STAGING_SUFFIX};
use crate::protocol::{FileChunk, NewVersion, RequestChunk};
use std::collections::{BTreeMap, HashMap};
use std::io::{Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

/// Why content is being pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Peer edited our current base; we accept and commit back.
    PeerEdit { base_version: u64 },
    /// Remote base moved ahead of ours; adopt it.
    CatchUp { remote_base: u64 },
}

#[derive(Debug)]
pub struct IncomingTransfer {
    path: String,
    kind: TransferKind,
    client_version: u64,
    size: u64,
    /// Disjoint, merged byte ranges written so far: start -> end
    received: BTreeMap<u64, u64>,
    /// Requested ranges not yet answered: offset -> end
    outstanding: BTreeMap<u64, u64>,
    staging: NamedTempFile,
}

impl IncomingTransfer {
    /// Stage a transfer for the content `announcement` describes.
    pub fn begin(
        store: &MetadataStore,
        announcement: &NewVersion,
        kind: TransferKind,
    ) -> Result<Self> {
        let target = store.resolve(&announcement.path)?;
        let dir = target
            .parent()
            .ok_or_else(|| SyncError::InvalidPath(announcement.path.clone()))?;
        std::fs::create_dir_all(dir)?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(STAGING_SUFFIX)
            .tempfile_in(dir)?;
        staging.as_file().set_len(announcement.size)?;

        Ok(Self {
            path: announcement.path.clone(),
            kind,
            client_version: announcement.client_version,
            size: announcement.size,
            received: BTreeMap::new(),
            outstanding: BTreeMap::new(),
            staging,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn client_version(&self) -> u64 {
        self.client_version
    }

    /// Chunk requests covering the whole file. Each is tracked as
    /// outstanding until a chunk arrives at its offset.
    pub fn requests(&mut self, chunk_size: u32) -> Vec<RequestChunk> {
        let step = u64::from(chunk_size.max(1));
        let spans: Vec<(u64, u64)> = (0..self.size)
            .step_by(step as usize)
            .map(|offset| (offset, (offset + step).min(self.size)))
            .collect();
        spans
            .into_iter()
            .map(|(offset, end)| self.request(offset, end))
            .collect()
    }

    fn request(&mut self, offset: u64, end: u64) -> RequestChunk {
        self.outstanding.insert(offset, end);
        RequestChunk {
            path: self.path.clone(),
            client_version: self.client_version,
            offset,
            size: (end - offset) as u32,
        }
    }

    /// Write one served chunk. Overlapping or repeated ranges are written
    /// again and counted once. A chunk shorter than the request it answers
    /// yields the request for the rest of that range.
    pub fn write_chunk(&mut self, chunk: &FileChunk) -> Result<Option<RequestChunk>> {
        if chunk.client_version != self.client_version {
            return Err(SyncError::StaleMessage(format!(
                "chunk for {} at client version {}, transfer expects {}",
                self.path, chunk.client_version, self.client_version
            )));
        }
        let len = chunk.data.len() as u64;
        let end = chunk.offset.saturating_add(len);
        if end > self.size {
            return Err(SyncError::malformed(format!(
                "chunk {}..{} past announced size {} of {}",
                chunk.offset, end, self.size, self.path
            )));
        }

        let file = self.staging.as_file_mut();
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(&chunk.data)?;
        self.cover(chunk.offset, end);

        let Some(requested_end) = self.outstanding.remove(&chunk.offset) else {
            tracing::debug!("unrequested chunk at {} for {}", chunk.offset, self.path);
            return Ok(None);
        };
        if len == 0 || end >= requested_end {
            return Ok(None);
        }
        tracing::debug!(
            "short chunk for {}: got {}..{}, asking for {}..{}",
            self.path,
            chunk.offset,
            end,
            end,
            requested_end
        );
        Ok(Some(self.request(end, requested_end)))
    }

    /// Merge `[start, end)` into the received ranges.
    fn cover(&mut self, mut start: u64, mut end: u64) {
        if start == end {
            return;
        }
        if let Some((&s, &e)) = self.received.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
            }
        }
        let absorbed: Vec<u64> = self.received.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.received.remove(&s) {
                end = end.max(e);
            }
        }
        self.received.insert(start, end);
    }

    /// Every byte of `[0, size)` has been written.
    pub fn is_complete(&self) -> bool {
        self.size == 0 || self.received.get(&0) == Some(&self.size)
    }

    /// Move the staged content over the leased target.
    pub fn finish(self, lease: &Lease) -> Result<()> {
        self.staging.as_file().sync_all()?;
        self.staging
            .persist(lease.file_path())
            .map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }
}

/// In-flight transfers of one connection, by path.
#[derive(Debug, Default)]
pub struct TransferTable {
    transfers: HashMap<String, IncomingTransfer>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a transfer, superseding any earlier one for the same path.
    pub fn insert(&mut self, transfer: IncomingTransfer) {
        if let Some(old) = self.transfers.insert(transfer.path.clone(), transfer) {
            tracing::debug!("superseded transfer for {}", old.path);
        }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut IncomingTransfer> {
        self.transfers.get_mut(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<IncomingTransfer> {
        self.transfers.remove(path)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
