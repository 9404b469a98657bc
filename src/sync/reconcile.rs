//! Commit/reconciliation logic.
//!
//! Applies version-advancing protocol messages to version records. Each
//! message is handled under exactly one lease on its path.

use crate::error::{Result, SyncError};
use crate::meta::{FileVersionRecord, Lease, MetadataStore, RemoteObservation, SyncState};
use crate::protocol::{Commit, FileChunk, Message, NewVersion, RequestChunk};
use crate::sync::chunk;
use crate::sync::transfer::{IncomingTransfer, TransferKind, TransferTable};
use bytes::Bytes;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Reconciler {
    store: MetadataStore,
    chunk_size: u32,
}

impl Reconciler {
    pub fn new(store: MetadataStore, chunk_size: u32) -> Self {
        Self { store, chunk_size }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Handle a peer's version announcement. Returns the chunk requests
    /// (if any) needed to pull the announced content.
    pub fn handle_new_version(
        &self,
        transfers: &mut TransferTable,
        nv: &NewVersion,
    ) -> Result<Vec<Message>> {
        self.store.with_lease(&nv.path, |lease| {
            let observation = lease.record_mut().observe_remote(nv.base_version);
            let kind = match observation {
                RemoteObservation::Outdated => {
                    return Err(SyncError::StaleMessage(format!(
                        "{} announced at base {}, record is at {}",
                        nv.path,
                        nv.base_version,
                        lease.base_version()
                    )));
                }
                RemoteObservation::Ignored => {
                    debug!("ignoring announcement for {} record", lease.state());
                    return Ok(Vec::new());
                }
                RemoteObservation::Conflict => {
                    warn!(
                        "conflict on {}: remote base {} while local edits pending",
                        nv.path, nv.base_version
                    );
                    return Ok(Vec::new());
                }
                RemoteObservation::Stale => TransferKind::CatchUp {
                    remote_base: nv.base_version,
                },
                RemoteObservation::SameBase => {
                    if nv.client_version == 0 {
                        return Ok(Vec::new());
                    }
                    if lease.record().has_pending_edits() {
                        warn!(
                            "conflict on {}: both sides edited base {}",
                            nv.path, nv.base_version
                        );
                        lease.record_mut().state = SyncState::Conflict;
                        return Ok(Vec::new());
                    }
                    TransferKind::PeerEdit {
                        base_version: nv.base_version,
                    }
                }
            };

            let mut transfer = IncomingTransfer::begin(&self.store, nv, kind)?;
            if transfer.is_complete() {
                // Nothing to pull; apply right away under this lease.
                return finish_transfer(transfer, lease);
            }

            let requests = transfer
                .requests(self.chunk_size)
                .into_iter()
                .map(Message::RequestChunk)
                .collect();
            transfers.insert(transfer);
            Ok(requests)
        })
    }

    /// Serve a chunk request. A request at a client version other than the
    /// record's current one gets a reply without data. At most `chunk_size`
    /// bytes are served; the requester asks again for the rest. Untracked
    /// paths fail without creating anything.
    pub fn handle_request_chunk(&self, req: &RequestChunk) -> Result<Message> {
        let size = req.size.min(self.chunk_size);
        self.store.with_existing_lease(&req.path, |lease| {
            let data = if req.client_version == lease.client_version() {
                chunk::read_locked(lease, req.offset, size)?
            } else {
                debug!(
                    "stale chunk request for {}: wants client version {}, have {}",
                    req.path,
                    req.client_version,
                    lease.client_version()
                );
                Bytes::new()
            };
            Ok(Message::FileChunk(FileChunk {
                path: req.path.clone(),
                client_version: lease.client_version(),
                offset: req.offset,
                data,
            }))
        })?
        .ok_or_else(|| chunk::untracked(&self.store, &req.path))
    }

    /// Stage a served chunk. Until the transfer is complete the follow-up is
    /// a request for whatever a short chunk left out; once complete, the
    /// content is installed and a `Commit` follows for accepted peer edits.
    pub fn handle_file_chunk(
        &self,
        transfers: &mut TransferTable,
        chunk: &FileChunk,
    ) -> Result<Vec<Message>> {
        let Some(transfer) = transfers.get_mut(&chunk.path) else {
            return Err(SyncError::StaleMessage(format!(
                "unsolicited chunk for {}",
                chunk.path
            )));
        };

        if chunk.is_stale_reply() {
            warn!(
                "peer's view of {} moved past client version {}; abandoning transfer",
                chunk.path,
                transfer.client_version()
            );
            transfers.remove(&chunk.path);
            return Ok(Vec::new());
        }

        let remainder = match transfer.write_chunk(chunk) {
            Ok(remainder) => remainder,
            Err(e) => {
                transfers.remove(&chunk.path);
                return Err(e);
            }
        };
        if !transfer.is_complete() {
            return Ok(remainder.into_iter().map(Message::RequestChunk).collect());
        }

        let Some(transfer) = transfers.remove(&chunk.path) else {
            return Ok(Vec::new());
        };
        self.store
            .with_lease(&chunk.path, |lease| finish_transfer(transfer, lease))
    }

    /// Apply a commit. A mismatched base leaves the record untouched and is
    /// reported as `StaleMessage`.
    pub fn handle_commit(&self, path: &str, commit: &Commit) -> Result<FileVersionRecord> {
        self.store.with_lease(path, |lease| {
            lease
                .record_mut()
                .apply_commit(commit)
                .map_err(|rejection| SyncError::StaleMessage(format!("{}: {}", path, rejection)))?;
            info!("{} committed at version {}", path, lease.base_version());
            Ok(lease.record())
        })
    }
}

/// Install a completed transfer under the caller's lease.
fn finish_transfer(
    transfer: IncomingTransfer,
    lease: &mut Lease,
) -> Result<Vec<Message>> {
    let path = transfer.path().to_string();
    let record = lease.record();

    match transfer.kind() {
        TransferKind::PeerEdit { base_version } => {
            if record.base_version != base_version
                || record.has_pending_edits()
                || record.state.is_terminal()
            {
                return Err(SyncError::StaleMessage(format!(
                    "{} changed during transfer ({})",
                    path, record
                )));
            }
            let client_version = transfer.client_version();
            transfer.finish(lease)?;
            let new_version = lease.record_mut().accept_peer_edit();
            info!("accepted peer edit of {} as version {}", path, new_version);
            Ok(vec![Message::Commit {
                path,
                commit: Commit {
                    base_version,
                    new_version,
                    client_version,
                },
            }])
        }
        TransferKind::CatchUp { remote_base } => {
            if record.state != SyncState::Stale || record.base_version >= remote_base {
                return Err(SyncError::StaleMessage(format!(
                    "{} no longer needs version {} ({})",
                    path, remote_base, record
                )));
            }
            transfer.finish(lease)?;
            lease.record_mut().catch_up(remote_base);
            info!("{} caught up to version {}", path, remote_base);
            Ok(Vec::new())
        }
    }
}
