//! Synchronization logic: chunk serving, inbound transfers, reconciliation
//! of version-advancing messages, and the local-edit relay.

pub mod chunk;
pub mod local;
pub mod reconcile;
pub mod transfer;

pub use chunk::{read_chunk, Chunk};
pub use local::{path_matches, LocalEdits, VersionHub};
pub use reconcile::Reconciler;
pub use transfer::{IncomingTransfer, TransferKind, TransferTable};
