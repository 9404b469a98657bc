//! treesync: file-tree synchronization engine.
//!
//! A peer-to-peer protocol over TCP that keeps per-file version records
//! beside the tracked files and reconciles them with optimistic concurrency.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod meta;
pub mod protocol;
pub mod server;
pub mod sync;

pub use client::Client;
pub use config::Config;
pub use crypto::{CryptoProvider, PlaintextProvider};
pub use error::{ErrorCategory, Result, SyncError};
pub use meta::{FileVersionRecord, Lease, MetadataStore, SyncState};
pub use protocol::Message;
pub use server::{Server, ServerContext, WorkerPool};
pub use sync::{LocalEdits, Reconciler, VersionHub};
